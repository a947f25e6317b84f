pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use middleware::require_auth;
pub use rest::ApiDoc;
pub use state::AppState;
pub use ws_handler::ws_handler;

/// Builds the service's routes. Everything except `/health` requires a bearer credential.
pub fn router(app_state: Arc<AppState>) -> Router {
    let protected_routes = Router::new()
        .route("/chat/message", post(rest::send_message_handler))
        .route("/chat/history", get(rest::list_conversations_handler))
        .route(
            "/chat/{id}",
            get(rest::get_conversation_handler)
                .put(rest::rename_conversation_handler)
                .delete(rest::delete_conversation_handler),
        )
        .route("/chat/{id}/context", get(rest::recent_context_handler))
        .route("/usage", get(rest::usage_handler))
        .route("/analysis/document", post(rest::analyze_document_handler))
        .route("/analysis/plagiarism", post(rest::plagiarism_check_handler))
        .route("/analysis/grammar", post(rest::grammar_check_handler))
        .route("/ws", get(ws_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(rest::health_handler))
        .merge(protected_routes)
        .with_state(app_state)
}
