//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{debug, error};

use crate::web::state::AppState;

/// Middleware that verifies the bearer credential and resolves the caller.
///
/// If valid, the user row is created or its tier synchronised, and the
/// `AuthenticatedUser` is inserted into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // 1. Extract the credential. Browsers cannot set headers on a WebSocket
    // upgrade, so upgrades may carry it in the query string instead.
    let credential = bearer_token(req.headers())
        .or_else(|| {
            is_websocket_upgrade(req.headers())
                .then(|| query_token(req.uri().query()))
                .flatten()
        })
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // 2. Verify it with the identity provider
    let user = state.identity.authenticate(&credential).await.map_err(|e| {
        debug!("Rejected credential: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    // 3. Make sure the user row exists and carries the current tier
    state
        .db
        .get_or_create_user(user.user_id, user.tier)
        .await
        .map_err(|e| {
            error!("Failed to load user {}: {:?}", user.user_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    // 4. Insert the user into request extensions
    req.extensions_mut().insert(user);

    // 5. Continue to the handler
    Ok(next.run(req).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
