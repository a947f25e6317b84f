//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, InMemoryDatabase, JwtIdentityAdapter, OpenAiGenerationAdapter},
    chat::{ChannelDispatcher, ConnectionHub},
    config::Config,
    error::ApiError,
    web::{self, ApiDoc, AppState},
};
use async_openai::{config::OpenAIConfig, Client};
use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    Router,
};
use research_assistant_core::ports::{DatabaseService, DocumentService};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    let (db, documents): (Arc<dyn DatabaseService>, Arc<dyn DocumentService>) =
        match &config.database_url {
            Some(database_url) => {
                info!("Connecting to database...");
                let db_pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(database_url)
                    .await?;
                let db_adapter = Arc::new(DbAdapter::new(db_pool));
                info!("Running database migrations...");
                db_adapter.run_migrations().await?;
                info!("Database migrations complete.");
                let db: Arc<dyn DatabaseService> = db_adapter.clone();
                let documents: Arc<dyn DocumentService> = db_adapter;
                (db, documents)
            }
            None => {
                warn!("DATABASE_URL is not set; using the in-memory store. Data will not survive a restart.");
                let memory = Arc::new(InMemoryDatabase::new());
                let db: Arc<dyn DatabaseService> = memory.clone();
                let documents: Arc<dyn DocumentService> = memory;
                (db, documents)
            }
        };

    // --- 3. Initialize Service Adapters ---
    let openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| ApiError::Internal("OPENAI_API_KEY is required".to_string()))?,
    );
    let openai_client = Client::with_config(openai_config);
    let generator = Arc::new(OpenAiGenerationAdapter::new(
        openai_client,
        config.generation_model.clone(),
    ));
    let identity = Arc::new(JwtIdentityAdapter::new(&config.jwt_secret));

    // --- 4. Build the Orchestrator & Shared AppState ---
    let dispatcher = Arc::new(ChannelDispatcher::new(
        db.clone(),
        documents,
        generator,
        Arc::new(ConnectionHub::default()),
        config.quota,
        config.chat.clone(),
    ));
    let app_state = Arc::new(AppState {
        db,
        identity,
        dispatcher,
    });

    let client_origin = config.client_origin.parse::<HeaderValue>().map_err(|e| {
        ApiError::Internal(format!("Invalid CLIENT_ORIGIN '{}': {}", config.client_origin, e))
    })?;
    let cors = CorsLayer::new()
        .allow_origin(client_origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);

    // --- 5. Create the Web Router ---
    let api_router = web::router(app_state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
