pub mod applier;
pub mod config;
pub mod context;
pub mod git;
pub mod github;
pub mod orchestrator;
pub mod status;
pub mod store;
pub mod webhook;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use autoheal_core::RecordingLogger;
pub use orchestrator::{AutoHealer, HealConfig, HealOutcome, HealTrigger};
pub use store::{RetryStore, SqliteStore};
pub use webhook::WebhookRouter;

pub struct AppState {
    pub router: Arc<WebhookRouter>,
    pub store: Arc<dyn RetryStore>,
    pub recording_logger: Option<RecordingLogger>,
    pub status_auth_token: Option<String>,
}

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "autoheal"
    })))
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status::status_handler))
        .route("/webhook", post(webhook::github_webhook_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
