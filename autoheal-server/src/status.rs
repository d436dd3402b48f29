//! `GET /status`: retry attempts and recent webhook deliveries as JSON.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::store::{AttemptStatus, RetryAttempt, WebhookEvent};
use crate::AppState;

/// Number of webhook deliveries included in the status response.
const RECENT_EVENTS: usize = 50;

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct StatusSummary {
    pub total_attempts: usize,
    pub pending: usize,
    pub healing: usize,
    pub success: usize,
    pub exhausted: usize,
    pub cancelled: usize,
}

#[derive(Debug, Serialize)]
pub struct AttemptEntry {
    pub repo_owner: String,
    pub repo_name: String,
    pub commit_sha: String,
    pub workflow_run_id: Option<u64>,
    pub attempt_count: u32,
    pub status: String,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<i64>,
    pub updated_at: i64,
}

#[derive(Debug, Serialize)]
pub struct EventEntry {
    pub id: i64,
    pub delivery_id: Option<String>,
    pub event_type: String,
    pub action: Option<String>,
    pub repository: Option<String>,
    pub processed: bool,
    pub error: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub summary: StatusSummary,
    pub attempts: Vec<AttemptEntry>,
    pub recent_events: Vec<EventEntry>,
}

impl StatusData {
    pub fn new(attempts: Vec<RetryAttempt>, events: Vec<WebhookEvent>) -> Self {
        let mut summary = StatusSummary {
            total_attempts: attempts.len(),
            ..Default::default()
        };

        let attempts = attempts
            .into_iter()
            .map(|attempt| {
                match attempt.status {
                    AttemptStatus::Pending => summary.pending += 1,
                    AttemptStatus::Healing => summary.healing += 1,
                    AttemptStatus::Success => summary.success += 1,
                    AttemptStatus::Exhausted => summary.exhausted += 1,
                    AttemptStatus::Cancelled => summary.cancelled += 1,
                }
                AttemptEntry {
                    repo_owner: attempt.repo_owner,
                    repo_name: attempt.repo_name,
                    commit_sha: attempt.commit_sha,
                    workflow_run_id: attempt.workflow_run_id,
                    attempt_count: attempt.attempt_count,
                    status: attempt.status.to_string(),
                    last_error: attempt.last_error,
                    last_attempt_at: attempt.last_attempt_at,
                    updated_at: attempt.updated_at,
                }
            })
            .collect();

        let recent_events = events
            .into_iter()
            .map(|event| EventEntry {
                repository: match (&event.repo_owner, &event.repo_name) {
                    (Some(owner), Some(name)) => Some(format!("{}/{}", owner, name)),
                    _ => None,
                },
                id: event.id,
                delivery_id: event.delivery_id,
                event_type: event.event_type,
                action: event.action,
                processed: event.processed,
                error: event.error,
                created_at: event.created_at,
            })
            .collect();

        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            summary,
            attempts,
            recent_events,
        }
    }
}

/// Check the bearer token. An unset token disables the endpoint.
#[allow(clippy::result_large_err)]
fn validate_auth(headers: &HeaderMap, auth_token: &Option<String>) -> Result<(), Response> {
    let Some(expected_token) = auth_token else {
        return Err((
            StatusCode::FORBIDDEN,
            "Status endpoint is disabled (STATUS_AUTH_TOKEN not configured)",
        )
            .into_response());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(provided) if provided == expected_token => Ok(()),
        Some(_) => Err((StatusCode::UNAUTHORIZED, "Invalid token").into_response()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            "Missing or malformed Authorization header. Expected: Bearer <token>",
        )
            .into_response()),
    }
}

pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusData>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;

    let unavailable = |e: crate::store::StoreError| {
        tracing::error!("Failed to load status: {}", e);
        (StatusCode::SERVICE_UNAVAILABLE, "Failed to query state store").into_response()
    };

    let attempts = state.store.list_attempts().await.map_err(unavailable)?;
    let events = state
        .store
        .recent_webhook_events(RECENT_EVENTS)
        .await
        .map_err(unavailable)?;

    Ok(Json(StatusData::new(attempts, events)))
}
