//! Webhook Router: verifies, logs and dispatches GitHub deliveries.
//!
//! [`WebhookRouter::accept`] does the cheap, synchronous part of a delivery
//! (signature check, parse, event log row) so the HTTP endpoint can answer
//! quickly. [`WebhookRouter::dispatch`] runs the handler and always finalizes
//! the event row before returning the handler's result. Deliveries are
//! at-least-once; the retry attempt key makes redelivered failures safe.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use autoheal_core::{Direction, EventType, RecordedEvent, Sanitizer};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::orchestrator::{AutoHealer, HealError, HealOutcome, HealTrigger};
use crate::store::{NewWebhookEvent, RetryStore, StoreError};
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook signature verification failed")]
    SignatureVerification,
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Handler(#[from] HealError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub repository: Option<Repository>,
    pub installation: Option<Installation>,
    pub workflow_run: Option<WorkflowRun>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: User,
}

#[derive(Debug, Deserialize, Clone)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowRun {
    pub id: u64,
    pub name: Option<String>,
    pub head_sha: String,
    pub head_branch: Option<String>,
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub run_attempt: Option<u32>,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
    pub event_id: Option<i64>,
}

/// A verified, logged delivery waiting to be dispatched.
#[derive(Debug, Clone)]
pub struct AcceptedEvent {
    pub event_id: i64,
    pub event_type: String,
    pub payload: WebhookPayload,
}

/// Receiver of failed workflow runs.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn handle_failure(&self, trigger: &HealTrigger) -> Result<HealOutcome, HealError>;
}

#[async_trait]
impl FailureHandler for AutoHealer {
    async fn handle_failure(&self, trigger: &HealTrigger) -> Result<HealOutcome, HealError> {
        AutoHealer::handle_failure(self, trigger).await
    }
}

type HmacSha256 = Hmac<Sha256>;

pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Constant-time comparison
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Short JSON description of a delivery for the event log.
fn summarize(payload: &WebhookPayload) -> String {
    serde_json::json!({
        "action": payload.action,
        "repository": payload.repository.as_ref().map(|r| &r.full_name),
        "installation": payload.installation.as_ref().map(|i| i.id),
        "workflow_run": payload.workflow_run.as_ref().map(|run| serde_json::json!({
            "id": run.id,
            "name": run.name,
            "head_sha": run.head_sha,
            "head_branch": run.head_branch,
            "conclusion": run.conclusion,
            "run_attempt": run.run_attempt,
        })),
    })
    .to_string()
}

pub struct WebhookRouter {
    secret: String,
    store: Arc<dyn RetryStore>,
    handler: Arc<dyn FailureHandler>,
    dry_run: bool,
}

impl WebhookRouter {
    pub fn new(
        secret: String,
        store: Arc<dyn RetryStore>,
        handler: Arc<dyn FailureHandler>,
        dry_run: bool,
    ) -> Self {
        Self {
            secret,
            store,
            handler,
            dry_run,
        }
    }

    /// Verify and log a delivery.
    ///
    /// A bad signature is rejected before anything is written. A body that
    /// is not a valid payload is logged with its parse error and rejected.
    pub async fn accept(
        &self,
        event_type: &str,
        delivery_id: Option<&str>,
        signature: Option<&str>,
        raw_body: &[u8],
    ) -> Result<AcceptedEvent, WebhookError> {
        let verified = signature
            .map(|sig| verify_github_signature(&self.secret, raw_body, sig))
            .unwrap_or(false);
        if !verified {
            warn!("Rejecting {} webhook with invalid signature", event_type);
            return Err(WebhookError::SignatureVerification);
        }

        let mut event = NewWebhookEvent {
            delivery_id: delivery_id.map(str::to_string),
            event_type: event_type.to_string(),
            ..NewWebhookEvent::default()
        };

        let payload: WebhookPayload = match serde_json::from_slice(raw_body) {
            Ok(payload) => payload,
            Err(e) => {
                let message = e.to_string();
                event.payload_summary = format!("unparseable payload ({} bytes)", raw_body.len());
                let id = self.store.log_webhook_event(&event).await?;
                self.store
                    .finalize_webhook_event(id, Some(&message))
                    .await?;
                warn!("Malformed {} webhook payload: {}", event_type, message);
                return Err(WebhookError::MalformedPayload(message));
            }
        };

        event.action = payload.action.clone();
        event.repo_owner = payload.repository.as_ref().map(|r| r.owner.login.clone());
        event.repo_name = payload.repository.as_ref().map(|r| r.name.clone());
        event.payload_summary = summarize(&payload);

        let event_id = self.store.log_webhook_event(&event).await?;
        info!(
            "Accepted {} webhook (action: {:?}, event id {})",
            event_type, payload.action, event_id
        );

        Ok(AcceptedEvent {
            event_id,
            event_type: event_type.to_string(),
            payload,
        })
    }

    /// Run the handler for an accepted delivery, then finalize its log row.
    pub async fn dispatch(
        &self,
        accepted: AcceptedEvent,
    ) -> Result<Option<HealOutcome>, WebhookError> {
        let result = self.route(&accepted).await;

        let error_message = result.as_ref().err().map(ToString::to_string);
        if let Err(e) = self
            .store
            .finalize_webhook_event(accepted.event_id, error_message.as_deref())
            .await
        {
            error!(
                "Failed to finalize webhook event {}: {}",
                accepted.event_id, e
            );
            if result.is_ok() {
                return Err(e.into());
            }
        }

        result
    }

    /// `accept` followed by `dispatch`, for callers that wait for the result.
    pub async fn handle(
        &self,
        event_type: &str,
        delivery_id: Option<&str>,
        signature: Option<&str>,
        raw_body: &[u8],
    ) -> Result<Option<HealOutcome>, WebhookError> {
        let accepted = self
            .accept(event_type, delivery_id, signature, raw_body)
            .await?;
        self.dispatch(accepted).await
    }

    async fn route(&self, accepted: &AcceptedEvent) -> Result<Option<HealOutcome>, WebhookError> {
        match accepted.event_type.as_str() {
            "workflow_run" => self.handle_workflow_run(&accepted.payload).await,
            "ping" => {
                info!("Received ping webhook");
                Ok(None)
            }
            other => {
                info!("Ignoring {} webhook", other);
                Ok(None)
            }
        }
    }

    async fn handle_workflow_run(
        &self,
        payload: &WebhookPayload,
    ) -> Result<Option<HealOutcome>, WebhookError> {
        let (Some(run), Some(repo)) = (&payload.workflow_run, &payload.repository) else {
            return Err(WebhookError::MalformedPayload(
                "workflow_run event without workflow_run or repository".to_string(),
            ));
        };

        if payload.action.as_deref() != Some("completed") {
            info!(
                "Ignoring workflow run {} with action {:?}",
                run.id, payload.action
            );
            return Ok(None);
        }

        if run.conclusion.as_deref() != Some("failure") {
            info!(
                "Workflow run {} in {} concluded with {:?}; nothing to heal",
                run.id, repo.full_name, run.conclusion
            );
            return Ok(None);
        }

        let trigger = HealTrigger {
            repo_owner: repo.owner.login.clone(),
            repo_name: repo.name.clone(),
            commit_sha: run.head_sha.clone(),
            workflow_run_id: run.id,
            installation_id: payload.installation.as_ref().map(|i| i.id),
            failed_jobs: run.name.iter().cloned().collect(),
            attempt_number: run.run_attempt.unwrap_or(1),
            dry_run: self.dry_run,
        };

        info!(
            "Workflow run {} ({}) failed in {} at {}",
            run.id,
            run.name.as_deref().unwrap_or("unnamed"),
            repo.full_name,
            run.head_sha
        );

        let outcome = self.handler.handle_failure(&trigger).await?;
        Ok(Some(outcome))
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

fn headers_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value_str) = value.to_str() {
            map.insert(name.to_string(), value_str.to_string());
        }
    }
    map
}

/// `POST /webhook`: acknowledge with 202 and dispatch in the background.
pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event_type = header(&headers, EVENT_HEADER).unwrap_or("unknown");
    let delivery_id = header(&headers, DELIVERY_HEADER);
    let signature = header(&headers, SIGNATURE_HEADER);

    let accepted = match state
        .router
        .accept(event_type, delivery_id, signature, &body)
        .await
    {
        Ok(accepted) => accepted,
        Err(WebhookError::SignatureVerification) => {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(WebhookError::MalformedPayload(message)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse {
                    message,
                    event_id: None,
                }),
            )
                .into_response();
        }
        Err(e) => {
            error!("Failed to accept webhook: {}", e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    if let Some(ref logger) = state.recording_logger {
        let correlation_id = delivery_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        logger.record(RecordedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id,
            event_type: EventType::WebhookReceived,
            direction: Direction::Request,
            operation: "webhook".to_string(),
            data: serde_json::json!({
                "headers": Sanitizer::sanitize_headers(&headers_to_hashmap(&headers)),
                "body": Sanitizer::sanitize_json(
                    &serde_json::from_slice::<serde_json::Value>(&body)
                        .unwrap_or(serde_json::Value::Null)
                ),
            }),
            metadata: HashMap::from([("event_type".to_string(), event_type.to_string())]),
        });
    }

    let event_id = accepted.event_id;
    let router = state.router.clone();
    tokio::spawn(async move {
        match router.dispatch(accepted).await {
            Ok(Some(outcome)) => info!("Webhook event {} handled: {:?}", event_id, outcome),
            Ok(None) => {}
            Err(e) => error!("Webhook event {} failed: {}", event_id, e),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            message: "Accepted".to_string(),
            event_id: Some(event_id),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests;
