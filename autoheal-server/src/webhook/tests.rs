use std::sync::Mutex as StdMutex;

use super::*;
use crate::store::InMemoryStore;

const SECRET: &str = "It's a Secret to Everybody";

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Default)]
struct RecordingHandler {
    triggers: StdMutex<Vec<HealTrigger>>,
    fail: bool,
}

#[async_trait]
impl FailureHandler for RecordingHandler {
    async fn handle_failure(&self, trigger: &HealTrigger) -> Result<HealOutcome, HealError> {
        self.triggers.lock().unwrap().push(trigger.clone());
        if self.fail {
            return Err(HealError::FixProvider(anyhow::anyhow!("provider down")));
        }
        Ok(HealOutcome::NoFixAvailable)
    }
}

fn router(handler: Arc<RecordingHandler>) -> (WebhookRouter, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::default());
    let router = WebhookRouter::new(SECRET.to_string(), store.clone(), handler, false);
    (router, store)
}

fn workflow_run_body(action: &str, conclusion: Option<&str>) -> Vec<u8> {
    serde_json::json!({
        "action": action,
        "repository": {
            "name": "widgets",
            "full_name": "acme/widgets",
            "owner": { "login": "acme" }
        },
        "installation": { "id": 77 },
        "workflow_run": {
            "id": 123,
            "name": "CI",
            "head_sha": "abc123def456",
            "head_branch": "main",
            "status": "completed",
            "conclusion": conclusion,
            "run_attempt": 2
        }
    })
    .to_string()
    .into_bytes()
}

#[test]
fn test_verify_github_signature() {
    let body = b"Hello, World!";
    // Example from GitHub's webhook documentation
    let signature = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
    assert!(verify_github_signature(SECRET, body, signature));
    assert_eq!(sign(SECRET, body), signature);
}

#[test]
fn test_verify_rejects_malformed_signatures() {
    let body = b"Hello, World!";
    let valid = sign(SECRET, body);
    assert!(!verify_github_signature("other secret", body, &valid));
    assert!(!verify_github_signature(SECRET, b"Hello, World?", &valid));
    assert!(!verify_github_signature(SECRET, body, valid.trim_start_matches("sha256=")));
    assert!(!verify_github_signature(SECRET, body, "sha256=not-hex"));
    assert!(!verify_github_signature(SECRET, body, ""));
}

#[tokio::test]
async fn test_bad_signature_has_no_side_effects() {
    let handler = Arc::new(RecordingHandler::default());
    let (router, store) = router(handler.clone());
    let body = workflow_run_body("completed", Some("failure"));

    let result = router
        .handle("workflow_run", Some("d-1"), Some("sha256=00"), &body)
        .await;
    assert!(matches!(result, Err(WebhookError::SignatureVerification)));

    let result = router.handle("workflow_run", Some("d-1"), None, &body).await;
    assert!(matches!(result, Err(WebhookError::SignatureVerification)));

    assert!(store.recent_webhook_events(10).await.unwrap().is_empty());
    assert!(handler.triggers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_run_is_dispatched_and_finalized() {
    let handler = Arc::new(RecordingHandler::default());
    let (router, store) = router(handler.clone());
    let body = workflow_run_body("completed", Some("failure"));
    let signature = sign(SECRET, &body);

    let outcome = router
        .handle("workflow_run", Some("d-2"), Some(&signature), &body)
        .await
        .unwrap();
    assert_eq!(outcome, Some(HealOutcome::NoFixAvailable));

    let triggers = handler.triggers.lock().unwrap().clone();
    assert_eq!(
        triggers,
        vec![HealTrigger {
            repo_owner: "acme".to_string(),
            repo_name: "widgets".to_string(),
            commit_sha: "abc123def456".to_string(),
            workflow_run_id: 123,
            installation_id: Some(77),
            failed_jobs: vec!["CI".to_string()],
            attempt_number: 2,
            dry_run: false,
        }]
    );

    let events = store.recent_webhook_events(10).await.unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.delivery_id.as_deref(), Some("d-2"));
    assert_eq!(event.event_type, "workflow_run");
    assert_eq!(event.action.as_deref(), Some("completed"));
    assert_eq!(event.repo_owner.as_deref(), Some("acme"));
    assert_eq!(event.repo_name.as_deref(), Some("widgets"));
    assert!(event.processed);
    assert_eq!(event.error, None);

    let summary: serde_json::Value = serde_json::from_str(&event.payload_summary).unwrap();
    assert_eq!(summary["workflow_run"]["id"], 123);
    assert_eq!(summary["repository"], "acme/widgets");
}

#[tokio::test]
async fn test_successful_and_in_progress_runs_are_ignored() {
    let handler = Arc::new(RecordingHandler::default());
    let (router, store) = router(handler.clone());

    for body in [
        workflow_run_body("completed", Some("success")),
        workflow_run_body("completed", Some("cancelled")),
        workflow_run_body("requested", None),
        workflow_run_body("in_progress", None),
    ] {
        let signature = sign(SECRET, &body);
        let outcome = router
            .handle("workflow_run", None, Some(&signature), &body)
            .await
            .unwrap();
        assert_eq!(outcome, None);
    }

    assert!(handler.triggers.lock().unwrap().is_empty());
    let events = store.recent_webhook_events(10).await.unwrap();
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|e| e.processed && e.error.is_none()));
}

#[tokio::test]
async fn test_other_event_types_are_logged_and_ignored() {
    let handler = Arc::new(RecordingHandler::default());
    let (router, store) = router(handler.clone());
    let body = br#"{"zen":"Keep it logically awesome.","hook_id":1}"#;
    let signature = sign(SECRET, body);

    let outcome = router
        .handle("ping", Some("d-3"), Some(&signature), body)
        .await
        .unwrap();
    assert_eq!(outcome, None);

    let events = store.recent_webhook_events(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "ping");
    assert!(events[0].processed);
}

#[tokio::test]
async fn test_malformed_payload_is_logged_with_error() {
    let handler = Arc::new(RecordingHandler::default());
    let (router, store) = router(handler.clone());
    let body = b"{not json";
    let signature = sign(SECRET, body);

    let result = router
        .handle("workflow_run", Some("d-4"), Some(&signature), body)
        .await;
    assert!(matches!(result, Err(WebhookError::MalformedPayload(_))));

    let events = store.recent_webhook_events(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].processed);
    assert!(events[0].error.is_some());
    assert!(handler.triggers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_workflow_run_without_run_is_malformed() {
    let handler = Arc::new(RecordingHandler::default());
    let (router, store) = router(handler.clone());
    let body = br#"{"action":"completed"}"#;
    let signature = sign(SECRET, body);

    let result = router
        .handle("workflow_run", None, Some(&signature), body)
        .await;
    assert!(matches!(result, Err(WebhookError::MalformedPayload(_))));

    let events = store.recent_webhook_events(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].error.is_some());
}

#[tokio::test]
async fn test_handler_error_is_recorded_on_event() {
    let handler = Arc::new(RecordingHandler {
        fail: true,
        ..RecordingHandler::default()
    });
    let (router, store) = router(handler.clone());
    let body = workflow_run_body("completed", Some("failure"));
    let signature = sign(SECRET, &body);

    let result = router
        .handle("workflow_run", None, Some(&signature), &body)
        .await;
    assert!(matches!(result, Err(WebhookError::Handler(_))));

    let events = store.recent_webhook_events(10).await.unwrap();
    assert!(events[0].processed);
    assert!(events[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("provider down")));
}

#[tokio::test]
async fn test_router_dry_run_flag_reaches_trigger() {
    let handler = Arc::new(RecordingHandler::default());
    let store = Arc::new(InMemoryStore::default());
    let router = WebhookRouter::new(SECRET.to_string(), store, handler.clone(), true);
    let body = workflow_run_body("completed", Some("failure"));
    let signature = sign(SECRET, &body);

    router
        .handle("workflow_run", None, Some(&signature), &body)
        .await
        .unwrap();
    assert!(handler.triggers.lock().unwrap()[0].dry_run);
}
