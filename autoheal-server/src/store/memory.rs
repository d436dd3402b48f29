//! In-memory implementation of `RetryStore`.
//!
//! All state is lost on restart. Used by tests that exercise the orchestrator
//! and the webhook router without touching disk.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    now_secs, AttemptGate, AttemptKey, AttemptStatus, AttemptUpdate, AutoHealHistory,
    NewHistoryEntry, NewWebhookEvent, RetryAttempt, RetryStore, StoreError, WebhookEvent,
};

#[derive(Default)]
struct Inner {
    attempts: HashMap<AttemptKey, RetryAttempt>,
    events: Vec<WebhookEvent>,
    history: Vec<AutoHealHistory>,
    next_attempt_id: i64,
}

impl Inner {
    fn get_or_create(
        &mut self,
        key: &AttemptKey,
        workflow_run_id: Option<u64>,
    ) -> &mut RetryAttempt {
        let next_id = &mut self.next_attempt_id;
        let attempt = self.attempts.entry(key.clone()).or_insert_with(|| {
            *next_id += 1;
            let now = now_secs();
            RetryAttempt {
                id: *next_id,
                commit_sha: key.commit_sha.clone(),
                repo_owner: key.repo_owner.clone(),
                repo_name: key.repo_name.clone(),
                workflow_run_id,
                attempt_count: 0,
                status: AttemptStatus::Pending,
                last_error: None,
                last_attempt_at: None,
                created_at: now,
                updated_at: now,
            }
        });
        if workflow_run_id.is_some() {
            attempt.workflow_run_id = workflow_run_id;
        }
        attempt
    }
}

/// In-memory retry store.
///
/// A single mutex guards all tables, so every operation (including
/// `begin_attempt`) is atomic with respect to the others.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn increment_attempt(attempt: &mut RetryAttempt) {
    let now = now_secs();
    attempt.attempt_count += 1;
    attempt.status = AttemptStatus::Healing;
    attempt.last_attempt_at = Some(now);
    attempt.updated_at = now;
}

fn exhaust_attempt(attempt: &mut RetryAttempt) {
    attempt.status = AttemptStatus::Exhausted;
    attempt.updated_at = now_secs();
}

#[async_trait]
impl RetryStore for InMemoryStore {
    async fn get_or_create(
        &self,
        key: &AttemptKey,
        workflow_run_id: Option<u64>,
    ) -> Result<RetryAttempt, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.get_or_create(key, workflow_run_id).clone())
    }

    async fn get(&self, key: &AttemptKey) -> Result<Option<RetryAttempt>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.attempts.get(key).cloned())
    }

    async fn increment(&self, key: &AttemptKey) -> Result<RetryAttempt, StoreError> {
        let mut inner = self.inner.lock().await;
        let attempt = inner.get_or_create(key, None);
        increment_attempt(attempt);
        Ok(attempt.clone())
    }

    async fn update(
        &self,
        key: &AttemptKey,
        update: AttemptUpdate,
    ) -> Result<RetryAttempt, StoreError> {
        let mut inner = self.inner.lock().await;
        let attempt = inner
            .attempts
            .get_mut(key)
            .ok_or_else(|| StoreError::MissingAttempt(key.to_string()))?;
        if let Some(status) = update.status {
            attempt.status = status;
        }
        if let Some(error) = update.last_error {
            attempt.last_error = Some(error);
        }
        attempt.updated_at = now_secs();
        Ok(attempt.clone())
    }

    async fn resolve(&self, key: &AttemptKey) -> Result<RetryAttempt, StoreError> {
        let mut inner = self.inner.lock().await;
        let attempt = inner
            .attempts
            .get_mut(key)
            .ok_or_else(|| StoreError::MissingAttempt(key.to_string()))?;
        if !attempt.status.is_terminal() {
            attempt.status = AttemptStatus::Success;
            attempt.updated_at = now_secs();
        }
        Ok(attempt.clone())
    }

    async fn is_max_retries_reached(
        &self,
        key: &AttemptKey,
        limit: u32,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        let count = inner.attempts.get(key).map_or(0, |a| a.attempt_count);
        Ok(count >= limit)
    }

    async fn mark_exhausted(&self, key: &AttemptKey) -> Result<RetryAttempt, StoreError> {
        let mut inner = self.inner.lock().await;
        let attempt = inner.get_or_create(key, None);
        exhaust_attempt(attempt);
        Ok(attempt.clone())
    }

    async fn begin_attempt(
        &self,
        key: &AttemptKey,
        workflow_run_id: Option<u64>,
        limit: u32,
    ) -> Result<AttemptGate, StoreError> {
        let mut inner = self.inner.lock().await;
        let attempt = inner.get_or_create(key, workflow_run_id);

        match attempt.status {
            AttemptStatus::Success | AttemptStatus::Cancelled => {
                return Ok(AttemptGate::Terminal(attempt.clone()))
            }
            AttemptStatus::Exhausted => return Ok(AttemptGate::Exhausted(attempt.clone())),
            AttemptStatus::Pending | AttemptStatus::Healing => {}
        }

        if attempt.attempt_count >= limit {
            exhaust_attempt(attempt);
            return Ok(AttemptGate::Exhausted(attempt.clone()));
        }

        increment_attempt(attempt);
        Ok(AttemptGate::Started(attempt.clone()))
    }

    async fn cancel(&self, key: &AttemptKey) -> Result<Option<RetryAttempt>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.attempts.get_mut(key).map(|attempt| {
            attempt.status = AttemptStatus::Cancelled;
            attempt.updated_at = now_secs();
            attempt.clone()
        }))
    }

    async fn list_attempts(&self) -> Result<Vec<RetryAttempt>, StoreError> {
        let inner = self.inner.lock().await;
        let mut attempts: Vec<_> = inner.attempts.values().cloned().collect();
        attempts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(attempts)
    }

    async fn log_webhook_event(&self, event: &NewWebhookEvent) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let id = inner.events.len() as i64 + 1;
        inner.events.push(WebhookEvent {
            id,
            delivery_id: event.delivery_id.clone(),
            event_type: event.event_type.clone(),
            action: event.action.clone(),
            repo_owner: event.repo_owner.clone(),
            repo_name: event.repo_name.clone(),
            payload_summary: event.payload_summary.clone(),
            processed: false,
            error: None,
            created_at: now_secs(),
        });
        Ok(id)
    }

    async fn finalize_webhook_event(
        &self,
        id: i64,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.events.iter_mut().find(|e| e.id == id) {
            event.processed = true;
            event.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn recent_webhook_events(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.events.iter().rev().take(limit).cloned().collect())
    }

    async fn record_history(&self, entry: &NewHistoryEntry) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner
            .attempts
            .values()
            .any(|a| a.id == entry.retry_attempt_id)
        {
            return Err(StoreError::MissingAttempt(format!(
                "attempt id {}",
                entry.retry_attempt_id
            )));
        }
        let id = inner.history.len() as i64 + 1;
        inner.history.push(AutoHealHistory {
            id,
            retry_attempt_id: entry.retry_attempt_id,
            error_message: entry.error_message.clone(),
            fix_prompt: entry.fix_prompt.clone(),
            fix_applied: entry.fix_applied.clone(),
            commit_sha_before: entry.commit_sha_before.clone(),
            commit_sha_after: entry.commit_sha_after.clone(),
            success: entry.success,
            duration_ms: entry.duration_ms,
            created_at: now_secs(),
        });
        Ok(id)
    }

    async fn history_for_attempt(
        &self,
        retry_attempt_id: i64,
    ) -> Result<Vec<AutoHealHistory>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .history
            .iter()
            .filter(|h| h.retry_attempt_id == retry_attempt_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AttemptKey {
        AttemptKey::new("acme", "widgets", "abc123")
    }

    #[tokio::test]
    async fn test_resolve_keeps_cancelled_status() {
        let store = InMemoryStore::new();
        store.begin_attempt(&key(), None, 3).await.unwrap();
        store.cancel(&key()).await.unwrap();

        let attempt = store.resolve(&key()).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_begin_attempt_stops_at_limit() {
        let store = InMemoryStore::new();

        for expected in 1..=3 {
            match store.begin_attempt(&key(), Some(7), 3).await.unwrap() {
                AttemptGate::Started(attempt) => {
                    assert_eq!(attempt.attempt_count, expected);
                    assert_eq!(attempt.status, AttemptStatus::Healing);
                    assert_eq!(attempt.workflow_run_id, Some(7));
                }
                other => panic!("expected Started, got {:?}", other),
            }
        }

        match store.begin_attempt(&key(), Some(8), 3).await.unwrap() {
            AttemptGate::Exhausted(attempt) => {
                assert_eq!(attempt.attempt_count, 3);
                assert_eq!(attempt.status, AttemptStatus::Exhausted);
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_attempt_is_not_incremented() {
        let store = InMemoryStore::new();
        store.get_or_create(&key(), None).await.unwrap();
        store
            .update(&key(), AttemptUpdate::status(AttemptStatus::Success))
            .await
            .unwrap();

        let gate = store.begin_attempt(&key(), None, 3).await.unwrap();
        assert!(matches!(gate, AttemptGate::Terminal(ref a) if a.attempt_count == 0));
    }

    #[tokio::test]
    async fn test_update_missing_attempt_fails() {
        let store = InMemoryStore::new();
        let result = store
            .update(&key(), AttemptUpdate::last_error("boom"))
            .await;
        assert!(matches!(result, Err(StoreError::MissingAttempt(_))));
    }

    #[tokio::test]
    async fn test_cancel_missing_attempt_returns_none() {
        let store = InMemoryStore::new();
        assert!(store.cancel(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_webhook_events_are_newest_first() {
        let store = InMemoryStore::new();
        for event_type in ["ping", "push", "workflow_run"] {
            store
                .log_webhook_event(&NewWebhookEvent {
                    event_type: event_type.to_string(),
                    payload_summary: "{}".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        store.finalize_webhook_event(3, Some("boom")).await.unwrap();

        let events = store.recent_webhook_events(2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "workflow_run");
        assert!(events[0].processed);
        assert_eq!(events[0].error.as_deref(), Some("boom"));
        assert_eq!(events[1].event_type, "push");
        assert!(!events[1].processed);
    }
}
