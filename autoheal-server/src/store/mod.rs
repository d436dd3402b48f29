//! Retry State Store: durable per-commit repair attempts, the webhook event
//! log and the auto-heal history.
//!
//! The store is the single owner of `RetryAttempt` rows. Every other component
//! reads and writes them through [`RetryStore`]. The `(commit, owner, repo)`
//! uniqueness of attempts is the serialization point for concurrent webhook
//! deliveries: [`RetryStore::begin_attempt`] performs the limit check and the
//! increment as one atomic operation.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;

/// Errors raised by store backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The persistence layer could not be reached or written. Fatal for the
    /// current orchestration run.
    #[error("store unavailable during {operation}: {message}")]
    Unavailable {
        operation: &'static str,
        message: String,
    },
    #[error("corrupt {what} in store")]
    Corruption { what: String },
    #[error("no retry attempt recorded for {0}")]
    MissingAttempt(String),
}

impl StoreError {
    pub fn unavailable(operation: &'static str, message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        StoreError::Corruption { what: what.into() }
    }
}

/// Identity of a retry attempt: one commit of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AttemptKey {
    pub commit_sha: String,
    pub repo_owner: String,
    pub repo_name: String,
}

impl AttemptKey {
    pub fn new(
        repo_owner: impl Into<String>,
        repo_name: impl Into<String>,
        commit_sha: impl Into<String>,
    ) -> Self {
        Self {
            commit_sha: commit_sha.into(),
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
        }
    }

    /// Truncated SHA for display (first 7 characters).
    pub fn short_sha(&self) -> &str {
        let end = self
            .commit_sha
            .char_indices()
            .nth(7)
            .map(|(i, _)| i)
            .unwrap_or(self.commit_sha.len());
        &self.commit_sha[..end]
    }
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.repo_owner,
            self.repo_name,
            self.short_sha()
        )
    }
}

/// Lifecycle of a retry attempt.
///
/// `pending -> healing -> {success | exhausted | cancelled}`. `cancelled` is
/// only ever set by an external request, never by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Healing,
    Success,
    Exhausted,
    Cancelled,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Healing => "healing",
            AttemptStatus::Success => "success",
            AttemptStatus::Exhausted => "exhausted",
            AttemptStatus::Cancelled => "cancelled",
        }
    }

    /// No further attempts are made for a commit in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptStatus::Success | AttemptStatus::Exhausted | AttemptStatus::Cancelled
        )
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptStatus::Pending),
            "healing" => Ok(AttemptStatus::Healing),
            "success" => Ok(AttemptStatus::Success),
            "exhausted" => Ok(AttemptStatus::Exhausted),
            "cancelled" => Ok(AttemptStatus::Cancelled),
            other => Err(StoreError::corruption(format!("attempt status '{}'", other))),
        }
    }
}

/// Persisted repair attempts for one commit. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    pub id: i64,
    pub commit_sha: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub workflow_run_id: Option<u64>,
    pub attempt_count: u32,
    pub status: AttemptStatus,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RetryAttempt {
    pub fn key(&self) -> AttemptKey {
        AttemptKey::new(&self.repo_owner, &self.repo_name, &self.commit_sha)
    }
}

/// Partial update of an attempt; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct AttemptUpdate {
    pub status: Option<AttemptStatus>,
    pub last_error: Option<String>,
}

impl AttemptUpdate {
    pub fn status(status: AttemptStatus) -> Self {
        Self {
            status: Some(status),
            last_error: None,
        }
    }

    pub fn last_error(error: impl Into<String>) -> Self {
        Self {
            status: None,
            last_error: Some(error.into()),
        }
    }
}

/// Result of the atomic "check limit, then increment" gate.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptGate {
    /// A new attempt was counted; the row is now `healing`.
    Started(RetryAttempt),
    /// The limit was reached; the row is (now) `exhausted`.
    Exhausted(RetryAttempt),
    /// The row already reached `success` or `cancelled`.
    Terminal(RetryAttempt),
}

/// Webhook delivery about to be logged.
#[derive(Debug, Clone, Default)]
pub struct NewWebhookEvent {
    pub delivery_id: Option<String>,
    pub event_type: String,
    pub action: Option<String>,
    pub repo_owner: Option<String>,
    pub repo_name: Option<String>,
    pub payload_summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub delivery_id: Option<String>,
    pub event_type: String,
    pub action: Option<String>,
    pub repo_owner: Option<String>,
    pub repo_name: Option<String>,
    pub payload_summary: String,
    pub processed: bool,
    pub error: Option<String>,
    pub created_at: i64,
}

/// Audit record of one orchestration run, about to be written.
#[derive(Debug, Clone, Default)]
pub struct NewHistoryEntry {
    pub retry_attempt_id: i64,
    pub error_message: String,
    pub fix_prompt: Option<String>,
    pub fix_applied: Option<String>,
    pub commit_sha_before: Option<String>,
    pub commit_sha_after: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoHealHistory {
    pub id: i64,
    pub retry_attempt_id: i64,
    pub error_message: String,
    pub fix_prompt: Option<String>,
    pub fix_applied: Option<String>,
    pub commit_sha_before: Option<String>,
    pub commit_sha_after: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub created_at: i64,
}

/// Storage backend for retry state, the webhook log and the heal history.
///
/// Every mutation is durable before it returns.
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Existing attempt for `key`, or a new `pending` one with count 0.
    async fn get_or_create(
        &self,
        key: &AttemptKey,
        workflow_run_id: Option<u64>,
    ) -> Result<RetryAttempt, StoreError>;

    async fn get(&self, key: &AttemptKey) -> Result<Option<RetryAttempt>, StoreError>;

    /// `attempt_count += 1`, status `healing`, `last_attempt_at = now`.
    async fn increment(&self, key: &AttemptKey) -> Result<RetryAttempt, StoreError>;

    async fn update(
        &self,
        key: &AttemptKey,
        update: AttemptUpdate,
    ) -> Result<RetryAttempt, StoreError>;

    /// True iff the stored `attempt_count >= limit` (a missing row counts as 0).
    async fn is_max_retries_reached(&self, key: &AttemptKey, limit: u32)
        -> Result<bool, StoreError>;

    /// Move a `pending` or `healing` attempt to `success`. A terminal row is
    /// left untouched; the returned row shows which status won.
    async fn resolve(&self, key: &AttemptKey) -> Result<RetryAttempt, StoreError>;

    /// Set status `exhausted` unconditionally. Idempotent.
    async fn mark_exhausted(&self, key: &AttemptKey) -> Result<RetryAttempt, StoreError>;

    /// Atomically: get-or-create, stop on a terminal row, mark exhausted when
    /// `attempt_count >= limit`, otherwise increment.
    async fn begin_attempt(
        &self,
        key: &AttemptKey,
        workflow_run_id: Option<u64>,
        limit: u32,
    ) -> Result<AttemptGate, StoreError>;

    /// External cancellation. Returns `None` when no attempt exists.
    async fn cancel(&self, key: &AttemptKey) -> Result<Option<RetryAttempt>, StoreError>;

    /// All attempts, most recently updated first.
    async fn list_attempts(&self) -> Result<Vec<RetryAttempt>, StoreError>;

    /// Append an unprocessed webhook event, returning its id.
    async fn log_webhook_event(&self, event: &NewWebhookEvent) -> Result<i64, StoreError>;

    /// Mark a logged event processed, recording the handler error if any.
    async fn finalize_webhook_event(&self, id: i64, error: Option<&str>)
        -> Result<(), StoreError>;

    async fn recent_webhook_events(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError>;

    async fn record_history(&self, entry: &NewHistoryEntry) -> Result<i64, StoreError>;

    async fn history_for_attempt(
        &self,
        retry_attempt_id: i64,
    ) -> Result<Vec<AutoHealHistory>, StoreError>;
}

/// Current unix time in seconds.
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
