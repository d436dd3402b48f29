//! SQLite implementation of `RetryStore`.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version. A database written by a newer
//! version of the service is refused rather than guessed at.

mod attempts;
mod events;
mod history;


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{
    now_secs, AttemptGate, AttemptKey, AttemptUpdate, AutoHealHistory, NewHistoryEntry,
    NewWebhookEvent, RetryAttempt, RetryStore, StoreError, WebhookEvent,
};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed retry store.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime. The single connection behind a mutex
/// serializes writers inside this process; `BEGIN IMMEDIATE` transactions
/// serialize them across processes sharing the file.
pub struct SqliteStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path` and bring its schema up to date.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for concurrent readers and crash safety
    /// - `synchronous = FULL` so a returned write survives power loss
    /// - `busy_timeout = 5000ms` to wait out writers in other processes
    /// - `foreign_keys = ON` so history rows always reference an attempt
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::unavailable(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::unavailable("open database", e.to_string()))?;

        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite silently keeps DELETE mode on filesystems without shared
        // memory support, so the returned mode has to be checked.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::unavailable("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(StoreError::unavailable(
                "configure journal_mode",
                format!(
                    "SQLite returned journal mode '{}' instead of 'wal'; \
                     the state directory must support shared memory",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| StoreError::unavailable("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::unavailable("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::unavailable("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::unavailable(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS retry_attempts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    commit_sha TEXT NOT NULL,
                    repo_owner TEXT NOT NULL,
                    repo_name TEXT NOT NULL,
                    workflow_run_id INTEGER,
                    attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
                    status TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'healing', 'success', 'exhausted', 'cancelled')),
                    last_error TEXT,
                    last_attempt_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    UNIQUE (commit_sha, repo_owner, repo_name)
                );

                CREATE INDEX IF NOT EXISTS idx_retry_attempts_updated
                    ON retry_attempts(updated_at DESC);

                CREATE TABLE IF NOT EXISTS webhook_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    delivery_id TEXT,
                    event_type TEXT NOT NULL,
                    action TEXT,
                    repo_owner TEXT,
                    repo_name TEXT,
                    payload_summary TEXT NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_webhook_events_recent
                    ON webhook_events(created_at DESC);

                CREATE TABLE IF NOT EXISTS auto_heal_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    retry_attempt_id INTEGER NOT NULL REFERENCES retry_attempts(id),
                    error_message TEXT NOT NULL,
                    fix_prompt TEXT,
                    fix_applied TEXT,
                    commit_sha_before TEXT,
                    commit_sha_after TEXT,
                    success INTEGER NOT NULL,
                    duration_ms INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_history_attempt
                    ON auto_heal_history(retry_attempt_id, created_at);
                "#,
            )
            .map_err(|e| StoreError::unavailable("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::unavailable("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Create a new in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::unavailable(operation, format!("lock poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::unavailable(operation, format!("task join error: {}", e)))?
    }
}

// =============================================================================
// Integer conversion helpers
// =============================================================================

/// Convert a workflow run id to i64 for SQLite storage.
pub(super) fn run_id_to_i64(run_id: u64, operation: &'static str) -> Result<i64, StoreError> {
    i64::try_from(run_id).map_err(|_| {
        StoreError::unavailable(
            operation,
            format!(
                "workflow run id {} exceeds maximum storable value ({})",
                run_id,
                i64::MAX
            ),
        )
    })
}

/// Convert a usize limit to i64 for a SQLite LIMIT clause.
pub(super) fn usize_to_i64_limit(limit: usize, operation: &'static str) -> Result<i64, StoreError> {
    i64::try_from(limit).map_err(|_| {
        StoreError::unavailable(
            operation,
            format!("limit {} exceeds maximum storable value", limit),
        )
    })
}

fn sql_error(operation: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::unavailable(operation, e.to_string())
}

#[async_trait]
impl RetryStore for SqliteStore {
    async fn get_or_create(
        &self,
        key: &AttemptKey,
        workflow_run_id: Option<u64>,
    ) -> Result<RetryAttempt, StoreError> {
        let key = key.clone();
        self.with_conn("get_or_create", move |conn| {
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(sql_error("get_or_create"))?;
            let attempt = attempts::get_or_create_sync(&tx, &key, workflow_run_id, now_secs())?;
            tx.commit().map_err(sql_error("get_or_create"))?;
            Ok(attempt)
        })
        .await
    }

    async fn get(&self, key: &AttemptKey) -> Result<Option<RetryAttempt>, StoreError> {
        let key = key.clone();
        self.with_conn("get", move |conn| attempts::get_sync(conn, &key))
            .await
    }

    async fn increment(&self, key: &AttemptKey) -> Result<RetryAttempt, StoreError> {
        let key = key.clone();
        self.with_conn("increment", move |conn| {
            attempts::increment_sync(conn, &key, now_secs())
        })
        .await
    }

    async fn update(
        &self,
        key: &AttemptKey,
        update: AttemptUpdate,
    ) -> Result<RetryAttempt, StoreError> {
        let key = key.clone();
        self.with_conn("update", move |conn| {
            attempts::update_sync(conn, &key, &update, now_secs())
        })
        .await
    }

    async fn resolve(&self, key: &AttemptKey) -> Result<RetryAttempt, StoreError> {
        let key = key.clone();
        self.with_conn("resolve", move |conn| {
            attempts::resolve_sync(conn, &key, now_secs())
        })
        .await
    }

    async fn is_max_retries_reached(
        &self,
        key: &AttemptKey,
        limit: u32,
    ) -> Result<bool, StoreError> {
        let key = key.clone();
        self.with_conn("is_max_retries_reached", move |conn| {
            let count = attempts::get_sync(conn, &key)?.map_or(0, |a| a.attempt_count);
            Ok(count >= limit)
        })
        .await
    }

    async fn mark_exhausted(&self, key: &AttemptKey) -> Result<RetryAttempt, StoreError> {
        let key = key.clone();
        self.with_conn("mark_exhausted", move |conn| {
            attempts::mark_exhausted_sync(conn, &key, now_secs())
        })
        .await
    }

    async fn begin_attempt(
        &self,
        key: &AttemptKey,
        workflow_run_id: Option<u64>,
        limit: u32,
    ) -> Result<AttemptGate, StoreError> {
        let key = key.clone();
        self.with_conn("begin_attempt", move |conn| {
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(sql_error("begin_attempt"))?;
            let gate = attempts::begin_attempt_sync(&tx, &key, workflow_run_id, limit, now_secs())?;
            tx.commit().map_err(sql_error("begin_attempt"))?;
            Ok(gate)
        })
        .await
    }

    async fn cancel(&self, key: &AttemptKey) -> Result<Option<RetryAttempt>, StoreError> {
        let key = key.clone();
        self.with_conn("cancel", move |conn| {
            attempts::cancel_sync(conn, &key, now_secs())
        })
        .await
    }

    async fn list_attempts(&self) -> Result<Vec<RetryAttempt>, StoreError> {
        self.with_conn("list_attempts", |conn| attempts::list_sync(conn))
            .await
    }

    async fn log_webhook_event(&self, event: &NewWebhookEvent) -> Result<i64, StoreError> {
        let event = event.clone();
        self.with_conn("log_webhook_event", move |conn| {
            events::log_event_sync(conn, &event, now_secs())
        })
        .await
    }

    async fn finalize_webhook_event(
        &self,
        id: i64,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let error = error.map(str::to_string);
        self.with_conn("finalize_webhook_event", move |conn| {
            events::finalize_event_sync(conn, id, error.as_deref())
        })
        .await
    }

    async fn recent_webhook_events(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        let limit = usize_to_i64_limit(limit, "recent_webhook_events")?;
        self.with_conn("recent_webhook_events", move |conn| {
            events::recent_events_sync(conn, limit)
        })
        .await
    }

    async fn record_history(&self, entry: &NewHistoryEntry) -> Result<i64, StoreError> {
        let entry = entry.clone();
        self.with_conn("record_history", move |conn| {
            history::record_sync(conn, &entry, now_secs())
        })
        .await
    }

    async fn history_for_attempt(
        &self,
        retry_attempt_id: i64,
    ) -> Result<Vec<AutoHealHistory>, StoreError> {
        self.with_conn("history_for_attempt", move |conn| {
            history::for_attempt_sync(conn, retry_attempt_id)
        })
        .await
    }
}
