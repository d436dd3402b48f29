//! Retry attempt operations for the SQLite store.
//!
//! All functions are synchronous and run on the blocking pool. Callers that
//! need several statements to appear atomic pass a `BEGIN IMMEDIATE`
//! transaction, which derefs to `Connection`.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::super::{AttemptGate, AttemptKey, AttemptStatus, AttemptUpdate, RetryAttempt, StoreError};
use super::{run_id_to_i64, sql_error};

const ATTEMPT_COLUMNS: &str = "id, commit_sha, repo_owner, repo_name, workflow_run_id, \
     attempt_count, status, last_error, last_attempt_at, created_at, updated_at";

/// A row as SQLite hands it back, before domain validation.
struct RawAttempt {
    id: i64,
    commit_sha: String,
    repo_owner: String,
    repo_name: String,
    workflow_run_id: Option<i64>,
    attempt_count: i64,
    status: String,
    last_error: Option<String>,
    last_attempt_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl RawAttempt {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            commit_sha: row.get(1)?,
            repo_owner: row.get(2)?,
            repo_name: row.get(3)?,
            workflow_run_id: row.get(4)?,
            attempt_count: row.get(5)?,
            status: row.get(6)?,
            last_error: row.get(7)?,
            last_attempt_at: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_attempt(self) -> Result<RetryAttempt, StoreError> {
        let workflow_run_id = self
            .workflow_run_id
            .map(|id| {
                u64::try_from(id).map_err(|_| {
                    StoreError::corruption(format!("workflow_run_id {} on attempt {}", id, self.id))
                })
            })
            .transpose()?;
        let attempt_count = u32::try_from(self.attempt_count).map_err(|_| {
            StoreError::corruption(format!(
                "attempt_count {} on attempt {}",
                self.attempt_count, self.id
            ))
        })?;

        Ok(RetryAttempt {
            id: self.id,
            commit_sha: self.commit_sha,
            repo_owner: self.repo_owner,
            repo_name: self.repo_name,
            workflow_run_id,
            attempt_count,
            status: self.status.parse()?,
            last_error: self.last_error,
            last_attempt_at: self.last_attempt_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub(super) fn get_sync(
    conn: &Connection,
    key: &AttemptKey,
) -> Result<Option<RetryAttempt>, StoreError> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM retry_attempts \
                 WHERE commit_sha = ?1 AND repo_owner = ?2 AND repo_name = ?3",
                ATTEMPT_COLUMNS
            ),
            params![key.commit_sha, key.repo_owner, key.repo_name],
            RawAttempt::from_row,
        )
        .optional()
        .map_err(sql_error("get attempt"))?;
    raw.map(RawAttempt::into_attempt).transpose()
}

fn require_sync(conn: &Connection, key: &AttemptKey) -> Result<RetryAttempt, StoreError> {
    get_sync(conn, key)?.ok_or_else(|| StoreError::MissingAttempt(key.to_string()))
}

pub(super) fn get_or_create_sync(
    conn: &Connection,
    key: &AttemptKey,
    workflow_run_id: Option<u64>,
    now: i64,
) -> Result<RetryAttempt, StoreError> {
    let run_id = workflow_run_id
        .map(|id| run_id_to_i64(id, "get_or_create"))
        .transpose()?;

    conn.execute(
        "INSERT OR IGNORE INTO retry_attempts \
         (commit_sha, repo_owner, repo_name, workflow_run_id, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![key.commit_sha, key.repo_owner, key.repo_name, run_id, now],
    )
    .map_err(sql_error("insert attempt"))?;

    // An existing row keeps its count and status; only the run id follows the
    // most recent delivery.
    if conn.changes() == 0 {
        if let Some(run_id) = run_id {
            conn.execute(
                "UPDATE retry_attempts SET workflow_run_id = ?4 \
                 WHERE commit_sha = ?1 AND repo_owner = ?2 AND repo_name = ?3",
                params![key.commit_sha, key.repo_owner, key.repo_name, run_id],
            )
            .map_err(sql_error("update workflow run id"))?;
        }
    }

    require_sync(conn, key)
}

pub(super) fn increment_sync(
    conn: &Connection,
    key: &AttemptKey,
    now: i64,
) -> Result<RetryAttempt, StoreError> {
    conn.execute(
        "INSERT INTO retry_attempts \
         (commit_sha, repo_owner, repo_name, attempt_count, status, last_attempt_at, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 1, 'healing', ?4, ?4, ?4) \
         ON CONFLICT (commit_sha, repo_owner, repo_name) DO UPDATE SET \
             attempt_count = attempt_count + 1, \
             status = 'healing', \
             last_attempt_at = excluded.last_attempt_at, \
             updated_at = excluded.updated_at",
        params![key.commit_sha, key.repo_owner, key.repo_name, now],
    )
    .map_err(sql_error("increment attempt"))?;

    require_sync(conn, key)
}

pub(super) fn update_sync(
    conn: &Connection,
    key: &AttemptKey,
    update: &AttemptUpdate,
    now: i64,
) -> Result<RetryAttempt, StoreError> {
    let changed = conn
        .execute(
            "UPDATE retry_attempts SET \
                 status = COALESCE(?4, status), \
                 last_error = COALESCE(?5, last_error), \
                 updated_at = ?6 \
             WHERE commit_sha = ?1 AND repo_owner = ?2 AND repo_name = ?3",
            params![
                key.commit_sha,
                key.repo_owner,
                key.repo_name,
                update.status.map(AttemptStatus::as_str),
                update.last_error,
                now
            ],
        )
        .map_err(sql_error("update attempt"))?;

    if changed == 0 {
        return Err(StoreError::MissingAttempt(key.to_string()));
    }
    require_sync(conn, key)
}

pub(super) fn resolve_sync(
    conn: &Connection,
    key: &AttemptKey,
    now: i64,
) -> Result<RetryAttempt, StoreError> {
    conn.execute(
        "UPDATE retry_attempts SET status = 'success', updated_at = ?4 \
         WHERE commit_sha = ?1 AND repo_owner = ?2 AND repo_name = ?3 \
           AND status IN ('pending', 'healing')",
        params![key.commit_sha, key.repo_owner, key.repo_name, now],
    )
    .map_err(sql_error("resolve attempt"))?;

    require_sync(conn, key)
}

pub(super) fn mark_exhausted_sync(
    conn: &Connection,
    key: &AttemptKey,
    now: i64,
) -> Result<RetryAttempt, StoreError> {
    conn.execute(
        "INSERT INTO retry_attempts \
         (commit_sha, repo_owner, repo_name, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 'exhausted', ?4, ?4) \
         ON CONFLICT (commit_sha, repo_owner, repo_name) DO UPDATE SET \
             status = 'exhausted', \
             updated_at = excluded.updated_at",
        params![key.commit_sha, key.repo_owner, key.repo_name, now],
    )
    .map_err(sql_error("mark attempt exhausted"))?;

    require_sync(conn, key)
}

/// The gate behind `begin_attempt`. Must run inside an immediate transaction.
pub(super) fn begin_attempt_sync(
    conn: &Connection,
    key: &AttemptKey,
    workflow_run_id: Option<u64>,
    limit: u32,
    now: i64,
) -> Result<AttemptGate, StoreError> {
    let attempt = get_or_create_sync(conn, key, workflow_run_id, now)?;

    match attempt.status {
        AttemptStatus::Success | AttemptStatus::Cancelled => {
            return Ok(AttemptGate::Terminal(attempt))
        }
        AttemptStatus::Exhausted => return Ok(AttemptGate::Exhausted(attempt)),
        AttemptStatus::Pending | AttemptStatus::Healing => {}
    }

    // Conditional increment: the row only moves if it is still below the
    // limit, so the count can never pass it.
    let changed = conn
        .execute(
            "UPDATE retry_attempts SET \
                 attempt_count = attempt_count + 1, \
                 status = 'healing', \
                 last_attempt_at = ?5, \
                 updated_at = ?5 \
             WHERE commit_sha = ?1 AND repo_owner = ?2 AND repo_name = ?3 \
               AND attempt_count < ?4 \
               AND status IN ('pending', 'healing')",
            params![key.commit_sha, key.repo_owner, key.repo_name, limit, now],
        )
        .map_err(sql_error("begin attempt"))?;

    if changed == 0 {
        return mark_exhausted_sync(conn, key, now).map(AttemptGate::Exhausted);
    }
    require_sync(conn, key).map(AttemptGate::Started)
}

pub(super) fn cancel_sync(
    conn: &Connection,
    key: &AttemptKey,
    now: i64,
) -> Result<Option<RetryAttempt>, StoreError> {
    let changed = conn
        .execute(
            "UPDATE retry_attempts SET status = 'cancelled', updated_at = ?4 \
             WHERE commit_sha = ?1 AND repo_owner = ?2 AND repo_name = ?3",
            params![key.commit_sha, key.repo_owner, key.repo_name, now],
        )
        .map_err(sql_error("cancel attempt"))?;

    if changed == 0 {
        return Ok(None);
    }
    get_sync(conn, key)
}

pub(super) fn list_sync(conn: &Connection) -> Result<Vec<RetryAttempt>, StoreError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM retry_attempts ORDER BY updated_at DESC, id DESC",
            ATTEMPT_COLUMNS
        ))
        .map_err(sql_error("list attempts"))?;

    let rows = stmt
        .query_map([], RawAttempt::from_row)
        .map_err(sql_error("list attempts"))?;

    let mut attempts = Vec::new();
    for row in rows {
        attempts.push(row.map_err(sql_error("list attempts"))?.into_attempt()?);
    }
    Ok(attempts)
}
