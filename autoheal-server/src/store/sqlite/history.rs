//! Auto-heal history for the SQLite store.

use rusqlite::{params, Connection};

use super::super::{AutoHealHistory, NewHistoryEntry, StoreError};
use super::sql_error;

pub(super) fn record_sync(
    conn: &Connection,
    entry: &NewHistoryEntry,
    now: i64,
) -> Result<i64, StoreError> {
    let duration_ms = i64::try_from(entry.duration_ms).unwrap_or(i64::MAX);
    conn.execute(
        "INSERT INTO auto_heal_history \
         (retry_attempt_id, error_message, fix_prompt, fix_applied, commit_sha_before, \
          commit_sha_after, success, duration_ms, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.retry_attempt_id,
            entry.error_message,
            entry.fix_prompt,
            entry.fix_applied,
            entry.commit_sha_before,
            entry.commit_sha_after,
            entry.success,
            duration_ms,
            now
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::MissingAttempt(format!("attempt id {}", entry.retry_attempt_id))
        }
        other => StoreError::unavailable("record history", other.to_string()),
    })?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn for_attempt_sync(
    conn: &Connection,
    retry_attempt_id: i64,
) -> Result<Vec<AutoHealHistory>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, retry_attempt_id, error_message, fix_prompt, fix_applied, \
                    commit_sha_before, commit_sha_after, success, duration_ms, created_at \
             FROM auto_heal_history WHERE retry_attempt_id = ?1 ORDER BY created_at, id",
        )
        .map_err(sql_error("history for attempt"))?;

    let rows = stmt
        .query_map(params![retry_attempt_id], |row| {
            let duration_ms: i64 = row.get(8)?;
            Ok(AutoHealHistory {
                id: row.get(0)?,
                retry_attempt_id: row.get(1)?,
                error_message: row.get(2)?,
                fix_prompt: row.get(3)?,
                fix_applied: row.get(4)?,
                commit_sha_before: row.get(5)?,
                commit_sha_after: row.get(6)?,
                success: row.get(7)?,
                duration_ms: u64::try_from(duration_ms).unwrap_or(0),
                created_at: row.get(9)?,
            })
        })
        .map_err(sql_error("history for attempt"))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(sql_error("history for attempt"))
}
