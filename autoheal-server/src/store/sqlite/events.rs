//! Webhook event log for the SQLite store.
//!
//! Every authenticated delivery is appended before dispatch and finalized
//! after the handler returns, so `processed = 0` rows after a crash show
//! exactly which deliveries were interrupted.

use rusqlite::{params, Connection};

use super::super::{NewWebhookEvent, StoreError, WebhookEvent};
use super::sql_error;

pub(super) fn log_event_sync(
    conn: &Connection,
    event: &NewWebhookEvent,
    now: i64,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO webhook_events \
         (delivery_id, event_type, action, repo_owner, repo_name, payload_summary, processed, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        params![
            event.delivery_id,
            event.event_type,
            event.action,
            event.repo_owner,
            event.repo_name,
            event.payload_summary,
            now
        ],
    )
    .map_err(sql_error("log webhook event"))?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn finalize_event_sync(
    conn: &Connection,
    id: i64,
    error: Option<&str>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE webhook_events SET processed = 1, error = ?2 WHERE id = ?1",
        params![id, error],
    )
    .map_err(sql_error("finalize webhook event"))?;
    Ok(())
}

pub(super) fn recent_events_sync(
    conn: &Connection,
    limit: i64,
) -> Result<Vec<WebhookEvent>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, delivery_id, event_type, action, repo_owner, repo_name, \
                    payload_summary, processed, error, created_at \
             FROM webhook_events ORDER BY created_at DESC, id DESC LIMIT ?1",
        )
        .map_err(sql_error("recent webhook events"))?;

    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(WebhookEvent {
                id: row.get(0)?,
                delivery_id: row.get(1)?,
                event_type: row.get(2)?,
                action: row.get(3)?,
                repo_owner: row.get(4)?,
                repo_name: row.get(5)?,
                payload_summary: row.get(6)?,
                processed: row.get::<_, i64>(7)? != 0,
                error: row.get(8)?,
                created_at: row.get(9)?,
            })
        })
        .map_err(sql_error("recent webhook events"))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(sql_error("recent webhook events"))
}
