//! The sync engine (spec §4.6): push (admission), pull, status, and the
//! admin filtered-listing reads. Everything here operates on one project's
//! journal handle plus the control store's aggregate counters.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::control::ControlStore;
use crate::error::ApiError;
use crate::journal::store::{self, EventFilter, EventRow};
use crate::journal::JournalPool;
use crate::pagination::{self, CursorValue, Page};
use crate::taxonomy;

/// Pull has its own page-size bounds, distinct from the admin pagination
/// kernel's `[1, 200]`/50 default (spec §4.6 Pull: default 100, clamped to
/// `MAX_PULL=1000`).
pub const DEFAULT_PULL_LIMIT: u32 = 100;
pub const MAX_PULL_LIMIT: u32 = 1000;

pub fn clamp_pull_limit(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_PULL_LIMIT).clamp(1, MAX_PULL_LIMIT)
}

/// One event as submitted by a client in a push batch.
#[derive(Debug, Deserialize)]
pub struct PushEvent {
    pub client_action_id: i64,
    pub action_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub client_timestamp: String,
}

/// One newly-admitted event (spec §6 envelope example).
#[derive(Debug, Serialize)]
pub struct Ack {
    pub client_action_id: i64,
    pub server_seq: i64,
}

/// A rejected or duplicate entry. `server_seq` is populated for duplicates
/// so clients can advance their cursor from the retry itself (spec §4.6
/// step 2); it is absent for normalization rejections.
#[derive(Debug, Serialize)]
pub struct Rejection {
    pub client_action_id: i64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PushResult {
    pub accepted: i64,
    pub acks: Vec<Ack>,
    pub rejected: Vec<Rejection>,
    pub head_seq: i64,
}

/// Admits a batch of events into one project's journal (spec §4.6 step 2):
/// normalize → dedup-by-idempotency-key → insert, all inside a single
/// transaction, followed by one aggregate-counter update on the control
/// store and a single commit point.
pub async fn push(
    journal_pool: &JournalPool,
    control: &ControlStore,
    project_id: &str,
    device_id: &str,
    session_id: &str,
    events: Vec<PushEvent>,
) -> Result<PushResult, ApiError> {
    let handle = journal_pool
        .acquire(project_id)
        .await
        .map_err(|_| ApiError::not_found("project journal is unavailable"))?;

    let mut acks = Vec::with_capacity(events.len());
    let mut rejected = Vec::new();
    let mut inserted = 0i64;

    let mut tx = handle.pool().begin().await.map_err(ApiError::from)?;
    for event in events {
        let normalized = match taxonomy::normalize(&event.entity_type, &event.action_type) {
            Ok(n) => n,
            Err(err) => {
                rejected.push(Rejection {
                    client_action_id: event.client_action_id,
                    reason: err.code.as_str().to_string(),
                    server_seq: None,
                });
                continue;
            }
        };

        if let Some(existing) =
            store::find_by_idempotency_key(&mut tx, device_id, event.client_action_id)
                .await
                .map_err(ApiError::from)?
        {
            rejected.push(Rejection {
                client_action_id: event.client_action_id,
                reason: "duplicate".to_string(),
                server_seq: Some(existing.server_seq),
            });
            continue;
        }

        let payload = serde_json::to_string(&event.payload).map_err(|e| {
            ApiError::validation(format!("event payload is not valid JSON: {e}"))
        })?;
        let server_seq = store::insert_event(
            &mut tx,
            device_id,
            session_id,
            event.client_action_id,
            normalized.action_type,
            normalized.entity_type,
            &event.entity_id,
            &payload,
            &event.client_timestamp,
        )
        .await
        .map_err(ApiError::from)?;
        inserted += 1;
        acks.push(Ack {
            client_action_id: event.client_action_id,
            server_seq,
        });
    }
    tx.commit().await.map_err(ApiError::from)?;

    let head_seq = store::head_seq(handle.pool()).await.map_err(ApiError::from)?;
    if inserted > 0 {
        control
            .update_project_event_count(project_id, inserted, Utc::now(), head_seq)
            .await
            .map_err(ApiError::from)?;
    }

    Ok(PushResult {
        accepted: inserted,
        acks,
        rejected,
        head_seq,
    })
}

/// Pulls events strictly after `after_seq`, cursor-paginated on `server_seq`,
/// and advances the named client's sync cursor (spec §4.6 step 3). `device_id`
/// is optional — it is only used for the best-effort cursor upsert, never to
/// gate what a pull returns.
pub async fn pull(
    journal_pool: &JournalPool,
    control: &ControlStore,
    project_id: &str,
    device_id: Option<&str>,
    after_seq: i64,
    limit: u32,
) -> Result<Page<EventRow>, ApiError> {
    let handle = journal_pool
        .acquire(project_id)
        .await
        .map_err(|_| ApiError::not_found("project journal is unavailable"))?;

    let probe_limit = limit as i64 + 1;
    let rows = store::pull_range(handle.pool(), after_seq, probe_limit)
        .await
        .map_err(ApiError::from)?;
    let page = pagination::build_page(rows, limit, |row: &EventRow| {
        CursorValue::from_value(row.server_seq.to_string())
    });

    if let (Some(client_id), Some(last)) = (device_id, page.data.last()) {
        control
            .upsert_sync_cursor(project_id, client_id, last.server_seq)
            .await
            .map_err(ApiError::from)?;
    }

    Ok(page)
}

/// Decode a pull cursor (or the literal `after_seq` query parameter) into a
/// numeric lower bound. A missing cursor means "from the beginning" (0).
pub fn decode_after_seq(cursor: Option<&str>) -> Result<i64, ApiError> {
    match cursor {
        None => Ok(0),
        Some(raw) if raw.is_empty() => Ok(0),
        Some(raw) => {
            let decoded = pagination::decode_cursor(raw)?;
            decoded
                .chosen()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(ApiError::invalid_cursor)
        }
    }
}

/// `GET /v1/projects/{id}/sync/status` (spec §4.6 step 4): an O(1) read off
/// the control store's denormalized counters — the journal is never
/// consulted, so this stays O(1) even for a billion-event project.
#[derive(Debug, Serialize)]
pub struct SyncStatus {
    pub event_count: i64,
    pub last_event_at: Option<String>,
    pub last_server_seq: i64,
}

pub async fn status(control: &ControlStore, project_id: &str) -> Result<SyncStatus, ApiError> {
    let project = control
        .get_project(project_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("project not found"))?;
    Ok(SyncStatus {
        event_count: project.event_count,
        last_event_at: project.last_event_at,
        last_server_seq: project.last_server_seq,
    })
}

/// Admin event listing with optional entity/action/device filters (spec
/// §4.6 Admin reads). Entity filters are validated against the canonical
/// taxonomy before the query runs.
pub async fn admin_list_events(
    journal_pool: &JournalPool,
    project_id: &str,
    entity_type: Option<&str>,
    action_type: Option<&str>,
    device_id: Option<&str>,
    cursor: Option<&str>,
    limit: u32,
) -> Result<Page<EventRow>, ApiError> {
    if let Some(entity) = entity_type {
        taxonomy::validate_canonical_entity(entity)?;
    }
    let handle = journal_pool
        .acquire(project_id)
        .await
        .map_err(|_| ApiError::not_found("project journal is unavailable"))?;

    let after_seq = decode_after_seq(cursor)?;
    let filter = EventFilter {
        entity_type,
        action_type,
        device_id,
        after_seq,
    };
    let rows = store::filter_events(handle.pool(), &filter, limit as i64 + 1)
        .await
        .map_err(ApiError::from)?;
    Ok(pagination::build_page(rows, limit, |row: &EventRow| {
        CursorValue::from_value(row.server_seq.to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fixtures() -> (TempDir, ControlStore, JournalPool, String) {
        let dir = TempDir::new().unwrap();
        let control = ControlStore::new(&dir.path().join("server.db")).await.unwrap();
        let pool = JournalPool::new(dir.path().join("projects"), 8);
        let alice = control
            .get_or_create_user_by_email("alice@test.com")
            .await
            .unwrap();
        let project = control.create_project("demo", None, &alice.id).await.unwrap();
        (dir, control, pool, project.id)
    }

    fn sample_event(client_action_id: i64) -> PushEvent {
        PushEvent {
            client_action_id,
            action_type: "create".to_string(),
            entity_type: "issues".to_string(),
            entity_id: "i_001".to_string(),
            payload: serde_json::json!({"title": "hello"}),
            client_timestamp: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn push_is_idempotent_on_retry() {
        let (_dir, control, pool, project_id) = fixtures().await;
        let first = push(&pool, &control, &project_id, "dev1", "sess1", vec![sample_event(1)])
            .await
            .unwrap();
        assert_eq!(first.accepted, 1);
        assert_eq!(first.acks.len(), 1);
        assert!(first.rejected.is_empty());
        let first_seq = first.acks[0].server_seq;

        let retry = push(&pool, &control, &project_id, "dev1", "sess1", vec![sample_event(1)])
            .await
            .unwrap();
        assert_eq!(retry.accepted, 0);
        assert!(retry.acks.is_empty());
        assert_eq!(retry.rejected.len(), 1);
        assert_eq!(retry.rejected[0].reason, "duplicate");
        assert_eq!(retry.rejected[0].server_seq, Some(first_seq));
    }

    #[tokio::test]
    async fn push_rejects_invalid_combination_without_aborting_batch() {
        let (_dir, control, pool, project_id) = fixtures().await;
        let mut bad = sample_event(1);
        bad.entity_type = "logs".to_string();
        bad.action_type = "update".to_string();
        let good = sample_event(2);

        let result = push(&pool, &control, &project_id, "dev1", "sess1", vec![bad, good])
            .await
            .unwrap();
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].reason, "invalid_entity_action");
        assert_eq!(result.accepted, 1);
        assert_eq!(result.acks.len(), 1);
    }

    #[tokio::test]
    async fn pull_advances_cursor_and_reports_has_more() {
        let (_dir, control, pool, project_id) = fixtures().await;
        let events: Vec<PushEvent> = (1..=3).map(sample_event).collect();
        push(&pool, &control, &project_id, "dev1", "sess1", events)
            .await
            .unwrap();

        let page = pull(&pool, &control, &project_id, Some("client-a"), 0, 2).await.unwrap();
        assert_eq!(page.data.len(), 2);
        assert!(page.has_more);

        let cursors = control.list_sync_cursors(&project_id, None, 10).await.unwrap();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].last_event_id, page.data.last().unwrap().server_seq);
    }

    #[tokio::test]
    async fn status_reports_event_count_and_last_server_seq() {
        let (_dir, control, pool, project_id) = fixtures().await;
        push(&pool, &control, &project_id, "dev1", "sess1", vec![sample_event(1)])
            .await
            .unwrap();
        let status = status(&control, &project_id).await.unwrap();
        assert_eq!(status.event_count, 1);
        assert_eq!(status.last_server_seq, 1);
    }
}
