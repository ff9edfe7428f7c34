//! The snapshot engine (spec §4.7): lets a cold client bootstrap without
//! replaying hundreds of thousands of events, by folding the journal into a
//! per-entity materialized state cache and persisting it back to the
//! project's own `snapshot`/`snapshot_meta` tables.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::ApiError;
use crate::journal::store::{self, EventRow};
use crate::journal::JournalPool;

#[derive(Debug, serde::Serialize)]
pub struct SnapshotResult {
    pub entities: HashMap<String, Vec<Value>>,
    pub snapshot_seq: i64,
    pub entity_counts: HashMap<String, i64>,
}

#[derive(Debug, serde::Serialize)]
pub struct SnapshotMeta {
    pub head_seq: i64,
    pub snapshot_seq: i64,
    pub staleness: i64,
    pub entity_counts: HashMap<String, i64>,
}

/// Coalesces concurrent snapshot builds so at most one runs per project at a
/// time; callers queued behind an in-progress build share its result (spec
/// §5 "snapshot per-project mutex").
#[derive(Default)]
pub struct SnapshotEngine {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SnapshotEngine {
    pub fn new() -> Self {
        Self::default()
    }

    async fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Builds (or returns the already-current cached) snapshot for a project.
    pub async fn build(
        &self,
        journal_pool: &JournalPool,
        project_id: &str,
        max_replay: u64,
    ) -> Result<SnapshotResult, ApiError> {
        let project_lock = self.project_lock(project_id).await;
        let _guard = project_lock.lock().await;

        let handle = journal_pool
            .acquire(project_id)
            .await
            .map_err(|_| ApiError::not_found("project journal is unavailable"))?;
        let pool = handle.pool();

        let head_seq = store::head_seq(pool).await.map_err(ApiError::from)?;
        let snapshot_seq = store::get_snapshot_meta(pool).await.map_err(ApiError::from)?;

        let current_rows = store::load_snapshot(pool).await.map_err(ApiError::from)?;
        if snapshot_seq == head_seq {
            return Ok(materialize_result(&current_rows, snapshot_seq));
        }

        let pending = store::count_events_in_range(pool, snapshot_seq, head_seq)
            .await
            .map_err(ApiError::from)?;
        if pending as u64 > max_replay {
            return Err(ApiError::snapshot_too_large(max_replay));
        }

        let mut state: HashMap<(String, String), Value> = HashMap::new();
        let mut last_known: HashMap<(String, String), Value> = HashMap::new();
        for row in &current_rows {
            let parsed: Value = serde_json::from_str(&row.state).unwrap_or(Value::Null);
            let key = (row.entity_type.clone(), row.entity_id.clone());
            state.insert(key.clone(), parsed.clone());
            last_known.insert(key, parsed);
        }

        let events = store::events_in_range(pool, snapshot_seq, head_seq)
            .await
            .map_err(ApiError::from)?;
        for event in &events {
            fold(&mut state, &mut last_known, event);
        }

        let rows: Vec<(String, String, i64, String)> = state
            .iter()
            .map(|((entity_type, entity_id), value)| {
                (
                    entity_type.clone(),
                    entity_id.clone(),
                    head_seq,
                    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()),
                )
            })
            .collect();
        store::replace_snapshot(pool, &rows, head_seq)
            .await
            .map_err(ApiError::from)?;

        let mut entities: HashMap<String, Vec<Value>> = HashMap::new();
        let mut entity_counts: HashMap<String, i64> = HashMap::new();
        for ((entity_type, _), value) in &state {
            entities.entry(entity_type.clone()).or_default().push(value.clone());
            *entity_counts.entry(entity_type.clone()).or_insert(0) += 1;
        }

        Ok(SnapshotResult {
            entities,
            snapshot_seq: head_seq,
            entity_counts,
        })
    }

    /// Read-only meta view — does not trigger a build (spec §4.7 admin endpoint).
    pub async fn meta(&self, journal_pool: &JournalPool, project_id: &str) -> Result<SnapshotMeta, ApiError> {
        let handle = journal_pool
            .acquire(project_id)
            .await
            .map_err(|_| ApiError::not_found("project journal is unavailable"))?;
        let pool = handle.pool();
        let head_seq = store::head_seq(pool).await.map_err(ApiError::from)?;
        let snapshot_seq = store::get_snapshot_meta(pool).await.map_err(ApiError::from)?;
        let rows = store::load_snapshot(pool).await.map_err(ApiError::from)?;
        let mut entity_counts: HashMap<String, i64> = HashMap::new();
        for row in &rows {
            *entity_counts.entry(row.entity_type.clone()).or_insert(0) += 1;
        }
        Ok(SnapshotMeta {
            head_seq,
            snapshot_seq,
            staleness: head_seq - snapshot_seq,
            entity_counts,
        })
    }
}

fn materialize_result(rows: &[store::SnapshotRow], snapshot_seq: i64) -> SnapshotResult {
    let mut entities: HashMap<String, Vec<Value>> = HashMap::new();
    let mut entity_counts: HashMap<String, i64> = HashMap::new();
    for row in rows {
        let value: Value = serde_json::from_str(&row.state).unwrap_or(Value::Null);
        entities.entry(row.entity_type.clone()).or_default().push(value);
        *entity_counts.entry(row.entity_type.clone()).or_insert(0) += 1;
    }
    SnapshotResult {
        entities,
        snapshot_seq,
        entity_counts,
    }
}

fn is_empty_payload(value: &Value) -> bool {
    matches!(value, Value::Null) || matches!(value, Value::Object(m) if m.is_empty())
}

/// Folds one event into the in-progress materialized state (spec §4.7 step 3).
fn fold(
    state: &mut HashMap<(String, String), Value>,
    last_known: &mut HashMap<(String, String), Value>,
    event: &EventRow,
) {
    let key = (event.entity_type.clone(), event.entity_id.clone());
    let payload: Value = serde_json::from_str(&event.payload).unwrap_or(Value::Null);

    match event.action_type.as_str() {
        "create" | "update" => {
            state.insert(key.clone(), payload.clone());
            last_known.insert(key, payload);
        }
        "soft_delete" | "delete" => {
            state.remove(&key);
        }
        "restore" => {
            if is_empty_payload(&payload) {
                if let Some(prior) = last_known.get(&key) {
                    state.insert(key, prior.clone());
                }
                // else: no prior state within the replay window — no-op.
            } else {
                state.insert(key.clone(), payload.clone());
                last_known.insert(key, payload);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::store::insert_event;
    use tempfile::TempDir;

    async fn pool_with_handle(dir: &TempDir) -> (JournalPool, String) {
        let pool = JournalPool::new(dir.path().join("projects"), 4);
        (pool, "p_test".to_string())
    }

    async fn push_raw(pool: &JournalPool, project_id: &str, action: &str, entity_id: &str, payload: &str) {
        let handle = pool.acquire(project_id).await.unwrap();
        let mut tx = handle.pool().begin().await.unwrap();
        insert_event(
            &mut tx,
            "dev1",
            "sess1",
            rand_client_action_id(),
            action,
            "issues",
            entity_id,
            payload,
            "2025-01-01T00:00:00Z",
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    fn rand_client_action_id() -> i64 {
        use std::sync::atomic::{AtomicI64, Ordering};
        static COUNTER: AtomicI64 = AtomicI64::new(1);
        COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    #[tokio::test]
    async fn builds_snapshot_from_create_update_delete() {
        let dir = TempDir::new().unwrap();
        let (pool, project_id) = pool_with_handle(&dir).await;
        push_raw(&pool, &project_id, "create", "i_1", r#"{"title":"a"}"#).await;
        push_raw(&pool, &project_id, "update", "i_1", r#"{"title":"b"}"#).await;
        push_raw(&pool, &project_id, "create", "i_2", r#"{"title":"c"}"#).await;

        let engine = SnapshotEngine::new();
        let result = engine.build(&pool, &project_id, 10_000).await.unwrap();
        assert_eq!(result.entity_counts.get("issues"), Some(&2));
        assert_eq!(result.snapshot_seq, 3);

        let i1 = &result.entities["issues"]
            .iter()
            .find(|v| v["title"] == "b")
            .unwrap();
        assert_eq!(i1["title"], "b");
    }

    #[tokio::test]
    async fn soft_delete_removes_then_restore_with_payload_reinstates() {
        let dir = TempDir::new().unwrap();
        let (pool, project_id) = pool_with_handle(&dir).await;
        push_raw(&pool, &project_id, "create", "i_1", r#"{"title":"a"}"#).await;
        push_raw(&pool, &project_id, "soft_delete", "i_1", "{}").await;

        let engine = SnapshotEngine::new();
        let mid = engine.build(&pool, &project_id, 10_000).await.unwrap();
        assert_eq!(mid.entity_counts.get("issues"), None);

        push_raw(&pool, &project_id, "restore", "i_1", r#"{"title":"restored"}"#).await;
        let result = engine.build(&pool, &project_id, 10_000).await.unwrap();
        assert_eq!(result.entities["issues"][0]["title"], "restored");
    }

    #[tokio::test]
    async fn restore_without_payload_falls_back_to_prior_state_in_window() {
        let dir = TempDir::new().unwrap();
        let (pool, project_id) = pool_with_handle(&dir).await;
        push_raw(&pool, &project_id, "create", "i_1", r#"{"title":"a"}"#).await;
        push_raw(&pool, &project_id, "soft_delete", "i_1", "{}").await;
        push_raw(&pool, &project_id, "restore", "i_1", "{}").await;

        let engine = SnapshotEngine::new();
        let result = engine.build(&pool, &project_id, 10_000).await.unwrap();
        assert_eq!(result.entities["issues"][0]["title"], "a");
    }

    #[tokio::test]
    async fn cached_snapshot_is_returned_without_rebuild_when_current() {
        let dir = TempDir::new().unwrap();
        let (pool, project_id) = pool_with_handle(&dir).await;
        push_raw(&pool, &project_id, "create", "i_1", r#"{"title":"a"}"#).await;

        let engine = SnapshotEngine::new();
        let first = engine.build(&pool, &project_id, 10_000).await.unwrap();
        let second = engine.build(&pool, &project_id, 10_000).await.unwrap();
        assert_eq!(first.snapshot_seq, second.snapshot_seq);
    }

    #[tokio::test]
    async fn exceeding_max_replay_aborts_without_partial_write() {
        let dir = TempDir::new().unwrap();
        let (pool, project_id) = pool_with_handle(&dir).await;
        for i in 0..5 {
            push_raw(&pool, &project_id, "create", &format!("i_{i}"), r#"{"title":"x"}"#).await;
        }

        let engine = SnapshotEngine::new();
        let err = engine.build(&pool, &project_id, 2).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::SnapshotTooLarge);

        let meta = engine.meta(&pool, &project_id).await.unwrap();
        assert_eq!(meta.snapshot_seq, 0);
    }
}
