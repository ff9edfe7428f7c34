//! Event CRUD against one open project journal (spec §4.3, §4.6, §4.7).
//!
//! Functions here take an explicit `&mut SqliteConnection`/`Transaction` or a
//! `&SqlitePool` so the caller (the sync engine, §4.6) controls transaction
//! boundaries — admission must run inside a single journal transaction.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::retry::{retry_sqlite_busy, RetryConfig};

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct EventRow {
    pub server_seq: i64,
    pub device_id: String,
    pub session_id: String,
    pub client_action_id: i64,
    pub action_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: String,
    pub client_timestamp: String,
    pub server_timestamp: String,
}

/// Looks up an existing event by its idempotency key, within the current
/// transaction (so a push sees its own uncommitted inserts).
pub async fn find_by_idempotency_key(
    tx: &mut Transaction<'_, Sqlite>,
    device_id: &str,
    client_action_id: i64,
) -> Result<Option<EventRow>> {
    Ok(sqlx::query_as(
        "SELECT * FROM events WHERE device_id = ? AND client_action_id = ?",
    )
    .bind(device_id)
    .bind(client_action_id)
    .fetch_optional(&mut **tx)
    .await?)
}

/// Inserts one event; the primary-key autoincrement produces `server_seq`.
pub async fn insert_event(
    tx: &mut Transaction<'_, Sqlite>,
    device_id: &str,
    session_id: &str,
    client_action_id: i64,
    action_type: &str,
    entity_type: &str,
    entity_id: &str,
    payload: &str,
    client_timestamp: &str,
) -> Result<i64> {
    let server_timestamp = Utc::now().to_rfc3339();
    let result = sqlx::query(
        "INSERT INTO events
            (device_id, session_id, client_action_id, action_type, entity_type, entity_id, payload, client_timestamp, server_timestamp)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(device_id)
    .bind(session_id)
    .bind(client_action_id)
    .bind(action_type)
    .bind(entity_type)
    .bind(entity_id)
    .bind(payload)
    .bind(client_timestamp)
    .bind(&server_timestamp)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

/// `SELECT ... WHERE server_seq > ? ORDER BY server_seq ASC LIMIT ?+1` (spec
/// §4.6 Pull). The caller passes `limit + 1` as `probe_limit` and interprets
/// an extra row as `has_more`.
pub async fn pull_range(
    pool: &SqlitePool,
    after_server_seq: i64,
    probe_limit: i64,
) -> Result<Vec<EventRow>> {
    Ok(sqlx::query_as(
        "SELECT * FROM events WHERE server_seq > ? ORDER BY server_seq ASC LIMIT ?",
    )
    .bind(after_server_seq)
    .bind(probe_limit)
    .fetch_all(pool)
    .await?)
}

/// Admin filtered listing (spec §4.6 Admin reads) — optional filters on
/// entity_type/action_type/device_id, probing `limit+1` rows ascending by
/// `server_seq` starting after a cursor-decoded `server_seq`.
#[derive(Debug, Default)]
pub struct EventFilter<'a> {
    pub entity_type: Option<&'a str>,
    pub action_type: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub after_seq: i64,
}

pub async fn filter_events(
    pool: &SqlitePool,
    filter: &EventFilter<'_>,
    probe_limit: i64,
) -> Result<Vec<EventRow>> {
    Ok(sqlx::query_as(
        "SELECT * FROM events
         WHERE server_seq > ?
           AND (? IS NULL OR entity_type = ?)
           AND (? IS NULL OR action_type = ?)
           AND (? IS NULL OR device_id = ?)
         ORDER BY server_seq ASC LIMIT ?",
    )
    .bind(filter.after_seq)
    .bind(filter.entity_type)
    .bind(filter.entity_type)
    .bind(filter.action_type)
    .bind(filter.action_type)
    .bind(filter.device_id)
    .bind(filter.device_id)
    .bind(probe_limit)
    .fetch_all(pool)
    .await?)
}

/// The highest `server_seq` currently in the journal, or 0 if empty.
pub async fn head_seq(pool: &SqlitePool) -> Result<i64> {
    let (seq,): (Option<i64>,) = sqlx::query_as("SELECT MAX(server_seq) FROM events")
        .fetch_one(pool)
        .await?;
    Ok(seq.unwrap_or(0))
}

/// Events strictly after `after_seq` up to and including `up_to_seq`, in
/// ascending order — used by the snapshot folder (spec §4.7 step 3).
pub async fn events_in_range(
    pool: &SqlitePool,
    after_seq: i64,
    up_to_seq: i64,
) -> Result<Vec<EventRow>> {
    Ok(sqlx::query_as(
        "SELECT * FROM events WHERE server_seq > ? AND server_seq <= ? ORDER BY server_seq ASC",
    )
    .bind(after_seq)
    .bind(up_to_seq)
    .fetch_all(pool)
    .await?)
}

/// Counts events strictly after `after_seq` up to `up_to_seq` without
/// materializing them — used to enforce `snapshot_max_replay` before the
/// (potentially large) fold begins.
pub async fn count_events_in_range(pool: &SqlitePool, after_seq: i64, up_to_seq: i64) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM events WHERE server_seq > ? AND server_seq <= ?",
    )
    .bind(after_seq)
    .bind(up_to_seq)
    .fetch_one(pool)
    .await?;
    Ok(n)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnapshotRow {
    pub entity_type: String,
    pub entity_id: String,
    pub snapshot_seq: i64,
    pub state: String,
}

pub async fn get_snapshot_meta(pool: &SqlitePool) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT snapshot_seq FROM snapshot_meta WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(s,)| s).unwrap_or(0))
}

pub async fn load_snapshot(pool: &SqlitePool) -> Result<Vec<SnapshotRow>> {
    Ok(sqlx::query_as("SELECT * FROM snapshot")
        .fetch_all(pool)
        .await?)
}

/// Persists a freshly built snapshot in a single transaction, replacing the
/// prior contents wholesale (spec §4.7 step 4).
///
/// Wrapped in the storage-layer busy retry (spec §10.7): this transaction
/// touches the whole `snapshot` table at once and is the journal write most
/// likely to collide with a concurrent reader holding the WAL briefly.
pub async fn replace_snapshot(
    pool: &SqlitePool,
    rows: &[(String, String, i64, String)],
    snapshot_seq: i64,
) -> Result<()> {
    retry_sqlite_busy(&RetryConfig::default(), || async {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM snapshot").execute(&mut *tx).await?;
        for (entity_type, entity_id, seq, state) in rows {
            sqlx::query(
                "INSERT INTO snapshot (entity_type, entity_id, snapshot_seq, state) VALUES (?, ?, ?, ?)",
            )
            .bind(entity_type)
            .bind(entity_id)
            .bind(seq)
            .bind(state)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "INSERT INTO snapshot_meta (id, snapshot_seq) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET snapshot_seq = excluded.snapshot_seq",
        )
        .bind(snapshot_seq)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalPool;
    use tempfile::TempDir;

    #[tokio::test]
    async fn insert_and_pull_round_trip() {
        let dir = TempDir::new().unwrap();
        let pool = JournalPool::new(dir.path().to_path_buf(), 4);
        let handle = pool.acquire("p_test").await.unwrap();

        let mut tx = handle.pool().begin().await.unwrap();
        let seq = insert_event(
            &mut tx, "dev1", "s1", 1, "create", "issues", "i_001", "{}", "2025-01-01T00:00:00Z",
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(seq, 1);

        let rows = pull_range(handle.pool(), 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].server_seq, 1);
        assert_eq!(head_seq(handle.pool()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn idempotency_key_dedup() {
        let dir = TempDir::new().unwrap();
        let pool = JournalPool::new(dir.path().to_path_buf(), 4);
        let handle = pool.acquire("p_test").await.unwrap();

        let mut tx = handle.pool().begin().await.unwrap();
        insert_event(
            &mut tx, "dev1", "s1", 1, "create", "issues", "i_001", "{}", "2025-01-01T00:00:00Z",
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut tx = handle.pool().begin().await.unwrap();
        let existing = find_by_idempotency_key(&mut tx, "dev1", 1).await.unwrap();
        assert!(existing.is_some());
        assert_eq!(existing.unwrap().server_seq, 1);
    }
}
