//! The project journal store (spec §4.3) — one SQLite database per project,
//! opened lazily and pooled with LRU eviction bounded at a configurable N.
//!
//! Event CRUD against an open journal lives in [`store`].

pub mod store;

use anyhow::Result;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One open handle onto a single project's journal database.
pub struct JournalHandle {
    pub project_id: String,
    pool: SqlitePool,
}

impl JournalHandle {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

struct PoolInner {
    handles: HashMap<String, Arc<JournalHandle>>,
    /// Most-recently-used project id is at the back.
    recency: VecDeque<String>,
    last_used: HashMap<String, Instant>,
    closed: bool,
}

/// Bounded LRU pool of project journal handles (spec §4.3, §5).
///
/// Invariants upheld here:
/// - Exactly one open handle per project at any time (the map key).
/// - Handles beyond `max_handles` are evicted-and-closed on next acquisition.
/// - After `shutdown()`, further acquisitions fail.
pub struct JournalPool {
    data_dir: PathBuf,
    max_handles: usize,
    idle_timeout: Duration,
    inner: Mutex<PoolInner>,
}

impl JournalPool {
    pub fn new(data_dir: PathBuf, max_handles: usize) -> Self {
        Self::with_idle_timeout(data_dir, max_handles, Duration::from_secs(600))
    }

    /// `pool_idle_timeout` (spec §6): a handle untouched for longer than this
    /// is a candidate for [`JournalPool::evict_idle`], independent of the
    /// capacity-triggered LRU eviction `acquire` does inline.
    pub fn with_idle_timeout(data_dir: PathBuf, max_handles: usize, idle_timeout: Duration) -> Self {
        Self {
            data_dir,
            max_handles: max_handles.max(1),
            idle_timeout,
            inner: Mutex::new(PoolInner {
                handles: HashMap::new(),
                recency: VecDeque::new(),
                last_used: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn db_path(&self, project_id: &str) -> PathBuf {
        self.data_dir.join(format!("{project_id}.db"))
    }

    /// Lazily open (or return the already-open) handle for `project_id`,
    /// evicting the least-recently-used handle if the pool is at capacity.
    pub async fn acquire(&self, project_id: &str) -> Result<Arc<JournalHandle>> {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            anyhow::bail!("journal pool is shut down");
        }

        if let Some(handle) = guard.handles.get(project_id).cloned() {
            touch(&mut guard.recency, project_id);
            guard.last_used.insert(project_id.to_string(), Instant::now());
            return Ok(handle);
        }

        if guard.handles.len() >= self.max_handles {
            if let Some(evict_id) = guard.recency.pop_front() {
                if let Some(evicted) = guard.handles.remove(&evict_id) {
                    debug!(project_id = %evict_id, "evicting journal handle (pool at capacity)");
                    evicted.pool.close().await;
                }
                guard.last_used.remove(&evict_id);
            }
        }

        let handle = Arc::new(open_handle(&self.data_dir, project_id).await?);
        guard.handles.insert(project_id.to_string(), handle.clone());
        guard.recency.push_back(project_id.to_string());
        guard.last_used.insert(project_id.to_string(), Instant::now());
        Ok(handle)
    }

    /// Closes all open handles; subsequent `acquire` calls fail (spec §4.9).
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        guard.closed = true;
        for (project_id, handle) in guard.handles.drain() {
            debug!(project_id, "closing journal handle on shutdown");
            handle.pool.close().await;
        }
        guard.recency.clear();
        guard.last_used.clear();
        info!("journal pool shut down");
    }

    pub async fn open_count(&self) -> usize {
        self.inner.lock().await.handles.len()
    }

    /// Closes handles that have sat untouched longer than `pool_idle_timeout`
    /// (spec §6), independent of the capacity-triggered eviction `acquire`
    /// performs inline. Intended to be called periodically from a background
    /// sweep (see `main.rs`), mirroring the auth-request expiry sweep.
    pub async fn evict_idle(&self) -> usize {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return 0;
        }
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        let stale: Vec<String> = guard
            .last_used
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for project_id in &stale {
            if let Some(handle) = guard.handles.remove(project_id) {
                debug!(project_id, "evicting idle journal handle");
                handle.pool.close().await;
            }
            guard.last_used.remove(project_id);
            if let Some(pos) = guard.recency.iter().position(|id| id == project_id) {
                guard.recency.remove(pos);
            }
        }
        stale.len()
    }
}

fn touch(recency: &mut VecDeque<String>, project_id: &str) {
    if let Some(pos) = recency.iter().position(|id| id == project_id) {
        recency.remove(pos);
    }
    recency.push_back(project_id.to_string());
}

async fn open_handle(data_dir: &Path, project_id: &str) -> Result<JournalHandle> {
    tokio::fs::create_dir_all(data_dir).await?;
    let db_path = data_dir.join(format!("{project_id}.db"));
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(opts).await?;
    migrate(&pool).await?;
    debug!(project_id, path = %db_path.display(), "opened journal handle");
    Ok(JournalHandle {
        project_id: project_id.to_string(),
        pool,
    })
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    for sql in [include_str!("migrations/001_init.sql")] {
        for stmt in sql.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn acquire_reuses_the_same_handle() {
        let dir = TempDir::new().unwrap();
        let pool = JournalPool::new(dir.path().to_path_buf(), 2);
        let a = pool.acquire("p_1").await.unwrap();
        let b = pool.acquire("p_1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.open_count().await, 1);
    }

    #[tokio::test]
    async fn acquire_evicts_lru_beyond_capacity() {
        let dir = TempDir::new().unwrap();
        let pool = JournalPool::new(dir.path().to_path_buf(), 2);
        pool.acquire("p_1").await.unwrap();
        pool.acquire("p_2").await.unwrap();
        pool.acquire("p_3").await.unwrap();
        assert_eq!(pool.open_count().await, 2);
    }

    #[tokio::test]
    async fn shutdown_closes_all_and_rejects_further_acquisitions() {
        let dir = TempDir::new().unwrap();
        let pool = JournalPool::new(dir.path().to_path_buf(), 2);
        pool.acquire("p_1").await.unwrap();
        pool.shutdown().await;
        assert!(pool.acquire("p_1").await.is_err());
    }

    #[tokio::test]
    async fn evict_idle_closes_only_handles_past_the_timeout() {
        let dir = TempDir::new().unwrap();
        let pool = JournalPool::with_idle_timeout(dir.path().to_path_buf(), 8, Duration::from_millis(20));
        pool.acquire("p_1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.acquire("p_2").await.unwrap();

        let evicted = pool.evict_idle().await;
        assert_eq!(evicted, 1);
        assert_eq!(pool.open_count().await, 1);
    }
}
