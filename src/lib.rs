pub mod auth;
pub mod config;
pub mod control;
pub mod error;
pub mod journal;
pub mod observability;
pub mod pagination;
pub mod rate_limit;
pub mod rest;
pub mod retry;
pub mod snapshot;
pub mod sync;
pub mod taxonomy;

use std::sync::Arc;

use config::ServerConfig;
use control::ControlStore;
use journal::JournalPool;
use rate_limit::RateLimiter;
use snapshot::SnapshotEngine;

/// Shared application state passed to every HTTP handler (spec §4.2–§4.9).
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub control: Arc<ControlStore>,
    pub journal_pool: Arc<JournalPool>,
    pub snapshot_engine: Arc<SnapshotEngine>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let control = ControlStore::new(&config.control_db_path()).await?;
        let journal_pool = JournalPool::with_idle_timeout(
            config.journal_dir(),
            config.pool_max_handles,
            config.pool_idle_timeout,
        );
        let rate_limiter = RateLimiter::new(config.rate_limits);
        Ok(Self {
            rate_limiter: Arc::new(rate_limiter),
            config: Arc::new(config),
            control: Arc::new(control),
            journal_pool: Arc::new(journal_pool),
            snapshot_engine: Arc::new(SnapshotEngine::new()),
            started_at: std::time::Instant::now(),
        })
    }

    /// Closes the control store and every open journal handle (spec §4.9).
    pub async fn shutdown(&self) {
        self.journal_pool.shutdown().await;
        self.control.close().await;
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
