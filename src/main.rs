//! `syncd` — the event-log sync service binary (spec §4.9, §6, §10.1, §10.3).
//!
//! Parses CLI/env configuration, wires up the [`syncd::AppContext`], and
//! runs the HTTP surface to completion. Graceful shutdown resolves on
//! SIGTERM (Unix) or Ctrl-C, drains in-flight requests up to
//! `shutdown_timeout`, then closes the project-journal pool and the control
//! store in that order (§4.9).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{info, warn};

use syncd::config::{CliOverrides, ServerConfig};
use syncd::AppContext;

#[derive(Parser)]
#[command(name = "syncd", about = "Multi-tenant event-log sync service", version)]
struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "SYNCD_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Data directory holding the control store and per-project journals.
    #[arg(long, env = "SYNCD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Path to an optional TOML config file. Defaults to `{data_dir}/config.toml`.
    #[arg(long, env = "SYNCD_CONFIG")]
    config: Option<PathBuf>,

    /// Whether device-auth `code_verified` requests auto-approve without an
    /// operator step (spec §10.5). Overrides the TOML/default value.
    #[arg(long, env = "SYNCD_ALLOW_SIGNUP")]
    allow_signup: Option<bool>,

    /// Log level filter (trace, debug, info, warn, error), or any
    /// `tracing-subscriber` `EnvFilter` directive string.
    #[arg(long, env = "SYNCD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "SYNCD_LOG_FORMAT")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServerConfig::new(CliOverrides {
        listen_addr: args.listen_addr,
        data_dir: args.data_dir,
        allow_signup: args.allow_signup,
        log_level: args.log_level,
        log_format: args.log_format,
        config_path: args.config,
    });

    setup_logging(&config.log_level, &config.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "syncd starting");
    info!(
        data_dir = %config.data_dir.display(),
        listen_addr = %config.listen_addr,
        allow_signup = config.allow_signup,
        pool_max_handles = config.pool_max_handles,
        "config loaded"
    );

    let ctx = Arc::new(
        AppContext::new(config)
            .await
            .context("failed to initialize application state")?,
    );

    // Periodic sweep of auth requests past their TTL (spec §4.5 `* → expired`).
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                match ctx.control.expire_stale_auth_requests().await {
                    Ok(n) if n > 0 => info!(count = n, "expired stale auth requests"),
                    Ok(_) => {}
                    Err(e) => warn!(err = %e, "auth-request expiry sweep failed"),
                }
            }
        });
    }

    // Periodic sweep closing journal handles idle longer than
    // `pool_idle_timeout` (spec §6), independent of the pool's inline
    // capacity-triggered LRU eviction.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let n = ctx.journal_pool.evict_idle().await;
                if n > 0 {
                    info!(count = n, "closed idle journal handles");
                }
            }
        });
    }

    syncd::rest::start_server(ctx).await?;

    info!("syncd stopped");
    Ok(())
}

/// Install the global `tracing` subscriber (spec §10.1). `format` selects
/// between a human-oriented compact layer (`"pretty"`, the default) and a
/// newline-delimited JSON layer (`"json"`) suitable for log aggregation.
/// Must run once, before any other subsystem is constructed.
fn setup_logging(log_level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        "json" => subscriber.json().init(),
        _ => subscriber.compact().init(),
    }
}
