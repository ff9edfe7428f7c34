//! Layered server configuration.
//!
//! Priority (highest to lowest): CLI / env var > TOML file > built-in default.
//! The configuration set is closed and static for the life of the process —
//! there is no hot-reload here, unlike some sibling daemons in this codebase,
//! because nothing in the closed set is expected to change without a restart.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8088";
const DEFAULT_ALLOW_SIGNUP: bool = true;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_LOG_FORMAT: &str = "pretty";
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POOL_MAX_HANDLES: usize = 32;
const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_SNAPSHOT_MAX_REPLAY: u64 = 500_000;
const DEFAULT_RATE_LIMIT_AUTH: u32 = 20;
const DEFAULT_RATE_LIMIT_PUSH: u32 = 600;
const DEFAULT_RATE_LIMIT_PULL: u32 = 1200;
const DEFAULT_RATE_LIMIT_OTHER: u32 = 300;

/// Per-identity-class rate limit, expressed as a count per minute.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RateLimitsToml {
    pub auth: Option<u32>,
    pub push: Option<u32>,
    pub pull: Option<u32>,
    pub other: Option<u32>,
}

/// `{data_dir}/config.toml` — every field is an optional override.
#[derive(Deserialize, Default)]
struct TomlConfig {
    listen_addr: Option<String>,
    data_dir: Option<PathBuf>,
    allow_signup: Option<bool>,
    log_level: Option<String>,
    log_format: Option<String>,
    shutdown_timeout_secs: Option<u64>,
    pool_max_handles: Option<usize>,
    pool_idle_timeout_secs: Option<u64>,
    snapshot_max_replay: Option<u64>,
    cors_allowed_origins: Option<Vec<String>>,
    rate_limits: Option<RateLimitsToml>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

/// Rate limits in requests-per-minute per identity, by endpoint class.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub auth: u32,
    pub push: u32,
    pub pull: u32,
    pub other: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            auth: DEFAULT_RATE_LIMIT_AUTH,
            push: DEFAULT_RATE_LIMIT_PUSH,
            pull: DEFAULT_RATE_LIMIT_PULL,
            other: DEFAULT_RATE_LIMIT_OTHER,
        }
    }
}

/// CORS origin policy resolved from configuration.
#[derive(Debug, Clone)]
pub enum CorsPolicy {
    Disabled,
    Any,
    Origins(Vec<String>),
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    /// Whether device-auth code_verified requests auto-approve (§10.5).
    /// When false, a separate admin approval endpoint must be called.
    pub allow_signup: bool,
    pub log_level: String,
    pub log_format: String,
    pub shutdown_timeout: std::time::Duration,
    pub pool_max_handles: usize,
    pub pool_idle_timeout: std::time::Duration,
    pub snapshot_max_replay: u64,
    pub cors: CorsPolicy,
    pub rate_limits: RateLimits,
}

/// CLI-sourced overrides. Every field is optional; `None` defers to TOML/default.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen_addr: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub allow_signup: Option<bool>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub config_path: Option<PathBuf>,
}

impl ServerConfig {
    /// Build config from CLI/env args plus an optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed in as `Some(value)` fields on `CliOverrides`
    ///   2. TOML file, resolved from `--config` or `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(cli: CliOverrides) -> Self {
        let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
        let config_path = cli
            .config_path
            .clone()
            .unwrap_or_else(|| data_dir.join("config.toml"));
        let toml = load_toml(&config_path).unwrap_or_default();

        let listen_addr = cli
            .listen_addr
            .or(toml.listen_addr)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let allow_signup = cli
            .allow_signup
            .or(toml.allow_signup)
            .unwrap_or(DEFAULT_ALLOW_SIGNUP);
        let log_level = cli
            .log_level
            .or(toml.log_level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        let log_format = cli
            .log_format
            .or(toml.log_format)
            .unwrap_or_else(|| DEFAULT_LOG_FORMAT.to_string());

        let shutdown_timeout = std::time::Duration::from_secs(
            toml.shutdown_timeout_secs
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        );
        let pool_max_handles = toml.pool_max_handles.unwrap_or(DEFAULT_POOL_MAX_HANDLES);
        let pool_idle_timeout = std::time::Duration::from_secs(
            toml.pool_idle_timeout_secs
                .unwrap_or(DEFAULT_POOL_IDLE_TIMEOUT_SECS),
        );
        let snapshot_max_replay = toml
            .snapshot_max_replay
            .unwrap_or(DEFAULT_SNAPSHOT_MAX_REPLAY);

        let cors = match toml.cors_allowed_origins {
            None => CorsPolicy::Disabled,
            Some(origins) if origins.iter().any(|o| o == "*") => CorsPolicy::Any,
            Some(origins) => CorsPolicy::Origins(origins),
        };

        let rl = toml.rate_limits.unwrap_or_default();
        let rate_limits = RateLimits {
            auth: rl.auth.unwrap_or(DEFAULT_RATE_LIMIT_AUTH),
            push: rl.push.unwrap_or(DEFAULT_RATE_LIMIT_PUSH),
            pull: rl.pull.unwrap_or(DEFAULT_RATE_LIMIT_PULL),
            other: rl.other.unwrap_or(DEFAULT_RATE_LIMIT_OTHER),
        };

        Self {
            listen_addr,
            data_dir,
            allow_signup,
            log_level,
            log_format,
            shutdown_timeout,
            pool_max_handles,
            pool_idle_timeout,
            snapshot_max_replay,
            cors,
            rate_limits,
        }
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join("projects")
    }

    pub fn control_db_path(&self) -> PathBuf {
        self.data_dir.join("server.db")
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("syncd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("syncd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("syncd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("syncd");
        }
    }
    PathBuf::from(".syncd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_overridden() {
        let cfg = ServerConfig::new(CliOverrides {
            data_dir: Some(PathBuf::from("/tmp/syncd-test-defaults")),
            config_path: Some(PathBuf::from("/tmp/syncd-test-defaults/does-not-exist.toml")),
            ..Default::default()
        });
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
        assert!(cfg.allow_signup);
        assert_eq!(cfg.pool_max_handles, DEFAULT_POOL_MAX_HANDLES);
    }

    #[test]
    fn cli_override_wins_over_default() {
        let cfg = ServerConfig::new(CliOverrides {
            listen_addr: Some("0.0.0.0:9999".to_string()),
            data_dir: Some(PathBuf::from("/tmp/syncd-test-cli")),
            config_path: Some(PathBuf::from("/tmp/syncd-test-cli/does-not-exist.toml")),
            ..Default::default()
        });
        assert_eq!(cfg.listen_addr, "0.0.0.0:9999");
    }
}
