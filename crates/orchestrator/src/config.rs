//! Master configuration, read once at startup.
//!
//! `core/src/config.rs` keeps a single `RwLock<ServerConfig>` global that
//! every module reaches into directly. This generalizes that into an
//! immutable [`Config`] value owned by [`crate::context::Context`] and handed
//! out by reference; singletons are kept only for the Persistent-ID Allocator
//! and the Session Registry.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

/// Environment variable naming the config file path, checked before the
/// `./master.toml` default (mirrors the `$REDIS_HOST`/`$REDIS_PORT`
/// overrides in `core/src/main.rs`, generalized to a whole config file).
pub const CONFIG_PATH_ENV: &str = "MASTER_CONFIG";

/// Default config file path when `$MASTER_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "master.toml";

/// All configuration read once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// IP address advertised to clients and upserted into the `servers` table.
    pub external_ip: String,
    /// IP address the master binds its listener to.
    pub master_ip: String,
    /// Port the master listens on.
    pub port: u16,
    /// Maximum concurrent client connections.
    pub max_clients: u32,
    /// Map IDs to launch one world instance for at boot, before the control
    /// loop starts servicing `REQUEST_ZONE_TRANSFER`.
    #[serde(default)]
    pub prestart_servers: Vec<u16>,
    /// Whether to also log to stdout in addition to the log file.
    #[serde(default = "default_true")]
    pub log_to_console: bool,
    /// Whether debug-level statements are emitted.
    #[serde(default)]
    pub log_debug_statements: bool,
    /// Whether to prefix world-server spawns with `sudo` (compatibility flag).
    #[serde(default)]
    pub use_sudo_auth: bool,
    /// Whether to prefix the chat relay spawn with `sudo`.
    #[serde(default)]
    pub use_sudo_chat: bool,
    /// SQL connection string for persisted state (the `servers` table and the
    /// Persistent-ID high-water mark).
    pub sql_connection: String,
    /// Directory client assets are served from; opened read-only at startup
    /// and otherwise out of scope.
    pub client_location: PathBuf,
    /// Path to the world-server binary this orchestrator spawns.
    pub world_binary: PathBuf,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Loads configuration from `$MASTER_CONFIG` or [`DEFAULT_CONFIG_PATH`].
    pub fn load() -> anyhow::Result<Config> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading config file at {path}"))?;

        Self::parse(&raw)
    }

    /// Parses configuration from an in-memory TOML string (used by tests and
    /// by [`Config::load`]).
    pub fn parse(raw: &str) -> anyhow::Result<Config> {
        toml::from_str(raw).context("parsing master configuration")
    }

    /// The socket address the master should bind its listener to.
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.master_ip, self.port).parse().context("parsing master_ip:port as a socket address")
    }
}

/// Fixed-tick cadence of the control loop: ~60 Hz, matching the game's own
/// simulation rate.
pub const HIGH_FRAME_RATE: Duration = Duration::from_millis(1000 / 60);

/// Ticks an instance's [`crate::instance::Instance::affirmation_timeout`] may
/// reach before it is declared wedged.
pub const AFFIRMATION_TIMEOUT_TICKS: u32 = 1000;

/// Interval between log flushes in the control loop.
pub const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(15);

/// Interval between SQL keep-alive touches in the control loop.
pub const SQL_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Drain window for a universe shutdown, counted in ticks.
pub const UNIVERSE_SHUTDOWN_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Drain window for the shutdown coordinator's instance drain.
pub const SHUTDOWN_DRAIN_WINDOW: Duration = Duration::from_secs(60);

/// Default soft/hard player caps for a newly created instance.
pub const DEFAULT_SOFT_CAP: u32 = 12;
pub const DEFAULT_HARD_CAP: u32 = 12;

#[cfg(test)]
mod test {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
            external_ip = "203.0.113.10"
            master_ip = "0.0.0.0"
            port = 9100
            max_clients = 2000
            sql_connection = "sqlite://master.db"
            client_location = "./client"
            world_binary = "./bin/worldserver"
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::parse(sample_toml()).expect("parse");
        assert_eq!(config.port, 9100);
        assert!(config.log_to_console);
        assert!(!config.log_debug_statements);
        assert!(config.prestart_servers.is_empty());
    }

    #[test]
    fn computes_bind_addr() {
        let config = Config::parse(sample_toml()).expect("parse");
        assert_eq!(config.bind_addr().unwrap().port(), 9100);
    }

    #[test]
    fn rejects_missing_required_field() {
        let raw = r#"
            master_ip = "0.0.0.0"
            port = 9100
        "#;
        assert!(Config::parse(raw).is_err());
    }
}
