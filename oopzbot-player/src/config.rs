//! Configuration for the oopzbot playback core
//!
//! Bootstrap configuration is a single TOML file; every section and every
//! field is optional and falls back to the built-in defaults below.
//!
//! ```toml
//! [server]
//! port = 8080
//!
//! [resolver]
//! base_url = "http://127.0.0.1:3000"
//! attempts = 2
//!
//! [[actuator.backends]]
//! name = "chrome"
//! endpoint = "http://127.0.0.1:9515"
//! browser = "chrome"
//! ```

use crate::actuator::RoomCredentials;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete bootstrap configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub playback: PlaybackConfig,
    pub resolver: ResolverConfig,
    pub cache: CacheConfig,
    pub relay: RelayConfig,
    pub store: StoreConfig,
    pub actuator: ActuatorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from a TOML file (missing file means defaults) and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Config = oopzbot_common::config::load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.playback.default_volume > 100 {
            return Err(Error::Config(format!(
                "playback.default_volume must be 0-100, got {}",
                self.playback.default_volume
            )));
        }
        if self.playback.tick_interval_ms == 0 {
            return Err(Error::Config("playback.tick_interval_ms must be > 0".into()));
        }
        if self.resolver.attempts == 0 {
            return Err(Error::Config("resolver.attempts must be >= 1".into()));
        }
        if self.store.write_attempts == 0 {
            return Err(Error::Config("store.write_attempts must be >= 1".into()));
        }
        if self.actuator.heartbeat_interval_ms == 0 {
            return Err(Error::Config("actuator.heartbeat_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// HTTP state/command API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to `<data dir>/oopzbot.db`
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| oopzbot_common::config::default_data_dir().join("oopzbot.db"))
    }
}

/// Playback controller knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Period of the elapsed-time check that drives auto-advance
    pub tick_interval_ms: u64,
    /// Duration assumed for tracks that report none
    pub default_duration_secs: u64,
    /// Volume at startup when no previous state exists, 0-100
    pub default_volume: u8,
    /// Pre-resolve the next queue head while a track plays
    pub prefetch: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            default_duration_secs: 300,
            default_volume: 100,
            prefetch: true,
        }
    }
}

impl PlaybackConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Track-resolution provider (NetEase-compatible HTTP API)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub base_url: String,
    pub cookie: Option<String>,
    /// `standard` (small, weak-network friendly) or `exhigh`
    pub audio_quality: String,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Attempts per resolution before the track is skipped
    pub attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            cookie: None,
            audio_quality: "standard".to_string(),
            timeout_ms: 10_000,
            attempts: 2,
            backoff_ms: 500,
            max_backoff_ms: 5_000,
        }
    }
}

impl ResolverConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            timeout: Duration::from_millis(self.timeout_ms),
            initial_backoff: Duration::from_millis(self.backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// LRU eviction keeps at most this many entries (0 = unbounded)
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 2_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bounded wait of one blocking pop on the command list
    pub wait_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { wait_ms: 100 }
    }
}

impl RelayConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Which shared state store implementation to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process only; presentation layers go through the HTTP API
    Memory,
    /// SQLite tables, readable by other processes
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub write_timeout_ms: u64,
    pub write_attempts: u32,
    pub backoff_ms: u64,
    /// Retry period for a snapshot whose write failed
    pub reconcile_interval_ms: u64,
    /// Poll period of blocking reads on the SQLite store
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            write_timeout_ms: 1_000,
            write_attempts: 3,
            backoff_ms: 50,
            reconcile_interval_ms: 2_000,
            poll_interval_ms: 25,
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.write_attempts,
            timeout: Duration::from_millis(self.write_timeout_ms),
            initial_backoff: Duration::from_millis(self.backoff_ms),
            max_backoff: Duration::from_millis(self.backoff_ms.saturating_mul(8)),
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Bound of one write, shared by state documents and the queue table
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Streaming actuator bridge
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Run without any backend (permanent degraded mode) when false
    pub enabled: bool,
    pub heartbeat_interval_ms: u64,
    /// A heartbeat slower than this counts as a dead agent
    pub heartbeat_timeout_ms: u64,
    /// Bound for bringing up one backend (browser launch + page ready)
    pub init_timeout_ms: u64,
    /// Bound for a single transport operation
    pub op_timeout_ms: u64,
    /// Page hosting the RTC player (`window.rtcPlay` and friends)
    pub page_url: String,
    /// Tried in order on startup and on every failover
    pub backends: Vec<BackendConfig>,
    /// Voice room joined at startup; the chat side may also supply it later
    pub room: Option<RoomCredentials>,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_ms: 2_000,
            heartbeat_timeout_ms: 5_000,
            init_timeout_ms: 60_000,
            op_timeout_ms: 10_000,
            page_url: "file:///usr/share/oopzbot/rtc_player.html".to_string(),
            backends: vec![
                BackendConfig {
                    name: "chrome".to_string(),
                    endpoint: "http://127.0.0.1:9515".to_string(),
                    browser: "chrome".to_string(),
                    args: Vec::new(),
                },
                BackendConfig {
                    name: "edge".to_string(),
                    endpoint: "http://127.0.0.1:9516".to_string(),
                    browser: "MicrosoftEdge".to_string(),
                    args: Vec::new(),
                },
            ],
            room: None,
        }
    }
}

impl ActuatorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// One WebDriver-controlled browser
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// WebDriver server, e.g. chromedriver on `http://127.0.0.1:9515`
    pub endpoint: String,
    /// W3C `browserName` capability
    #[serde(default = "default_browser")]
    pub browser: String,
    /// Extra command-line switches for the browser
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_browser() -> String {
    "chrome".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.wait(), Duration::from_millis(100));
        assert_eq!(config.resolver.attempts, 2);
        assert_eq!(config.actuator.backends.len(), 2);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [store]
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.playback.default_duration_secs, 300);
    }

    #[test]
    fn test_backend_list_order_preserved() {
        let config: Config = toml::from_str(
            r#"
            [[actuator.backends]]
            name = "edge"
            endpoint = "http://127.0.0.1:9516"
            browser = "MicrosoftEdge"

            [[actuator.backends]]
            name = "chrome"
            endpoint = "http://127.0.0.1:9515"
            "#,
        )
        .unwrap();

        let names: Vec<_> = config.actuator.backends.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["edge", "chrome"]);
        assert_eq!(config.actuator.backends[1].browser, "chrome");
    }

    #[test]
    fn test_room_credentials() {
        let config: Config = toml::from_str(
            r#"
            [actuator.room]
            app_id = "a1"
            channel = "lobby"
            uid = "bot"
            "#,
        )
        .unwrap();

        let room = config.actuator.room.unwrap();
        assert_eq!(room.channel, "lobby");
        assert!(room.token.is_none());
        assert!(Config::default().actuator.room.is_none());
    }

    #[test]
    fn test_invalid_volume_rejected() {
        let mut config = Config::default();
        config.playback.default_volume = 150;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
