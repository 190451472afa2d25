//! Configuration loading and typed config structures for LinkJam.
//!
//! Both binaries read the same `linkjam-config.yaml` (path overridable with
//! `LINKJAM_CONFIG`). Every section and field has a default, so a missing
//! file or an empty document yields a working configuration. Deployment
//! specific values can be overridden from the environment without editing
//! the file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::validation::{self, BoundsError};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "linkjam-config.yaml";

/// Environment variable naming an alternative configuration file.
pub const CONFIG_PATH_ENV: &str = "LINKJAM_CONFIG";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value for {name}: {reason}")]
    InvalidEnv {
        /// The variable name.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The configured room defaults are outside the tempo bounds.
    #[error("invalid room defaults: {0}")]
    RoomDefaults(#[from] BoundsError),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LinkJamConfig {
    /// Authority server settings.
    #[serde(default)]
    pub authority: AuthorityConfig,

    /// Defaults for lazily created rooms.
    #[serde(default)]
    pub rooms: RoomDefaults,

    /// Companion identity and connection policy.
    #[serde(default)]
    pub companion: CompanionConfig,

    /// Clock synchronization parameters.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Boundary scheduler parameters.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Local tempo engine bridge settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Logging output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LinkJamConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment overrides are applied after parsing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::InvalidEnv`] if an override is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string and apply env overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config = Self::parse_without_env(yaml)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, ignoring the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::RoomDefaults`] if the room defaults are out of bounds.
    pub fn parse_without_env(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yml::from_str(yaml)?;
        config.rooms.validate()?;
        Ok(config)
    }

    /// Load from `LINKJAM_CONFIG` or `linkjam-config.yaml`.
    ///
    /// A missing file is not an error: defaults plus env overrides are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// an env override is malformed.
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        let path = Path::new(&path);
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            let mut config = Self::default();
            config.apply_env_overrides()?;
            Ok(config)
        }
    }

    /// Override deployment values with environment variables when set.
    ///
    /// - `HOST`, `PORT` -- authority bind address
    /// - `AUTHORITY_URL`, `ROOM_ID`, `DJ_NAME` -- companion identity
    /// - `ENGINE_ADDR` -- tempo engine address
    /// - `LINKJAM_LOG_FORMAT` -- `json` or `pretty`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if `PORT` is not a port number.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("HOST") {
            self.authority.host = val;
        }
        if let Ok(val) = std::env::var("PORT") {
            self.authority.port = val.parse().map_err(|e| ConfigError::InvalidEnv {
                name: "PORT",
                reason: format!("{e}"),
            })?;
        }
        if let Ok(val) = std::env::var("AUTHORITY_URL") {
            self.companion.authority_url = val;
        }
        if let Ok(val) = std::env::var("ROOM_ID") {
            self.companion.room_id = val;
        }
        if let Ok(val) = std::env::var("DJ_NAME") {
            self.companion.dj_name = val;
        }
        if let Ok(val) = std::env::var("ENGINE_ADDR") {
            self.engine.addr = val;
        }
        if let Ok(val) = std::env::var("LINKJAM_LOG_FORMAT") {
            self.logging.json = val.eq_ignore_ascii_case("json");
        }
        Ok(())
    }
}

/// Authority server settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorityConfig {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between liveness sweeps of channel subscribers.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl AuthorityConfig {
    /// Liveness sweep period.
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

/// Initial tempo for rooms created on first access.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoomDefaults {
    /// Starting tempo.
    #[serde(default = "default_bpm")]
    pub bpm: f64,

    /// Starting beats per bar.
    #[serde(default = "default_bpi")]
    pub bpi: u32,
}

impl RoomDefaults {
    /// Check the defaults against the same bounds as client updates.
    pub fn validate(&self) -> Result<(), BoundsError> {
        validation::validate_bpm(self.bpm)?;
        validation::validate_bpi(i64::from(self.bpi))?;
        Ok(())
    }
}

impl Default for RoomDefaults {
    fn default() -> Self {
        Self {
            bpm: default_bpm(),
            bpi: default_bpi(),
        }
    }
}

/// Companion identity and connection policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CompanionConfig {
    /// Base HTTP URL of the authority (`ws://` is derived from it).
    #[serde(default = "default_authority_url")]
    pub authority_url: String,

    /// Room to join.
    #[serde(default = "default_room_id")]
    pub room_id: String,

    /// Name reported with tempo proposals.
    #[serde(default = "default_dj_name")]
    pub dj_name: String,

    /// Deadline for opening the channel.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Connection attempts before giving up.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Pause between connection attempts.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl CompanionConfig {
    /// Channel open deadline.
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Pause between connection attempts.
    pub const fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            authority_url: default_authority_url(),
            room_id: default_room_id(),
            dj_name: default_dj_name(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

/// Clock synchronization parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncConfig {
    /// Number of round trips per sync.
    #[serde(default = "default_sync_rounds")]
    pub rounds: u32,

    /// Deadline for a single round trip.
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,

    /// Pause between rounds.
    #[serde(default = "default_round_pause_ms")]
    pub round_pause_ms: u64,
}

impl SyncConfig {
    /// Deadline for a single round trip.
    pub const fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    /// Pause between rounds.
    pub const fn round_pause(&self) -> Duration {
        Duration::from_millis(self.round_pause_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rounds: default_sync_rounds(),
            round_timeout_ms: default_round_timeout_ms(),
            round_pause_ms: default_round_pause_ms(),
        }
    }
}

/// Boundary scheduler parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchedulerConfig {
    /// Below this many ms before a boundary, apply immediately instead of arming.
    #[serde(default = "default_guard_ms")]
    pub guard_ms: f64,

    /// The armed timer fires this many ms ahead of the boundary.
    #[serde(default = "default_lead_ms")]
    pub lead_ms: f64,

    /// Deadline for pushing a state to the tempo engine.
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Local tempo changes smaller than this are not proposed upstream.
    #[serde(default = "default_tempo_epsilon")]
    pub tempo_epsilon: f64,

    /// Minimum spacing between upstream proposals.
    #[serde(default = "default_proposal_cooldown_ms")]
    pub proposal_cooldown_ms: i64,
}

impl SchedulerConfig {
    /// Deadline for pushing a state to the tempo engine.
    pub const fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            guard_ms: default_guard_ms(),
            lead_ms: default_lead_ms(),
            apply_timeout_ms: default_apply_timeout_ms(),
            tempo_epsilon: default_tempo_epsilon(),
            proposal_cooldown_ms: default_proposal_cooldown_ms(),
        }
    }
}

/// Local tempo engine bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Loopback address of the engine's control port.
    #[serde(default = "default_engine_addr")]
    pub addr: String,

    /// Connection attempts at startup.
    #[serde(default = "default_engine_connect_attempts")]
    pub connect_attempts: u32,

    /// Pause between connection attempts.
    #[serde(default = "default_engine_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl EngineConfig {
    /// Pause between connection attempts.
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            addr: default_engine_addr(),
            connect_attempts: default_engine_connect_attempts(),
            retry_delay_ms: default_engine_retry_delay_ms(),
        }
    }
}

/// Logging output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    3000
}

const fn default_heartbeat_interval_secs() -> u64 {
    30
}

const fn default_bpm() -> f64 {
    174.0
}

const fn default_bpi() -> u32 {
    4
}

fn default_authority_url() -> String {
    "http://localhost:3000".to_owned()
}

fn default_room_id() -> String {
    "main".to_owned()
}

fn default_dj_name() -> String {
    "DJ".to_owned()
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_reconnect_attempts() -> u32 {
    5
}

const fn default_reconnect_backoff_ms() -> u64 {
    5_000
}

const fn default_sync_rounds() -> u32 {
    8
}

const fn default_round_timeout_ms() -> u64 {
    2_000
}

const fn default_round_pause_ms() -> u64 {
    100
}

const fn default_guard_ms() -> f64 {
    50.0
}

const fn default_lead_ms() -> f64 {
    20.0
}

const fn default_apply_timeout_ms() -> u64 {
    2_000
}

const fn default_tempo_epsilon() -> f64 {
    0.1
}

const fn default_proposal_cooldown_ms() -> i64 {
    1_000
}

fn default_engine_addr() -> String {
    "127.0.0.1:17000".to_owned()
}

const fn default_engine_connect_attempts() -> u32 {
    3
}

const fn default_engine_retry_delay_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = LinkJamConfig::default();
        assert_eq!(config.authority.port, 3000);
        assert_eq!(config.authority.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.rooms.bpi, 4);
        assert!((config.rooms.bpm - 174.0).abs() < f64::EPSILON);
        assert_eq!(config.sync.rounds, 8);
        assert_eq!(config.sync.round_timeout(), Duration::from_secs(2));
        assert_eq!(config.sync.round_pause(), Duration::from_millis(100));
        assert_eq!(config.engine.addr, "127.0.0.1:17000");
        assert_eq!(config.companion.reconnect_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(
            LinkJamConfig::parse_without_env("").unwrap(),
            LinkJamConfig::default()
        );
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let yaml = r"
authority:
  port: 8080
rooms:
  bpm: 128.0
scheduler:
  guard_ms: 80.0
";
        let config = LinkJamConfig::parse_without_env(yaml).unwrap();
        assert_eq!(config.authority.port, 8080);
        assert_eq!(config.authority.host, "0.0.0.0");
        assert!((config.rooms.bpm - 128.0).abs() < f64::EPSILON);
        assert_eq!(config.rooms.bpi, 4);
        assert!((config.scheduler.guard_ms - 80.0).abs() < f64::EPSILON);
        assert!((config.scheduler.lead_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn out_of_bounds_room_defaults_are_rejected() {
        let fast = LinkJamConfig::parse_without_env("rooms:\n  bpm: 1000.0\n");
        assert!(matches!(
            fast,
            Err(ConfigError::RoomDefaults(BoundsError::Bpm { .. }))
        ));

        let empty_bar = LinkJamConfig::parse_without_env("rooms:\n  bpi: 0\n");
        assert!(matches!(
            empty_bar,
            Err(ConfigError::RoomDefaults(BoundsError::Bpi { bpi: 0 }))
        ));

        let huge_bar = LinkJamConfig::parse_without_env("rooms:\n  bpi: 65\n").unwrap_err();
        assert_eq!(
            huge_bar.to_string(),
            "invalid room defaults: BPI must be between 1 and 64"
        );
    }

    #[test]
    fn full_yaml() {
        let yaml = r#"
authority:
  host: "127.0.0.1"
  port: 4000
  heartbeat_interval_secs: 10
companion:
  authority_url: "http://authority.local:4000"
  room_id: "friday"
  dj_name: "Nova"
sync:
  rounds: 4
  round_timeout_ms: 500
  round_pause_ms: 50
engine:
  addr: "127.0.0.1:17001"
logging:
  level: "debug"
  json: true
"#;
        let config = LinkJamConfig::parse_without_env(yaml).unwrap();
        assert_eq!(config.authority.heartbeat_interval_secs, 10);
        assert_eq!(config.companion.room_id, "friday");
        assert_eq!(config.sync.rounds, 4);
        assert_eq!(config.engine.addr, "127.0.0.1:17001");
        assert!(config.logging.json);
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        assert!(matches!(
            LinkJamConfig::parse_without_env("authority: [1, 2"),
            Err(ConfigError::Yaml { .. })
        ));
    }
}
