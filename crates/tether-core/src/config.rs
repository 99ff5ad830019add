use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Reference grace period between the last release and the actual close.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 2_000;
/// SQLite busy handler timeout applied on every open.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TETHER_CONFIG";

/// Top-level config (tether.toml + TETHER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
}

/// Connection target handed to the resource factory. Opaque to the lease core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Tuning for the shared-connection reservation registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Delay after the last release before the shared resource is closed.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Upper bound `cancel_all` waits for cancelled bodies before closing.
    /// Zero closes immediately.
    #[serde(default)]
    pub cancel_drain_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            cancel_drain_ms: 0,
        }
    }
}

impl LeaseConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn cancel_drain(&self) -> Option<Duration> {
        (self.cancel_drain_ms > 0).then(|| Duration::from_millis(self.cancel_drain_ms))
    }
}

fn default_grace_period_ms() -> u64 {
    DEFAULT_GRACE_PERIOD_MS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tether/tether.db", home)
}

impl TetherConfig {
    /// Load config from a TOML file with TETHER_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `TETHER_CONFIG`
    ///   3. ~/.tether/tether.toml
    ///
    /// Nested keys use a double underscore: `TETHER_LEASE__GRACE_PERIOD_MS=500`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::from(Serialized::defaults(TetherConfig::default()))
                .merge(Toml::file(&path))
                .merge(Env::prefixed("TETHER_").ignore(&["CONFIG"]).split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::TetherError::Config(e.to_string()))
    }

    /// Resolved config as pretty JSON, for `tether config`.
    pub fn to_json_pretty(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tether/tether.toml", home)
}
