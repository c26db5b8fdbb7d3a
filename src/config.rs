//! Server configuration: TOML file with per-field environment overrides.
//!
//! The config file path comes from `RADAR_SERVER_CONFIG` (default
//! `config.toml` in the working directory). A missing file is not an error,
//! every section has working defaults for a bench setup. Invalid values that
//! would leave the server in a nonsensical state (an unsupported sensor
//! protocol, a zero tick period) fail startup instead of being papered over.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Fastest tick the sensor link sustains; slower configs are clamped here.
pub const MAX_SAMPLE_PERIOD_MS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub radar: RadarConfig,
    pub store: StoreConfig,
    pub plc: PlcConfig,
}

/// HTTP + realtime listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Grace period for draining tasks on shutdown, seconds.
    pub shutdown_timeout_secs: u64,
}

/// Upstream sensor connection and acquisition policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadarConfig {
    pub host: String,
    pub port: u16,
    /// Only "ascii" is supported; the AUX monitoring port speaks it.
    pub protocol: String,
    pub sample_rate_ms: u64,
    pub max_consecutive_errors: u32,
    pub reconnect_delay_ms: u64,
    /// Minimum absolute velocity delta (m/s) worth a change event.
    pub min_velocity_change: f64,
}

/// Key/value time-series store (Redis) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
    pub prefix: String,
    pub enabled: bool,
    /// Cap of each per-channel position/velocity time-series ring.
    pub history_size: usize,
    /// Cap of the change-event rings (per channel and global).
    pub change_log_size: usize,
}

/// Optional industrial-controller mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcConfig {
    pub enabled: bool,
    pub host: String,
    pub rack: u16,
    pub slot: u16,
    pub update_rate_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.84".into(),
            port: 2111,
            protocol: "ascii".into(),
            sample_rate_ms: 100,
            max_consecutive_errors: 5,
            reconnect_delay_ms: 2000,
            min_velocity_change: 0.01,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
            password: String::new(),
            db: 0,
            prefix: "radar_sick".into(),
            enabled: true,
            history_size: 1000,
            change_log_size: 100,
        }
    }
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "192.168.1.100".into(),
            rack: 0,
            slot: 1,
            update_rate_ms: 500,
        }
    }
}

impl RadarConfig {
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_rate_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl StoreConfig {
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

/// Loads the configuration: defaults <- TOML file <- environment.
pub fn load() -> Result<Config> {
    let path = std::env::var("RADAR_SERVER_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let mut config = if Path::new(&path).exists() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {path}"))?;
        toml::from_str(&text).with_context(|| format!("invalid TOML in {path}"))?
    } else {
        info!("config file {path} not found, using defaults");
        Config::default()
    };

    apply_env_overrides(&mut config);
    validate(&mut config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    override_parsed("SERVER_PORT", &mut config.server.port);
    override_string("RADAR_HOST", &mut config.radar.host);
    override_parsed("RADAR_PORT", &mut config.radar.port);
    override_parsed("RADAR_SAMPLE_RATE_MS", &mut config.radar.sample_rate_ms);
    override_string("STORE_HOST", &mut config.store.host);
    override_parsed("STORE_PORT", &mut config.store.port);
    override_string("STORE_PASSWORD", &mut config.store.password);
    override_string("STORE_PREFIX", &mut config.store.prefix);
    override_parsed("STORE_ENABLED", &mut config.store.enabled);
}

fn override_string(var: &str, field: &mut String) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *field = value;
        }
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, field: &mut T) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => *field = parsed,
            Err(_) => warn!("ignoring unparsable {var}={value}"),
        }
    }
}

fn validate(config: &mut Config) -> Result<()> {
    if config.radar.protocol.to_lowercase() != "ascii" {
        bail!(
            "unsupported radar protocol '{}': only 'ascii' is implemented",
            config.radar.protocol
        );
    }
    if config.radar.sample_rate_ms == 0 {
        bail!("radar.sample_rate_ms must be positive");
    }
    if config.radar.sample_rate_ms > MAX_SAMPLE_PERIOD_MS {
        warn!(
            "sample period {}ms too slow for the sensor link, clamping to {}ms",
            config.radar.sample_rate_ms, MAX_SAMPLE_PERIOD_MS
        );
        config.radar.sample_rate_ms = MAX_SAMPLE_PERIOD_MS;
    }
    if config.store.history_size == 0 || config.store.change_log_size == 0 {
        bail!("store ring sizes must be positive");
    }
    Ok(())
}
