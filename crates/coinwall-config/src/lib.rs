//! Configuration for the coinwall daemon and CLI.
//!
//! TOML file + `COINWALL_*` environment overrides, sub-vendo shared-key
//! resolution (env + keyring + plaintext), and translation into
//! `coinwall_core::EngineConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use coinwall_core::{
    CoinConfig, CountdownConfig, EngineConfig, IdleConfig, PointTier, RateTable, RateTier,
};

/// Keyring service name for stored secrets.
pub const KEYRING_SERVICE: &str = "coinwall";
const SUBVENDO_KEY_ENTRY: &str = "subvendo-key";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub coin: CoinSection,

    #[serde(default)]
    pub countdown: CountdownSection,

    #[serde(default)]
    pub idle: IdleSection,

    #[serde(default)]
    pub logging: LoggingSection,

    /// `[[rates]]` tables.
    #[serde(default)]
    pub rates: Vec<RateTier>,

    /// `[[point_rates]]` tables.
    #[serde(default)]
    pub point_rates: Vec<PointTier>,
}

/// Loop intervals and persistence.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSection {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: String,

    /// Upper bound for one call into the enforcement backend.
    #[serde(default = "default_enforcer_timeout")]
    pub enforcer_timeout: String,

    #[serde(default = "default_persist_interval")]
    pub persist_interval: String,

    /// Session state file. Defaults to the platform data directory.
    pub state_file: Option<PathBuf>,

    /// Keep sessions in memory only.
    #[serde(default)]
    pub ephemeral: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            reconcile_interval: default_reconcile_interval(),
            enforcer_timeout: default_enforcer_timeout(),
            persist_interval: default_persist_interval(),
            state_file: None,
            ephemeral: false,
        }
    }
}

fn default_reconcile_interval() -> String {
    "60s".into()
}
fn default_enforcer_timeout() -> String {
    "5s".into()
}
fn default_persist_interval() -> String {
    "15s".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoinSection {
    #[serde(default = "default_start_timeout")]
    pub start_timeout: String,

    #[serde(default = "default_pulse_timeout")]
    pub pulse_timeout: String,

    #[serde(default = "default_pulse_value")]
    pub pulse_value: u32,

    #[serde(default)]
    pub points_earning_rate: f64,

    /// Shared sub-vendo key (plaintext; prefer keyring or env var).
    pub subvendo_key: Option<String>,

    /// Environment variable holding the shared sub-vendo key.
    pub subvendo_key_env: Option<String>,
}

impl Default for CoinSection {
    fn default() -> Self {
        Self {
            start_timeout: default_start_timeout(),
            pulse_timeout: default_pulse_timeout(),
            pulse_value: default_pulse_value(),
            points_earning_rate: 0.0,
            subvendo_key: None,
            subvendo_key_env: None,
        }
    }
}

fn default_start_timeout() -> String {
    "60s".into()
}
fn default_pulse_timeout() -> String {
    "30s".into()
}
fn default_pulse_value() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CountdownSection {
    #[serde(default = "default_tick")]
    pub tick: String,

    #[serde(default = "default_roam_check_every")]
    pub roam_check_every: u32,

    #[serde(default = "default_traffic_poll_every")]
    pub traffic_poll_every: u32,

    /// Traffic below this per poll is not activity, e.g. "2KiB".
    #[serde(default = "default_traffic_noise")]
    pub traffic_noise: String,
}

impl Default for CountdownSection {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            roam_check_every: default_roam_check_every(),
            traffic_poll_every: default_traffic_poll_every(),
            traffic_noise: default_traffic_noise(),
        }
    }
}

fn default_tick() -> String {
    "1s".into()
}
fn default_roam_check_every() -> u32 {
    10
}
fn default_traffic_poll_every() -> u32 {
    1
}
fn default_traffic_noise() -> String {
    "2KiB".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdleSection {
    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    /// "0s" disables idle pausing.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,

    #[serde(default = "default_session_expiry")]
    pub session_expiry: String,
}

impl Default for IdleSection {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            idle_timeout: default_idle_timeout(),
            session_expiry: default_session_expiry(),
        }
    }
}

fn default_check_interval() -> String {
    "10s".into()
}
fn default_idle_timeout() -> String {
    "5m".into()
}
fn default_session_expiry() -> String {
    "1h".into()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingSection {
    /// Default filter directive when neither `-v` nor `RUST_LOG` is given.
    pub level: Option<String>,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Also write a daily-rotated log file into this directory.
    pub directory: Option<PathBuf>,
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "coinwall", "coinwall")
}

fn home_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("coinwall");
    p
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback().join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default location of the session state file.
pub fn default_state_file() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback().join("sessions.json"),
        |dirs| dirs.data_dir().join("sessions.json"),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

fn figment_for(path: &Path) -> Figment {
    // Nested keys use a double underscore: COINWALL_COIN__PULSE_VALUE=5
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("COINWALL_").split("__"))
}

/// Load config from the default path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load config from `path` + environment. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    Ok(figment_for(path).extract()?)
}

/// Parse a TOML document on its own, without environment overrides.
pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    Ok(Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::string(text))
        .extract()?)
}

// ── Saving ──────────────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

/// A starter config with a typical peso-coin rate table.
pub fn sample_config() -> Config {
    Config {
        rates: vec![
            RateTier::new(1, 15),
            RateTier::new(5, 120).with_speeds(3072, 1024),
            RateTier::new(10, 300).with_speeds(5120, 2048),
        ],
        point_rates: vec![PointTier {
            points: 10,
            minutes: 30,
            duration: None,
            upload_speed: 0,
            download_speed: 0,
        }],
        ..Config::default()
    }
}

// ── Secret resolution ───────────────────────────────────────────────

/// Resolve the shared sub-vendo key.
///
/// Order: the env var named by `coin.subvendo_key_env`, then the system
/// keyring, then plaintext in the config. `None` disables sub-vendo
/// devices.
pub fn resolve_subvendo_key(cfg: &Config) -> Option<SecretString> {
    // 1. Named env var
    if let Some(ref env_name) = cfg.coin.subvendo_key_env {
        if let Ok(val) = std::env::var(env_name) {
            return Some(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, SUBVENDO_KEY_ENTRY) {
        if let Ok(secret) = entry.get_password() {
            return Some(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config
    cfg.coin
        .subvendo_key
        .as_ref()
        .map(|key| SecretString::from(key.clone()))
}

/// Store the shared sub-vendo key in the system keyring.
pub fn store_subvendo_key(key: &str) -> Result<(), ConfigError> {
    keyring::Entry::new(KEYRING_SERVICE, SUBVENDO_KEY_ENTRY)?.set_password(key)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

fn duration(field: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim()).map_err(|e| invalid(field, format!("'{raw}': {e}")))
}

fn positive_duration(field: &str, raw: &str) -> Result<Duration, ConfigError> {
    let d = duration(field, raw)?;
    if d.is_zero() {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(d)
}

fn validate_rates(rates: &[RateTier], point_rates: &[PointTier]) -> Result<(), ConfigError> {
    for (i, tier) in rates.iter().enumerate() {
        if tier.amount == 0 {
            return Err(invalid(format!("rates[{i}].amount"), "must be at least 1"));
        }
        if tier.minutes == 0 {
            return Err(invalid(format!("rates[{i}].minutes"), "must be at least 1"));
        }
    }
    for (i, tier) in point_rates.iter().enumerate() {
        if tier.points == 0 {
            return Err(invalid(format!("point_rates[{i}].points"), "must be at least 1"));
        }
        if tier.seconds() == 0 {
            return Err(invalid(
                format!("point_rates[{i}]"),
                "needs minutes or duration",
            ));
        }
    }
    Ok(())
}

/// Build the engine's runtime config. Secrets are resolved here.
pub fn to_engine_config(cfg: &Config) -> Result<EngineConfig, ConfigError> {
    validate_rates(&cfg.rates, &cfg.point_rates)?;

    if cfg.coin.pulse_value == 0 {
        return Err(invalid("coin.pulse_value", "must be at least 1"));
    }
    if !cfg.coin.points_earning_rate.is_finite() || cfg.coin.points_earning_rate < 0.0 {
        return Err(invalid("coin.points_earning_rate", "must be zero or positive"));
    }

    let traffic_noise: ByteSize = cfg
        .countdown
        .traffic_noise
        .parse()
        .map_err(|e: String| invalid("countdown.traffic_noise", e))?;

    let state_file = if cfg.engine.ephemeral {
        None
    } else {
        Some(
            cfg.engine
                .state_file
                .clone()
                .unwrap_or_else(default_state_file),
        )
    };

    Ok(EngineConfig {
        rates: RateTable::new(cfg.rates.clone(), cfg.point_rates.clone()),
        coin: CoinConfig {
            start_timeout: positive_duration("coin.start_timeout", &cfg.coin.start_timeout)?,
            pulse_timeout: positive_duration("coin.pulse_timeout", &cfg.coin.pulse_timeout)?,
            pulse_value: cfg.coin.pulse_value,
            points_earning_rate: cfg.coin.points_earning_rate,
            subvendo_key: resolve_subvendo_key(cfg),
        },
        countdown: CountdownConfig {
            tick: positive_duration("countdown.tick", &cfg.countdown.tick)?,
            roam_check_every: cfg.countdown.roam_check_every,
            traffic_poll_every: cfg.countdown.traffic_poll_every,
            traffic_noise_bytes: traffic_noise.as_u64(),
        },
        idle: IdleConfig {
            check_interval: positive_duration("idle.check_interval", &cfg.idle.check_interval)?,
            idle_timeout: duration("idle.idle_timeout", &cfg.idle.idle_timeout)?,
            session_expiry: duration("idle.session_expiry", &cfg.idle.session_expiry)?,
        },
        reconcile_interval: positive_duration(
            "engine.reconcile_interval",
            &cfg.engine.reconcile_interval,
        )?,
        enforcer_timeout: positive_duration(
            "engine.enforcer_timeout",
            &cfg.engine.enforcer_timeout,
        )?,
        state_file,
        persist_interval: positive_duration(
            "engine.persist_interval",
            &cfg.engine.persist_interval,
        )?,
    })
}
