// ── Runtime engine configuration ──
//
// Every option the engine recognizes, with its default. The config crate
// reads TOML/env and builds one of these; the core never reads files
// for configuration.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::model::RateTable;

/// Coin channel behavior.
#[derive(Debug, Clone)]
pub struct CoinConfig {
    /// Finalize a freshly started session that never receives a pulse.
    pub start_timeout: Duration,
    /// Finalize after this long without a new pulse.
    pub pulse_timeout: Duration,
    /// Currency units credited per hardware/sub-vendo pulse.
    pub pulse_value: u32,
    /// Points earned per currency unit paid.
    pub points_earning_rate: f64,
    /// Shared key sub-vendo devices present with every pulse report.
    /// `None` rejects all sub-vendo traffic.
    pub subvendo_key: Option<SecretString>,
}

impl Default for CoinConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(60),
            pulse_timeout: Duration::from_secs(30),
            pulse_value: 1,
            points_earning_rate: 0.0,
            subvendo_key: None,
        }
    }
}

/// Countdown scheduler tuning.
#[derive(Debug, Clone)]
pub struct CountdownConfig {
    /// Delay between self-rescheduled ticks.
    pub tick: Duration,
    /// Re-resolve ip/interface every N ticks.
    pub roam_check_every: u32,
    /// Fetch traffic counters every N ticks.
    pub traffic_poll_every: u32,
    /// Byte delta (up + down) below which traffic does not count as activity.
    pub traffic_noise_bytes: u64,
}

impl Default for CountdownConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            roam_check_every: 10,
            traffic_poll_every: 1,
            traffic_noise_bytes: 2048,
        }
    }
}

/// Idle pause / logout tuning.
#[derive(Debug, Clone)]
pub struct IdleConfig {
    pub check_interval: Duration,
    /// Default idle window before a pausable session is paused.
    /// Sessions may override it; zero disables pausing.
    pub idle_timeout: Duration,
    /// How long an out-of-time session may stay connected while idle.
    pub session_expiry: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            session_expiry: Duration::from_secs(3600),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub rates: RateTable,
    pub coin: CoinConfig,
    pub countdown: CountdownConfig,
    pub idle: IdleConfig,
    /// Delay between reconciliation passes.
    pub reconcile_interval: Duration,
    /// Upper bound for any single enforcer call.
    pub enforcer_timeout: Duration,
    /// Durable state file. `None` keeps sessions in memory only.
    pub state_file: Option<PathBuf>,
    /// How often dirty state is flushed to `state_file`.
    pub persist_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rates: RateTable::default(),
            coin: CoinConfig::default(),
            countdown: CountdownConfig::default(),
            idle: IdleConfig::default(),
            reconcile_interval: Duration::from_secs(60),
            enforcer_timeout: Duration::from_secs(5),
            state_file: None,
            persist_interval: Duration::from_secs(15),
        }
    }
}
