//! Command handlers and the config/engine plumbing they share.

pub mod config_cmd;
pub mod rates;
pub mod run;
pub mod sessions;

use std::sync::Arc;

use coinwall_config::Config;
use coinwall_core::{EngineConfig, MacAddress, MemoryEnforcer, MemoryRelay, SessionEngine};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load the config file named by `--config` (or the default path).
pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = global.config_file();
    coinwall_config::load_config_from(&path).map_err(|e| CliError::config(&path, e))
}

/// Load and validate the config into the engine's runtime form.
pub fn engine_config(global: &GlobalOpts) -> Result<EngineConfig, CliError> {
    let path = global.config_file();
    let cfg = load_config(global)?;
    coinwall_config::to_engine_config(&cfg).map_err(|e| CliError::config(&path, e))
}

/// An engine over the stored sessions with an in-process enforcer.
///
/// Used for offline edits to the state file; its loops are never started.
/// Opening fails while `coinwall run` holds the state file.
pub fn offline_engine(global: &GlobalOpts) -> Result<SessionEngine, CliError> {
    let config = engine_config(global)?;
    if config.state_file.is_none() {
        return Err(CliError::NoStateFile);
    }
    Ok(SessionEngine::new(
        config,
        Arc::new(MemoryEnforcer::new()),
        Arc::new(MemoryRelay::new()),
    )?)
}

pub fn parse_mac(raw: &str) -> Result<MacAddress, CliError> {
    let mac = MacAddress::new(raw);
    if mac.is_valid() {
        Ok(mac)
    } else {
        Err(CliError::Validation {
            field: "mac".into(),
            reason: format!("'{raw}' is not a MAC address"),
        })
    }
}
