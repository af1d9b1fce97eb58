//! Config subcommand handlers.

use coinwall_config::Config;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

/// Copy of `cfg` that is safe to print.
fn redacted(cfg: &Config) -> Config {
    let mut cfg = cfg.clone();
    if cfg.coin.subvendo_key.is_some() {
        cfg.coin.subvendo_key = Some("********".into());
    }
    cfg
}

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = global.config_file();
    match args.command {
        // ── Init ────────────────────────────────────────────────────
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(CliError::Conflict {
                    resource_type: "config file".into(),
                    identifier: path.display().to_string(),
                });
            }
            coinwall_config::save_config(&coinwall_config::sample_config(), &path)
                .map_err(|e| CliError::config(&path, e))?;
            if !global.quiet {
                eprintln!("Wrote starter config to {}", path.display());
            }
            Ok(())
        }

        // ── Show ────────────────────────────────────────────────────
        ConfigCommand::Show => {
            let cfg = redacted(&super::load_config(global)?);
            let out = output::render_single(
                &global.output,
                &cfg,
                |c| toml::to_string_pretty(c).unwrap_or_else(|e| format!("<unrenderable: {e}>")),
                |_| path.display().to_string(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        // ── Path ────────────────────────────────────────────────────
        ConfigCommand::Path => {
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }

        // ── SetSubvendoKey ──────────────────────────────────────────
        ConfigCommand::SetSubvendoKey { key } => {
            if key.trim().is_empty() {
                return Err(CliError::Validation {
                    field: "key".into(),
                    reason: "sub-vendo key cannot be empty".into(),
                });
            }
            coinwall_config::store_subvendo_key(&key).map_err(|e| CliError::config(&path, e))?;
            if !global.quiet {
                eprintln!("Sub-vendo key stored in the system keyring");
            }
            Ok(())
        }
    }
}
