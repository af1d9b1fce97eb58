//! Clap derive structures for the `coinwall` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// coinwall -- access session engine for coin-operated Wi-Fi hotspots
#[derive(Debug, Parser)]
#[command(
    name = "coinwall",
    version,
    about = "Run and administer a coin-operated Wi-Fi hotspot",
    long_about = "Runs the access session engine (coin aggregation, countdown,\n\
        idle pausing, firewall reconciliation) and inspects its state.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "COINWALL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "COINWALL_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

impl GlobalOpts {
    pub fn config_file(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(coinwall_config::config_path)
    }
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the engine loops until interrupted
    Run(RunArgs),

    /// Show what an amount buys under the configured rates
    Quote(QuoteArgs),

    /// List the configured rate and point tiers
    Rates,

    /// Inspect and adjust stored sessions
    #[command(alias = "s")]
    Sessions(SessionsArgs),

    /// List recorded sales
    Sales,

    /// Manage the configuration file
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Run ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Stop after this long instead of waiting for Ctrl-C (e.g. "30s")
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<std::time::Duration>,
}

// ── Quote ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct QuoteArgs {
    /// Amount in currency units
    pub amount: u32,
}

// ── Sessions ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct SessionsArgs {
    #[command(subcommand)]
    pub command: SessionsCommand,
}

#[derive(Debug, Subcommand)]
pub enum SessionsCommand {
    /// List every stored session
    #[command(alias = "ls")]
    List(ListArgs),

    /// Show one session by MAC address
    Show {
        /// Device MAC address
        mac: String,
    },

    /// Grant time to a device outside the coin path
    Credit {
        /// Device MAC address
        mac: String,

        /// Time to add (e.g. "30m", "2h")
        #[arg(long, value_parser = humantime::parse_duration)]
        time: std::time::Duration,

        /// Download limit in kbps
        #[arg(long, default_value_t = 0)]
        download: u32,

        /// Upload limit in kbps
        #[arg(long, default_value_t = 0)]
        upload: u32,
    },

    /// Convert a device's points into time
    Redeem {
        /// Device MAC address
        mac: String,

        /// Points to spend
        points: u64,
    },
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only sessions with paid time left
    #[arg(long)]
    pub active: bool,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Show,

    /// Print the config file path
    Path,

    /// Store the sub-vendo shared key in the system keyring
    SetSubvendoKey {
        /// Shared key sub-vendo devices present
        #[arg(env = "COINWALL_SUBVENDO_KEY", hide_env_values = true)]
        key: String,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
