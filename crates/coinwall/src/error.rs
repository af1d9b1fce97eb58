//! CLI error types with miette diagnostics.
//!
//! Maps engine and config failures into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use coinwall_config::ConfigError;
use coinwall_core::{EnforceError, EngineError, StoreError};

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Could not load configuration from {path}")]
    #[diagnostic(
        code(coinwall::config),
        help(
            "Fix the file, or write a fresh one with: coinwall config init --force\n\
             Environment overrides use COINWALL_<SECTION>__<KEY>."
        )
    )]
    Config {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("No state file configured")]
    #[diagnostic(
        code(coinwall::no_state_file),
        help("engine.ephemeral is set, so sessions are never written to disk.")
    )]
    NoStateFile,

    #[error("Could not access the session state file: {0}")]
    #[diagnostic(
        code(coinwall::state_file),
        help("Check permissions on engine.state_file. Writes are refused while `coinwall run` holds it; stop the daemon first.")
    )]
    StateFile(#[source] StoreError),

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(coinwall::not_found),
        help("Run: coinwall {list_command} to see available {resource_type}s")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    #[error("{resource_type} '{identifier}' already exists")]
    #[diagnostic(code(coinwall::conflict))]
    Conflict {
        resource_type: String,
        identifier: String,
    },

    // ── Engine ───────────────────────────────────────────────────────
    #[error("Request rejected: {message}")]
    #[diagnostic(code(coinwall::rejected))]
    Rejected { message: String },

    #[error("Sub-vendo device '{device_id}' failed authentication")]
    #[diagnostic(
        code(coinwall::auth_failed),
        help("Store the shared key with: coinwall config set-subvendo-key")
    )]
    AuthFailed { device_id: String },

    #[error("Enforcement backend failed")]
    #[diagnostic(
        code(coinwall::enforcer),
        help("The reconciler retries on its next pass. Run with -v for details.")
    )]
    Enforcer(#[source] EnforceError),

    #[error("Enforcement backend call timed out after {seconds}s")]
    #[diagnostic(
        code(coinwall::timeout),
        help("Raise engine.enforcer_timeout or check the gateway's load.")
    )]
    Timeout { seconds: u64 },

    #[error("The engine is not running")]
    #[diagnostic(code(coinwall::not_running))]
    NotRunning,

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(coinwall::validation))]
    Validation { field: String, reason: String },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render JSON: {0}")]
    #[diagnostic(code(coinwall::json))]
    Json(#[from] serde_json::Error),

    #[error("Could not render YAML: {0}")]
    #[diagnostic(code(coinwall::yaml))]
    Yaml(#[from] serde_yaml::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Enforcer(_) => exit_code::CONNECTION,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Conflict { .. } => exit_code::CONFLICT,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::NoStateFile => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }

    pub fn config(path: &std::path::Path, source: ConfigError) -> Self {
        match source {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            source => Self::Config {
                path: path.display().to_string(),
                source,
            },
        }
    }
}

// ── EngineError → CliError mapping ───────────────────────────────────

impl From<EngineError> for CliError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ChannelBusy { channel, .. } => CliError::Conflict {
                resource_type: "coin session on channel".into(),
                identifier: channel.to_string(),
            },

            EngineError::SessionNotFound { mac } => CliError::NotFound {
                resource_type: "session".into(),
                identifier: mac.to_string(),
                list_command: "sessions list".into(),
            },

            EngineError::NoActiveSession { channel } => CliError::NotFound {
                resource_type: "coin session".into(),
                identifier: channel.to_string(),
                list_command: "run -v".into(),
            },

            EngineError::SubVendoAuthFailed { device_id } => CliError::AuthFailed { device_id },

            EngineError::InvalidRequest { message } => CliError::Validation {
                field: "request".into(),
                reason: message,
            },

            err @ (EngineError::NoApplicableRate { .. }
            | EngineError::InsufficientPoints { .. }) => CliError::Rejected {
                message: err.to_string(),
            },

            EngineError::NotRunning => CliError::NotRunning,

            EngineError::Store(e) => CliError::StateFile(e),

            EngineError::Enforcer(EnforceError::Timeout { timeout, .. }) => CliError::Timeout {
                seconds: timeout.as_secs(),
            },

            EngineError::Enforcer(e) => CliError::Enforcer(e),
        }
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        CliError::StateFile(err)
    }
}
