// ── Core error types ──
//
// Three families, split by how callers handle them:
//
// - `EngineError` rejections are user-facing answers ("channel busy",
//   "not enough points") and are returned to the portal as-is.
// - `EnforceError` is a transient failure talking to the enforcement
//   layer. Loops log it and move on; the reconciler repairs the drift.
// - `StoreError` covers the durable state file.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::{ChannelKey, MacAddress};

/// Failure of a single call into the enforcement layer.
#[derive(Debug, Error)]
pub enum EnforceError {
    #[error("enforcer call '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("enforcer rejected '{operation}': {reason}")]
    Rejected {
        operation: &'static str,
        reason: String,
    },

    #[error("enforcer backend error: {0}")]
    Backend(String),
}

/// Failure reading or writing durable session state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("failed to replace state file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("state file {} is locked by another coinwall process", path.display())]
    Locked { path: PathBuf },
}

/// Unified error type for request-facing engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── User-facing rejections ───────────────────────────────────────
    #[error("coin channel {channel} is in use by another device")]
    ChannelBusy {
        channel: ChannelKey,
        bound_to: MacAddress,
    },

    #[error("no rate applies to an amount of {amount}")]
    NoApplicableRate { amount: u64 },

    #[error("insufficient points: {requested} requested, {available} available")]
    InsufficientPoints { requested: u64, available: u64 },

    #[error("no session for device {mac}")]
    SessionNotFound { mac: MacAddress },

    #[error("sub-vendo device '{device_id}' failed authentication")]
    SubVendoAuthFailed { device_id: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    // ── Data-integrity guard ─────────────────────────────────────────
    #[error("no active coin session on channel {channel}")]
    NoActiveSession { channel: ChannelKey },

    // ── Lifecycle / infrastructure ───────────────────────────────────
    #[error("engine is not running")]
    NotRunning,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Enforcer(#[from] EnforceError),
}

impl EngineError {
    /// Whether this is an expected answer to a user request rather than a
    /// system failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ChannelBusy { .. }
                | Self::NoApplicableRate { .. }
                | Self::InsufficientPoints { .. }
                | Self::SessionNotFound { .. }
                | Self::SubVendoAuthFailed { .. }
                | Self::InvalidRequest { .. }
                | Self::NoActiveSession { .. }
        )
    }
}
