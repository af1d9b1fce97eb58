// ── Session domain type ──
//
// One durable billing row per device. Every mutation from the coin
// aggregator, scheduler loops, and request handlers lands here.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::mac::MacAddress;

/// Per-device billing and access state.
///
/// Invariants maintained by the engine:
/// - `is_paused` means the countdown skips the row and the device is not
///   enforced-allowed.
/// - `time_remaining == 0` means the device is not enforced-allowed and the
///   clock stays at zero until a new credit arrives.
/// - `download_speed` / `upload_speed` only ever grow through payments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    // Identity
    pub mac: MacAddress,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub interface: Option<String>,

    // Billing
    /// Seconds of paid access left.
    pub time_remaining: u64,
    /// Seconds ever credited to this device.
    pub total_time: u64,
    #[serde(default)]
    pub points_balance: u64,
    pub user_code: String,

    // Shaping (kbps, 0 = unshaped)
    #[serde(default)]
    pub download_speed: u32,
    #[serde(default)]
    pub upload_speed: u32,

    // Status
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub is_paused: bool,
    /// Whether the idle monitor may pause this session. Sticky once set.
    #[serde(default)]
    pub pausable: bool,
    /// Per-session idle timeout override in seconds.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    // Activity
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub last_traffic_at: Option<DateTime<Utc>>,
    /// Absolute logout deadline for sessions that ran out of time.
    #[serde(default)]
    pub session_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,

    // Accounting (bytes)
    #[serde(default)]
    pub total_data_up: u64,
    #[serde(default)]
    pub total_data_down: u64,
}

impl Session {
    /// A fresh, empty row for a device seen for the first time.
    pub fn new(mac: MacAddress, now: DateTime<Utc>) -> Self {
        Self {
            mac,
            client_id: None,
            ip: None,
            interface: None,
            time_remaining: 0,
            total_time: 0,
            points_balance: 0,
            user_code: generate_user_code(),
            download_speed: 0,
            upload_speed: 0,
            is_connected: false,
            is_paused: false,
            pausable: false,
            idle_timeout_secs: None,
            last_active_at: now,
            last_traffic_at: None,
            session_expiry: None,
            created_at: now,
            total_data_up: 0,
            total_data_down: 0,
        }
    }

    /// Connected, not paused, and holding paid time: the countdown bills
    /// this row and the enforcer should allow it.
    pub fn is_billable(&self) -> bool {
        self.is_connected && !self.is_paused && self.time_remaining > 0
    }

    /// Most recent sign of life, from either the portal or traffic counters.
    pub fn last_activity(&self) -> DateTime<Utc> {
        match self.last_traffic_at {
            Some(traffic) if traffic > self.last_active_at => traffic,
            _ => self.last_active_at,
        }
    }

    /// Apply a paid (or free) credit.
    ///
    /// Adds time, raises speeds to `max(current, new)`, unpauses, and marks
    /// the device connected.
    pub fn apply_credit(&mut self, credit: &Credit, now: DateTime<Utc>) {
        self.time_remaining = self.time_remaining.saturating_add(credit.seconds);
        self.total_time = self.total_time.saturating_add(credit.seconds);
        self.download_speed = self.download_speed.max(credit.download_speed);
        self.upload_speed = self.upload_speed.max(credit.upload_speed);
        self.points_balance = self.points_balance.saturating_add(credit.points_earned);
        self.pausable |= credit.pausable;
        self.is_paused = false;
        self.is_connected = true;
        self.session_expiry = None;
        self.last_active_at = now;
    }

    /// Snapshot view of how the device looks to a portal.
    pub fn state(&self) -> SessionState {
        if self.is_paused {
            SessionState::Paused
        } else if self.is_billable() {
            SessionState::Active
        } else if self.is_connected {
            SessionState::Expired
        } else {
            SessionState::Offline
        }
    }
}

/// Time and shaping granted by a payment, voucher, or point redemption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credit {
    pub seconds: u64,
    pub download_speed: u32,
    pub upload_speed: u32,
    pub pausable: bool,
    pub points_earned: u64,
}

/// Coarse lifecycle state derived from the row's flags.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Active,
    Paused,
    Expired,
    Offline,
}

/// Six-character human-facing code shown on the portal receipt.
fn generate_user_code() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(6)
        .collect::<String>()
        .to_uppercase()
}
