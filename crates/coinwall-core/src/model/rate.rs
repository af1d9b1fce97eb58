// ── Rate tiers ──
//
// Static amount → time/speed lookup rows. The optimizer in `crate::rates`
// turns a payment or point balance into a quote using these.

use serde::{Deserialize, Serialize};

/// A configured payment-amount to access-time mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateTier {
    /// Price in currency units (one pulse = one unit by default).
    pub amount: u32,
    pub minutes: u32,
    /// kbps, 0 = unshaped.
    #[serde(default)]
    pub upload_speed: u32,
    /// kbps, 0 = unshaped.
    #[serde(default)]
    pub download_speed: u32,
    #[serde(default = "default_pausable")]
    pub is_pausable: bool,
}

impl RateTier {
    pub fn new(amount: u32, minutes: u32) -> Self {
        Self {
            amount,
            minutes,
            upload_speed: 0,
            download_speed: 0,
            is_pausable: true,
        }
    }

    pub fn with_speeds(mut self, download_speed: u32, upload_speed: u32) -> Self {
        self.download_speed = download_speed;
        self.upload_speed = upload_speed;
        self
    }
}

fn default_pausable() -> bool {
    true
}

/// A configured points-to-time mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointTier {
    /// Point threshold required to redeem this tier.
    pub points: u32,
    #[serde(default)]
    pub minutes: u32,
    /// Explicit duration in seconds; wins over `minutes` when present.
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub upload_speed: u32,
    #[serde(default)]
    pub download_speed: u32,
}

impl PointTier {
    /// Granted seconds: the explicit `duration`, else `minutes * 60`.
    pub fn seconds(&self) -> u64 {
        self.duration
            .unwrap_or_else(|| u64::from(self.minutes).saturating_mul(60))
    }
}

/// The full set of tiers the gateway sells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateTable {
    #[serde(default)]
    pub rates: Vec<RateTier>,
    #[serde(default)]
    pub point_rates: Vec<PointTier>,
}

impl RateTable {
    pub fn new(rates: Vec<RateTier>, point_rates: Vec<PointTier>) -> Self {
        Self { rates, point_rates }
    }

    /// The amount-1 tier every remainder falls through to.
    pub fn base_tier(&self) -> Option<&RateTier> {
        base_tier(&self.rates)
    }
}

pub(crate) fn base_tier(tiers: &[RateTier]) -> Option<&RateTier> {
    tiers.iter().find(|t| t.amount == 1)
}
