// ── Sale ledger entries ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::coin::ChannelKey;
use super::mac::MacAddress;

/// One booked payment, per source device, per finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub id: Uuid,
    pub mac: MacAddress,
    pub channel: ChannelKey,
    /// Device id the money physically went into.
    pub source: String,
    pub amount: u32,
    pub recorded_at: DateTime<Utc>,
}

impl SaleRecord {
    pub fn new(
        mac: MacAddress,
        channel: ChannelKey,
        source: String,
        amount: u32,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mac,
            channel,
            source,
            amount,
            recorded_at,
        }
    }
}
