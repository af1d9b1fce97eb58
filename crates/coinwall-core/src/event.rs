// ── Engine notifications ──
//
// Broadcast to portal/UI consumers. A lagging subscriber misses events;
// the engine never waits on it.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::model::{ChannelKey, FinalizeReason, MacAddress, PendingCoin};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A coin session started, resumed, or received a pulse.
    CoinPending(PendingCoin),
    CoinFinalized {
        channel: ChannelKey,
        mac: MacAddress,
        amount: u32,
        minutes: u64,
        reason: FinalizeReason,
    },
    TimeCredited {
        mac: MacAddress,
        seconds: u64,
    },
    PointsRedeemed {
        mac: MacAddress,
        points: u64,
        seconds: u64,
    },
    SessionExpired {
        mac: MacAddress,
    },
    SessionPaused {
        mac: MacAddress,
    },
    SessionResumed {
        mac: MacAddress,
    },
    SessionRoamed {
        mac: MacAddress,
        from: Option<IpAddr>,
        to: IpAddr,
    },
    SessionLoggedOut {
        mac: MacAddress,
    },
}
