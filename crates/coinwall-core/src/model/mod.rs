// ── Domain model ──
//
// Canonical types shared by the engine, the store, and consumers
// (CLI, portal handlers).

pub mod coin;
pub mod mac;
pub mod rate;
pub mod sale;
pub mod session;

// ── Re-exports ──────────────────────────────────────────────────────

pub use coin::{ChannelKey, FinalizeReason, InvalidChannelKey, PendingCoin, PulseSource, SelectionMode};
pub use mac::MacAddress;
pub use rate::{PointTier, RateTable, RateTier};
pub use sale::SaleRecord;
pub use session::{Credit, Session, SessionState};
