//! Access session engine for coin-operated Wi-Fi hotspots.
//!
//! This crate owns the billing and access state machine that sits between
//! coin hardware, the captive portal, and the gateway's packet filter:
//!
//! - **[`SessionEngine`]**: Central facade. Request handlers call its
//!   operations (`start_coin_session`, `coin_pulse`, `pause_session`,
//!   `redeem_points`, ...) directly; [`start()`](SessionEngine::start)
//!   restores enforcement for stored sessions and spawns the countdown,
//!   idle, reconcile, and persist loops.
//!
//! - **[`CoinAggregator`]**: Per-channel coin sessions. A channel serves one
//!   payer at a time; pulses pool until an inactivity timer or an explicit
//!   "done" finalizes them exactly once.
//!
//! - **Rate optimizer** ([`rates`]): Greedy preview and exact knapsack
//!   optimum turning an amount into minutes and bandwidth.
//!
//! - **[`SessionStore`]**: Concurrent per-device rows with atomic single-row
//!   updates, optionally backed by a JSON state file.
//!
//! - **[`AccessEnforcer`]**: Capability trait for the packet filter and
//!   traffic shaper. Every call is bounded by a timeout through
//!   [`BoundedEnforcer`]; [`MemoryEnforcer`] is an in-process backend for
//!   dry runs and tests.

pub mod coin;
pub mod config;
pub mod countdown;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod event;
pub mod idle;
pub mod model;
pub mod rates;
pub mod reconcile;
pub mod relay;
pub mod store;
pub mod traffic;

// ── Primary re-exports ──────────────────────────────────────────────
pub use coin::{CoinAggregator, FinalizeOutcome, IgnoreReason, PulseOutcome};
pub use config::{CoinConfig, CountdownConfig, EngineConfig, IdleConfig};
pub use countdown::TickReport;
pub use enforcer::{
    AccessEnforcer, BoundedEnforcer, ClientBinding, EnforcerCall, MemoryEnforcer, TrafficCounters,
};
pub use engine::{AmountQuote, DeviceStatus, Redemption, SessionEngine};
pub use error::{EnforceError, EngineError, StoreError};
pub use event::EngineEvent;
pub use idle::SweepReport;
pub use rates::{PointQuote, RateQuote, TierCount};
pub use reconcile::ReconcileReport;
pub use relay::{BoundedRelay, ChannelRelay, MemoryRelay};
pub use store::SessionStore;

// Re-export model types at the crate root for ergonomics.
pub use model::{
    ChannelKey, Credit, FinalizeReason, MacAddress, PendingCoin, PointTier, PulseSource,
    RateTable, RateTier, SaleRecord, SelectionMode, Session, SessionState,
};
