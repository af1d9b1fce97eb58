// ── Session storage ──
//
// Concurrent per-device rows with an optional JSON state file behind them.

mod persist;
mod session_store;

pub use session_store::SessionStore;
