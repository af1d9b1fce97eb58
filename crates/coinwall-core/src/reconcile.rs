// ── Firewall reconciler ──
//
// Diffs the store's intended access state against what the enforcer
// actually lets through and repairs the difference. Every call it makes is
// idempotent, so racing a live finalize, pause, or resume converges once
// both sides settle.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::engine::EngineContext;
use crate::error::EnforceError;
use crate::model::Session;

/// What one pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Sessions that should have access and were re-allowed.
    pub allowed: usize,
    /// Enforced devices with no valid session that were blocked.
    pub blocked: usize,
    /// Per-device repairs that failed and wait for the next pass.
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.allowed + self.blocked + self.failed == 0
    }
}

pub(crate) struct FirewallReconciler {
    ctx: Arc<EngineContext>,
}

impl FirewallReconciler {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run one reconciliation pass. Fails only if the enforced set cannot
    /// be read at all.
    pub(crate) async fn pass(&self) -> Result<ReconcileReport, EnforceError> {
        let ctx = &self.ctx;
        let enforced = ctx.enforcer.authorized_macs().await?;
        let mut report = ReconcileReport::default();

        for candidate in ctx.store.billable() {
            if enforced.contains(&candidate.mac) {
                continue;
            }
            // Re-read: an earlier grant may have been slow enough for a
            // pause or expiry to land on this row.
            let Some(session) = ctx.store.get(&candidate.mac).filter(Session::is_billable) else {
                continue;
            };
            match ctx.enforcer.grant(&session).await {
                Ok(true) => {
                    report.allowed += 1;
                    debug!(mac = %session.mac, "re-allowed missing session");
                }
                Ok(false) => report.failed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(mac = %session.mac, error = %e, "re-allow failed");
                }
            }
        }

        for mac in &enforced {
            // Re-read: the row may have been paid or resumed since the
            // enforced set was fetched.
            let current = ctx.store.get(mac);
            if current.as_ref().is_some_and(Session::is_billable) {
                continue;
            }
            let result = match current {
                Some(session) => ctx.enforcer.revoke(&session).await,
                None => ctx.enforcer.block(mac, None).await,
            };
            match result {
                Ok(()) => {
                    report.blocked += 1;
                    debug!(%mac, "blocked device without valid session");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(%mac, error = %e, "block failed");
                }
            }
        }

        Ok(report)
    }
}
