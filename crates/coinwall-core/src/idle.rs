// ── Idle monitor ──
//
// Pauses pausable sessions whose device went quiet, and logs out
// connected sessions that ran out of time and stayed idle past the
// expiry window. Pausing keeps `is_connected` set so the portal can tell
// a paused device from one that left. Sessions with time left are never
// logged out here.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::model::{MacAddress, Session};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub paused: usize,
    pub logged_out: usize,
    pub failures: usize,
}

pub(crate) struct IdleMonitor {
    ctx: Arc<EngineContext>,
}

impl IdleMonitor {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let default_timeout = self.ctx.config.idle.idle_timeout.as_secs();
        let expiry_window = self.ctx.config.idle.session_expiry;

        for row in self.ctx.store.query(|s| s.is_connected) {
            if row.time_remaining > 0 {
                if !row.is_paused && row.pausable && is_idle(&row, now, default_timeout) {
                    if let Some(revoked) = self.pause_idle(&row.mac, now, default_timeout).await {
                        report.paused += 1;
                        report.failures += usize::from(!revoked);
                    }
                }
            } else if now > logout_deadline(&row, expiry_window) {
                if let Some(revoked) = self.logout(&row.mac, now).await {
                    report.logged_out += 1;
                    report.failures += usize::from(!revoked);
                }
            }
        }
        report
    }

    /// Pause a session the sweep found idle. The idle check is repeated
    /// under the row lock in case traffic or a payment arrived since the
    /// scan. Returns `None` when nothing changed, otherwise whether the
    /// enforcer accepted the block.
    async fn pause_idle(
        &self,
        mac: &MacAddress,
        now: DateTime<Utc>,
        default_timeout: u64,
    ) -> Option<bool> {
        let paused = self.ctx.store.update(mac, |s| {
            let still_idle = s.is_connected
                && !s.is_paused
                && s.pausable
                && s.time_remaining > 0
                && is_idle(s, now, default_timeout);
            if still_idle {
                s.is_paused = true;
                Some(s.clone())
            } else {
                None
            }
        });
        let session = paused.flatten()?;

        info!(
            mac = %mac,
            idle_secs = (now - session.last_activity()).num_seconds(),
            time_remaining = session.time_remaining,
            "session paused for inactivity"
        );
        self.ctx.emit(EngineEvent::SessionPaused { mac: mac.clone() });
        self.ctx.request_flush();
        Some(self.revoke_logged(&session).await)
    }

    async fn logout(&self, mac: &MacAddress, now: DateTime<Utc>) -> Option<bool> {
        let window = self.ctx.config.idle.session_expiry;
        let logged_out = self.ctx.store.update(mac, |s| {
            if s.is_connected && s.time_remaining == 0 && now > logout_deadline(s, window) {
                s.is_connected = false;
                s.is_paused = false;
                s.session_expiry = None;
                Some(s.clone())
            } else {
                None
            }
        });
        let session = logged_out.flatten()?;

        info!(mac = %mac, "idle session logged out");
        self.ctx.emit(EngineEvent::SessionLoggedOut { mac: mac.clone() });
        self.ctx.request_flush();
        Some(self.revoke_logged(&session).await)
    }

    async fn revoke_logged(&self, session: &Session) -> bool {
        match self.ctx.enforcer.revoke(session).await {
            Ok(()) => true,
            Err(e) => {
                warn!(mac = %session.mac, error = %e, "revoke failed; reconciler will retry");
                false
            }
        }
    }

    // ── Explicit pause / resume ──────────────────────────────────────

    /// Freeze a session's clock on request. Pausing a paused session is a
    /// no-op.
    pub(crate) async fn pause(&self, mac: &MacAddress) -> Result<Session, EngineError> {
        let (session, changed) = self
            .ctx
            .store
            .update(mac, |s| {
                if !s.is_connected || s.time_remaining == 0 {
                    return Err(EngineError::InvalidRequest {
                        message: format!("device {mac} has no running session to pause"),
                    });
                }
                let changed = !s.is_paused;
                s.is_paused = true;
                Ok((s.clone(), changed))
            })
            .ok_or_else(|| EngineError::SessionNotFound { mac: mac.clone() })??;

        if changed {
            info!(%mac, time_remaining = session.time_remaining, "session paused");
            self.ctx.emit(EngineEvent::SessionPaused { mac: mac.clone() });
            self.ctx.request_flush();
            self.revoke_logged(&session).await;
        } else {
            debug!(%mac, "session already paused");
        }
        Ok(session)
    }

    /// Unfreeze a session and restore its access at the device's current
    /// address.
    pub(crate) async fn resume(
        &self,
        mac: &MacAddress,
        now: DateTime<Utc>,
    ) -> Result<Session, EngineError> {
        let ctx = &self.ctx;
        let existing = ctx
            .store
            .get(mac)
            .ok_or_else(|| EngineError::SessionNotFound { mac: mac.clone() })?;
        if existing.time_remaining == 0 {
            return Err(EngineError::InvalidRequest {
                message: format!("device {mac} has no time left to resume"),
            });
        }

        let binding = ctx.lookup_binding(mac).await;
        let (session, was_paused) = ctx
            .store
            .update(mac, |s| {
                if s.time_remaining == 0 {
                    return Err(EngineError::InvalidRequest {
                        message: format!("device {mac} has no time left to resume"),
                    });
                }
                let was_paused = s.is_paused;
                s.is_paused = false;
                s.is_connected = true;
                s.last_active_at = now;
                if let Some(binding) = binding {
                    s.ip = Some(binding.ip);
                    s.interface = binding.interface;
                }
                Ok((s.clone(), was_paused))
            })
            .ok_or_else(|| EngineError::SessionNotFound { mac: mac.clone() })??;

        match ctx.enforcer.grant(&session).await {
            Ok(true) => {}
            Ok(false) => warn!(%mac, "enforcer refused resumed session"),
            Err(e) => warn!(%mac, error = %e, "grant on resume failed; reconciler will retry"),
        }
        if was_paused {
            info!(%mac, time_remaining = session.time_remaining, "session resumed");
            ctx.emit(EngineEvent::SessionResumed { mac: mac.clone() });
        }
        ctx.request_flush();
        Ok(session)
    }
}

/// Idle longer than the session's own timeout, or the default. A zero
/// timeout never triggers.
fn is_idle(session: &Session, now: DateTime<Utc>, default_timeout: u64) -> bool {
    let timeout = session.idle_timeout_secs.unwrap_or(default_timeout);
    if timeout == 0 {
        return false;
    }
    let idle = (now - session.last_activity()).num_seconds();
    u64::try_from(idle).is_ok_and(|idle| idle > timeout)
}

fn logout_deadline(session: &Session, window: std::time::Duration) -> DateTime<Utc> {
    session.session_expiry.unwrap_or_else(|| {
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
        session
            .last_activity()
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::enforcer::{EnforcerCall, MemoryEnforcer};
    use crate::engine::test_support::{context_with, mac};

    fn monitor() -> (IdleMonitor, Arc<MemoryEnforcer>) {
        let (ctx, enforcer, _) = context_with(EngineConfig::default());
        (IdleMonitor::new(ctx), enforcer)
    }

    fn active(m: &IdleMonitor, n: u8, idle_for: i64, pausable: bool) {
        let last = Utc::now() - ChronoDuration::seconds(idle_for);
        m.ctx.store.upsert(&mac(n), last, |s| {
            s.is_connected = true;
            s.time_remaining = 900;
            s.pausable = pausable;
            s.last_active_at = last;
            s.ip = Some("10.0.0.5".parse().unwrap());
        });
    }

    #[tokio::test]
    async fn idle_pausable_session_is_paused_but_stays_connected() {
        let (m, enforcer) = monitor();
        active(&m, 1, 400, true);

        let report = m.sweep(Utc::now()).await;
        assert_eq!(report.paused, 1);
        let session = m.ctx.store.get(&mac(1)).unwrap();
        assert!(session.is_paused);
        assert!(session.is_connected);
        assert_eq!(session.time_remaining, 900);
        assert_eq!(enforcer.count_calls(|c| matches!(c, EnforcerCall::Block { .. })), 1);
    }

    #[tokio::test]
    async fn recent_traffic_keeps_session_running() {
        let (m, _) = monitor();
        active(&m, 1, 400, true);
        m.ctx
            .store
            .update(&mac(1), |s| s.last_traffic_at = Some(Utc::now()));

        assert_eq!(m.sweep(Utc::now()).await.paused, 0);
    }

    #[tokio::test]
    async fn non_pausable_and_overridden_sessions() {
        let (m, _) = monitor();
        active(&m, 1, 400, false);
        active(&m, 2, 400, true);
        m.ctx.store.update(&mac(2), |s| s.idle_timeout_secs = Some(0));
        active(&m, 3, 90, true);
        m.ctx.store.update(&mac(3), |s| s.idle_timeout_secs = Some(60));

        let report = m.sweep(Utc::now()).await;
        assert_eq!(report.paused, 1);
        assert!(m.ctx.store.get(&mac(3)).unwrap().is_paused);
        assert!(!m.ctx.store.get(&mac(1)).unwrap().is_paused);
        assert!(!m.ctx.store.get(&mac(2)).unwrap().is_paused);
    }

    #[tokio::test]
    async fn logout_only_applies_to_sessions_without_time() {
        let (m, _) = monitor();
        active(&m, 1, 7200, false);
        active(&m, 2, 7200, false);
        m.ctx.store.update(&mac(2), |s| s.time_remaining = 0);

        let report = m.sweep(Utc::now()).await;
        assert_eq!(report.logged_out, 1);
        assert!(m.ctx.store.get(&mac(1)).unwrap().is_connected);
        assert!(!m.ctx.store.get(&mac(2)).unwrap().is_connected);
    }

    #[tokio::test]
    async fn explicit_deadline_overrides_activity() {
        let (m, _) = monitor();
        active(&m, 1, 0, false);
        m.ctx.store.update(&mac(1), |s| {
            s.time_remaining = 0;
            s.session_expiry = Some(Utc::now() - ChronoDuration::seconds(1));
        });
        assert_eq!(m.sweep(Utc::now()).await.logged_out, 1);
    }

    #[tokio::test]
    async fn explicit_pause_is_idempotent() {
        let (m, enforcer) = monitor();
        active(&m, 1, 0, false);

        m.pause(&mac(1)).await.unwrap();
        m.pause(&mac(1)).await.unwrap();
        assert_eq!(enforcer.count_calls(|c| matches!(c, EnforcerCall::Block { .. })), 1);
    }

    #[tokio::test]
    async fn pause_rejects_session_without_time() {
        let (m, _) = monitor();
        active(&m, 1, 0, true);
        m.ctx.store.update(&mac(1), |s| s.time_remaining = 0);
        assert!(matches!(
            m.pause(&mac(1)).await,
            Err(EngineError::InvalidRequest { .. })
        ));
        assert!(matches!(
            m.pause(&mac(9)).await,
            Err(EngineError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn resume_regrants_at_current_address() {
        let (m, enforcer) = monitor();
        active(&m, 1, 400, true);
        m.ctx.store.update(&mac(1), |s| s.download_speed = 2048);
        m.sweep(Utc::now()).await;
        assert!(!enforcer.is_authorized(&mac(1)));

        let moved: std::net::IpAddr = "10.0.2.9".parse().unwrap();
        enforcer.set_neighbor(
            &mac(1),
            crate::enforcer::ClientBinding {
                ip: moved,
                interface: None,
            },
        );
        let session = m.resume(&mac(1), Utc::now()).await.unwrap();
        assert!(!session.is_paused);
        assert_eq!(session.ip, Some(moved));
        assert!(enforcer.is_authorized(&mac(1)));
        assert_eq!(enforcer.limit_for(moved), Some((2048, 0)));

        // Activity was refreshed, so the next sweep leaves it alone.
        assert_eq!(m.sweep(Utc::now()).await.paused, 0);
    }
}
