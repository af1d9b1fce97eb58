// ── Countdown scheduler ──
//
// Debits paid time from every billable session, expires sessions that run
// out, follows devices that move between IPs, and folds traffic counters
// into the rows. Each row is debited under its own lock and re-checked
// there, so a concurrent pause or finalize is never overwritten.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::enforcer::{ClientBinding, TrafficCounters};
use crate::engine::EngineContext;
use crate::error::EnforceError;
use crate::event::EngineEvent;
use crate::model::{MacAddress, Session};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub delta_secs: u64,
    pub billed: usize,
    pub expired: usize,
    pub roamed: usize,
    pub failures: usize,
}

enum Debit {
    Skipped,
    Debited(Session),
    Expired(Session),
}

pub(crate) struct Countdown {
    ctx: Arc<EngineContext>,
    ticks: u64,
    last_tick: Option<DateTime<Utc>>,
}

impl Countdown {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            ticks: 0,
            last_tick: None,
        }
    }

    /// Start measuring elapsed time from `now`.
    pub(crate) fn reset(&mut self, now: DateTime<Utc>) {
        self.last_tick = Some(now);
    }

    /// Loop entry point: bill the whole seconds elapsed since the previous
    /// billed tick.
    ///
    /// Fractions carry over to the next tick. A clock that moved backwards
    /// re-baselines without billing.
    pub(crate) async fn run_once(&mut self, now: DateTime<Utc>) -> Option<TickReport> {
        let Some(last) = self.last_tick else {
            self.last_tick = Some(now);
            return None;
        };

        let elapsed = (now - last).num_seconds();
        if elapsed < 0 {
            warn!(
                skew_secs = -elapsed,
                "system clock moved backwards; resetting countdown baseline"
            );
            self.last_tick = Some(now);
            return None;
        }
        let delta = u64::try_from(elapsed).ok().filter(|d| *d >= 1)?;

        self.last_tick = Some(last + chrono::Duration::seconds(elapsed));
        Some(self.tick(delta, now).await)
    }

    /// Debit `delta_secs` from every billable session.
    pub(crate) async fn tick(&mut self, delta_secs: u64, now: DateTime<Utc>) -> TickReport {
        let ctx = Arc::clone(&self.ctx);
        let cfg = &ctx.config.countdown;
        self.ticks = self.ticks.wrapping_add(1);

        let mut report = TickReport {
            delta_secs,
            ..TickReport::default()
        };

        let rows = ctx.store.billable();
        if rows.is_empty() {
            return report;
        }

        let neighbors = if every(self.ticks, cfg.roam_check_every) {
            fetch_or_log("active_macs", ctx.enforcer.active_macs().await)
        } else {
            None
        };
        let traffic = if every(self.ticks, cfg.traffic_poll_every) {
            fetch_or_log("traffic_stats", ctx.enforcer.traffic_stats().await)
        } else {
            None
        };

        for row in rows {
            let session = match self.debit(&row.mac, delta_secs) {
                Debit::Skipped => continue,
                Debit::Expired(session) => {
                    report.expired += 1;
                    if let Err(e) = self.expire(&session).await {
                        report.failures += 1;
                        warn!(mac = %session.mac, error = %e, "failed to revoke expired session");
                    }
                    continue;
                }
                Debit::Debited(session) => session,
            };
            report.billed += 1;

            let mut roamed = false;
            if let Some(binding) = neighbors.as_ref().and_then(|n| n.get(&session.mac)) {
                match self.follow(&session, binding).await {
                    Ok(moved) => {
                        roamed = moved;
                        if moved {
                            report.roamed += 1;
                        }
                    }
                    Err(e) => {
                        report.failures += 1;
                        warn!(mac = %session.mac, error = %e, "failed to move session to new address");
                    }
                }
            }

            // A device that just moved starts a fresh counter baseline.
            if !roamed {
                if let Some(stats) = traffic.as_ref() {
                    self.account_traffic(&session, stats, now);
                }
            }
        }

        if report.expired + report.roamed + report.failures > 0 {
            debug!(?report, "countdown tick");
        }
        report
    }

    fn debit(&self, mac: &MacAddress, delta: u64) -> Debit {
        self.ctx
            .store
            .update(mac, |s| {
                if !s.is_billable() {
                    return Debit::Skipped;
                }
                if s.time_remaining <= delta {
                    s.time_remaining = 0;
                    s.is_connected = false;
                    return Debit::Expired(s.clone());
                }
                s.time_remaining -= delta;
                Debit::Debited(s.clone())
            })
            .unwrap_or(Debit::Skipped)
    }

    async fn expire(&self, session: &Session) -> Result<(), EnforceError> {
        let ctx = &self.ctx;
        ctx.traffic.forget(&session.mac);
        info!(mac = %session.mac, ip = ?session.ip, "session expired");
        ctx.emit(EngineEvent::SessionExpired {
            mac: session.mac.clone(),
        });
        ctx.request_flush();
        ctx.enforcer.revoke(session).await
    }

    /// Reconcile the row with the neighbor table. Returns whether the
    /// device changed IP.
    async fn follow(
        &self,
        session: &Session,
        binding: &ClientBinding,
    ) -> Result<bool, EnforceError> {
        let ctx = &self.ctx;
        if session.ip == Some(binding.ip) {
            if session.interface != binding.interface {
                ctx.store.update(&session.mac, |s| {
                    s.interface.clone_from(&binding.interface);
                });
            }
            return Ok(false);
        }

        let from = session.ip;
        if session.download_speed > 0 || session.upload_speed > 0 {
            ctx.enforcer
                .set_bandwidth_limit(binding.ip, session.download_speed, session.upload_speed)
                .await?;
        }
        if let Some(old) = from {
            ctx.enforcer.remove_bandwidth_limit(old).await?;
        }
        ctx.enforcer.allow(&session.mac, Some(binding.ip)).await?;

        // Persisted only after the enforcer accepted the move, so a failed
        // move is retried on the next check.
        ctx.store.update(&session.mac, |s| {
            s.ip = Some(binding.ip);
            s.interface.clone_from(&binding.interface);
        });
        ctx.traffic.forget(&session.mac);

        info!(mac = %session.mac, ?from, to = %binding.ip, "session roamed");
        ctx.emit(EngineEvent::SessionRoamed {
            mac: session.mac.clone(),
            from,
            to: binding.ip,
        });
        Ok(true)
    }

    fn account_traffic(
        &self,
        session: &Session,
        stats: &HashMap<IpAddr, TrafficCounters>,
        now: DateTime<Utc>,
    ) {
        let Some(counters) = session.ip.and_then(|ip| stats.get(&ip)) else {
            return;
        };
        let delta = self.ctx.traffic.observe(&session.mac, *counters);
        if delta.total() == 0 {
            return;
        }
        let noise = self.ctx.config.countdown.traffic_noise_bytes;
        self.ctx.store.update(&session.mac, |s| {
            s.total_data_up = s.total_data_up.saturating_add(delta.up);
            s.total_data_down = s.total_data_down.saturating_add(delta.down);
            if delta.total() > noise {
                s.last_traffic_at = Some(now);
            }
        });
    }
}

fn every(tick: u64, period: u32) -> bool {
    period != 0 && tick % u64::from(period) == 0
}

fn fetch_or_log<T>(what: &'static str, result: Result<T, EnforceError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "{what} unavailable this tick");
            None
        }
    }
}
