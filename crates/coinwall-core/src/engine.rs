// ── Session engine ──
//
// Owns every piece of process state: the store, the coin aggregator, the
// enforcement capability, and the three scheduler loops. Consumers hold a
// cheap `SessionEngine` clone; background tasks share the same `Arc`.

use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use chrono::Utc;
use futures_util::FutureExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coin::{CoinAggregator, FinalizeOutcome, PulseOutcome};
use crate::config::EngineConfig;
use crate::countdown::{Countdown, TickReport};
use crate::enforcer::{AccessEnforcer, BoundedEnforcer, ClientBinding};
use crate::error::{EngineError, StoreError};
use crate::event::EngineEvent;
use crate::idle::{IdleMonitor, SweepReport};
use crate::model::{
    ChannelKey, Credit, FinalizeReason, MacAddress, PendingCoin, PulseSource, RateTable,
    SaleRecord, SelectionMode, Session, SessionState,
};
use crate::rates::{RateQuote, best_for_amount, best_for_amount_greedy, best_for_points};
use crate::reconcile::{FirewallReconciler, ReconcileReport};
use crate::relay::{BoundedRelay, ChannelRelay};
use crate::store::SessionStore;
use crate::traffic::TrafficCache;

const EVENT_CHANNEL_SIZE: usize = 256;

// ── Shared context ───────────────────────────────────────────────────

/// State shared by the aggregator and every loop.
pub(crate) struct EngineContext {
    pub(crate) config: EngineConfig,
    pub(crate) rates: ArcSwap<RateTable>,
    pub(crate) store: Arc<SessionStore>,
    pub(crate) enforcer: BoundedEnforcer,
    pub(crate) relay: BoundedRelay,
    pub(crate) traffic: TrafficCache,
    events: broadcast::Sender<EngineEvent>,
    flush: Notify,
}

impl EngineContext {
    pub(crate) fn new(
        config: EngineConfig,
        store: Arc<SessionStore>,
        enforcer: Arc<dyn AccessEnforcer>,
        relay: Arc<dyn ChannelRelay>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            rates: ArcSwap::from_pointee(config.rates.clone()),
            enforcer: BoundedEnforcer::new(enforcer, config.enforcer_timeout),
            relay: BoundedRelay::new(relay, config.enforcer_timeout),
            config,
            store,
            traffic: TrafficCache::new(),
            events,
            flush: Notify::new(),
        }
    }

    /// Broadcast to subscribers. Having none is fine.
    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Ask the persist task to write state now instead of at its next
    /// interval.
    pub(crate) fn request_flush(&self) {
        self.flush.notify_one();
    }

    /// Best-effort lookup of where a device sits right now.
    pub(crate) async fn lookup_binding(&self, mac: &MacAddress) -> Option<ClientBinding> {
        match self.enforcer.active_macs().await {
            Ok(mut table) => table.remove(mac),
            Err(e) => {
                debug!(%mac, error = %e, "neighbor lookup failed");
                None
            }
        }
    }
}

// ── Public views ─────────────────────────────────────────────────────

/// Everything a portal needs to render one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub mac: MacAddress,
    pub state: SessionState,
    pub session: Option<Session>,
    pub pending: Option<PendingCoin>,
}

/// Greedy preview and committed optimum for one amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountQuote {
    pub amount: u32,
    pub preview: RateQuote,
    pub optimal: RateQuote,
}

/// Result of a points redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub mac: MacAddress,
    pub points_used: u64,
    pub seconds_added: u64,
    pub points_balance: u64,
    pub access_granted: bool,
}

// ── Engine ───────────────────────────────────────────────────────────

/// Central facade for the access session engine.
///
/// Cheaply cloneable via `Arc<EngineInner>`. Request handlers call the
/// operation methods directly; [`start`](Self::start) spawns the
/// countdown, idle, reconcile, and persist loops.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    ctx: Arc<EngineContext>,
    coins: Arc<CoinAggregator>,
    countdown: Mutex<Countdown>,
    idle: IdleMonitor,
    reconciler: FirewallReconciler,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl SessionEngine {
    /// Build an engine, loading the state file named in `config` if any.
    pub fn new(
        config: EngineConfig,
        enforcer: Arc<dyn AccessEnforcer>,
        relay: Arc<dyn ChannelRelay>,
    ) -> Result<Self, EngineError> {
        let store = match &config.state_file {
            Some(path) => SessionStore::open(path)?,
            None => SessionStore::in_memory(),
        };
        Ok(Self::with_store(config, Arc::new(store), enforcer, relay))
    }

    /// Build an engine around an existing store.
    pub fn with_store(
        config: EngineConfig,
        store: Arc<SessionStore>,
        enforcer: Arc<dyn AccessEnforcer>,
        relay: Arc<dyn ChannelRelay>,
    ) -> Self {
        let ctx = Arc::new(EngineContext::new(config, store, enforcer, relay));
        Self {
            inner: Arc::new(EngineInner {
                coins: Arc::new(CoinAggregator::new(Arc::clone(&ctx))),
                countdown: Mutex::new(Countdown::new(Arc::clone(&ctx))),
                idle: IdleMonitor::new(Arc::clone(&ctx)),
                reconciler: FirewallReconciler::new(Arc::clone(&ctx)),
                ctx,
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.ctx.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.ctx.store
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Restore enforcement for stored sessions and spawn the loops.
    ///
    /// Calling `start` on a running engine is a no-op. An engine that was
    /// stopped cannot be started again.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.inner.cancel.is_cancelled() {
            return Err(EngineError::NotRunning);
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let restored = self.restore().await;
        self.inner.countdown.lock().await.reset(Utc::now());
        info!(
            sessions = self.inner.ctx.store.len(),
            restored, "session engine starting"
        );

        let mut handles = self.inner.task_handles.lock().await;
        let cancel = &self.inner.cancel;
        handles.push(tokio::spawn(countdown_task(self.clone(), cancel.clone())));
        handles.push(tokio::spawn(idle_task(self.clone(), cancel.clone())));
        handles.push(tokio::spawn(reconcile_task(self.clone(), cancel.clone())));
        handles.push(tokio::spawn(persist_task(self.clone(), cancel.clone())));
        Ok(())
    }

    /// Stop the loops, commit any open coin sessions, and flush state.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.inner.cancel.cancel();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        drop(handles);

        let committed = self.inner.coins.finalize_all(FinalizeReason::Shutdown).await;
        if !committed.is_empty() {
            info!(count = committed.len(), "pending coin sessions committed on shutdown");
        }

        self.flush().await?;
        self.inner.running.store(false, Ordering::Release);
        info!("session engine stopped");
        Ok(())
    }

    /// Write dirty state to the state file now.
    pub async fn flush(&self) -> Result<bool, EngineError> {
        let store = Arc::clone(&self.inner.ctx.store);
        let written = tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(written)
    }

    /// Re-allow every session that should have access. Returns how many
    /// were granted.
    async fn restore(&self) -> usize {
        let ctx = &self.inner.ctx;
        let candidates = ctx
            .store
            .query(|s| s.time_remaining > 0 && !s.is_paused);

        let mut granted = 0;
        for session in candidates {
            let Some(session) = ctx.store.update(&session.mac, |s| {
                s.is_connected = true;
                s.clone()
            }) else {
                continue;
            };
            match ctx.enforcer.grant(&session).await {
                Ok(true) => granted += 1,
                Ok(false) => {}
                Err(e) => warn!(mac = %session.mac, error = %e, "restore grant failed"),
            }
        }
        granted
    }

    // ── Coin operations ──────────────────────────────────────────────

    /// Bind a coin channel to a device and open the slot.
    pub async fn start_coin_session(
        &self,
        channel: ChannelKey,
        mac: MacAddress,
        mode: SelectionMode,
        target_device_id: Option<String>,
    ) -> Result<PendingCoin, EngineError> {
        self.inner
            .coins
            .start(channel, mac, mode, target_device_id)
            .await
    }

    /// Hardware coin acceptor reported `pulses` pulses.
    pub async fn coin_pulse(&self, pulses: u32) -> PulseOutcome {
        let amount = pulses.saturating_mul(self.inner.ctx.config.coin.pulse_value);
        self.inner
            .coins
            .pulse(&ChannelKey::Hardware, amount, &PulseSource::Hardware)
            .await
    }

    /// A networked sub-vendo device reported `pulses` pulses.
    pub async fn subvendo_pulse(
        &self,
        device_id: &str,
        pulses: u32,
        key: &str,
    ) -> Result<PulseOutcome, EngineError> {
        let expected = self.inner.ctx.config.coin.subvendo_key.as_ref();
        let authorized = expected.is_some_and(|k| subvendo_key_matches(k, key));
        if !authorized {
            warn!(device_id, "sub-vendo authentication failed");
            return Err(EngineError::SubVendoAuthFailed {
                device_id: device_id.to_owned(),
            });
        }

        let amount = pulses.saturating_mul(self.inner.ctx.config.coin.pulse_value);
        let source = PulseSource::SubVendo(device_id.to_owned());
        Ok(self
            .inner
            .coins
            .pulse(&ChannelKey::subvendo(device_id), amount, &source)
            .await)
    }

    /// User pressed "done": commit the channel now.
    pub async fn coin_done(&self, channel: &ChannelKey) -> Result<FinalizeOutcome, EngineError> {
        self.inner.coins.finalize(channel, FinalizeReason::Done).await
    }

    // ── Session operations ───────────────────────────────────────────

    pub async fn pause_session(&self, mac: &MacAddress) -> Result<Session, EngineError> {
        self.inner.idle.pause(mac).await
    }

    pub async fn resume_session(&self, mac: &MacAddress) -> Result<Session, EngineError> {
        self.inner.idle.resume(mac, Utc::now()).await
    }

    /// Convert loyalty points into time using the point tiers.
    pub async fn redeem_points(
        &self,
        mac: &MacAddress,
        points: u64,
    ) -> Result<Redemption, EngineError> {
        let ctx = &self.inner.ctx;
        if points == 0 {
            return Err(EngineError::InvalidRequest {
                message: "points must be positive".into(),
            });
        }

        let quote = best_for_points(points, &ctx.rates.load().point_rates);
        let now = Utc::now();

        // Balance check and deduction happen under the row lock so two
        // concurrent redemptions cannot both spend the same points.
        let updated = ctx
            .store
            .update(mac, |s| {
                if s.points_balance < points {
                    return Err(EngineError::InsufficientPoints {
                        requested: points,
                        available: s.points_balance,
                    });
                }
                if quote.is_empty() {
                    return Err(EngineError::NoApplicableRate { amount: points });
                }
                s.points_balance -= quote.points_used;
                s.apply_credit(
                    &Credit {
                        seconds: quote.seconds,
                        download_speed: quote.download_speed,
                        upload_speed: quote.upload_speed,
                        ..Credit::default()
                    },
                    now,
                );
                Ok(s.clone())
            })
            .ok_or_else(|| EngineError::SessionNotFound { mac: mac.clone() })??;

        let access_granted = self.grant_logged(&updated).await;
        info!(
            %mac,
            points = quote.points_used,
            seconds = quote.seconds,
            "points redeemed"
        );
        ctx.emit(EngineEvent::PointsRedeemed {
            mac: mac.clone(),
            points: quote.points_used,
            seconds: quote.seconds,
        });
        ctx.request_flush();

        Ok(Redemption {
            mac: mac.clone(),
            points_used: quote.points_used,
            seconds_added: quote.seconds,
            points_balance: updated.points_balance,
            access_granted,
        })
    }

    /// Credit time that was not paid through a coin channel, e.g. a
    /// voucher or a free-time grant.
    pub async fn credit_time(
        &self,
        mac: &MacAddress,
        seconds: u64,
        download_speed: u32,
        upload_speed: u32,
    ) -> Result<Session, EngineError> {
        let ctx = &self.inner.ctx;
        if !mac.is_valid() {
            return Err(EngineError::InvalidRequest {
                message: format!("'{mac}' is not a MAC address"),
            });
        }
        if seconds == 0 {
            return Err(EngineError::InvalidRequest {
                message: "credit must add time".into(),
            });
        }

        let binding = match ctx.store.get(mac) {
            Some(s) if s.ip.is_some() => None,
            _ => ctx.lookup_binding(mac).await,
        };
        let now = Utc::now();
        let updated = ctx.store.upsert(mac, now, |s| {
            if let Some(binding) = binding {
                s.ip = Some(binding.ip);
                s.interface = binding.interface;
            }
            s.apply_credit(
                &Credit {
                    seconds,
                    download_speed,
                    upload_speed,
                    ..Credit::default()
                },
                now,
            );
            s.clone()
        });

        self.grant_logged(&updated).await;
        info!(%mac, seconds, "time credited");
        ctx.emit(EngineEvent::TimeCredited {
            mac: mac.clone(),
            seconds,
        });
        ctx.request_flush();
        Ok(updated)
    }

    /// Record what the portal knows about a device: its IP, interface, and
    /// browser cookie. Refreshes `last_active_at`.
    pub fn observe_client(
        &self,
        mac: &MacAddress,
        ip: Option<IpAddr>,
        interface: Option<String>,
        client_id: Option<String>,
    ) -> Result<Session, EngineError> {
        if !mac.is_valid() {
            return Err(EngineError::InvalidRequest {
                message: format!("'{mac}' is not a MAC address"),
            });
        }
        let now = Utc::now();
        Ok(self.inner.ctx.store.upsert(mac, now, |s| {
            if ip.is_some() {
                s.ip = ip;
            }
            if interface.is_some() {
                s.interface = interface;
            }
            if client_id.is_some() {
                s.client_id = client_id;
            }
            s.last_active_at = now;
            s.clone()
        }))
    }

    async fn grant_logged(&self, session: &Session) -> bool {
        match self.inner.ctx.enforcer.grant(session).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!(mac = %session.mac, error = %e, "grant failed; reconciler will retry");
                false
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get_status(&self, mac: &MacAddress) -> DeviceStatus {
        let session = self.inner.ctx.store.get(mac);
        let state = session.as_ref().map_or(SessionState::Offline, Session::state);
        DeviceStatus {
            mac: mac.clone(),
            state,
            session,
            pending: self.inner.coins.pending_for(mac).await,
        }
    }

    pub fn session(&self, mac: &MacAddress) -> Option<Session> {
        self.inner.ctx.store.get(mac)
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.ctx.store.snapshot()
    }

    pub fn sales(&self) -> Vec<SaleRecord> {
        self.inner.ctx.store.sales()
    }

    pub async fn pending(&self, channel: &ChannelKey) -> Option<PendingCoin> {
        self.inner.coins.pending(channel).await
    }

    pub fn quote(&self, amount: u32) -> AmountQuote {
        let rates = self.inner.ctx.rates.load();
        AmountQuote {
            amount,
            preview: best_for_amount_greedy(amount, &rates.rates),
            optimal: best_for_amount(amount, &rates.rates),
        }
    }

    pub fn rates(&self) -> Arc<RateTable> {
        self.inner.ctx.rates.load_full()
    }

    /// Swap in a new rate table. Open coin sessions pick it up on their
    /// next pulse and at finalize.
    pub fn set_rates(&self, rates: RateTable) {
        info!(
            tiers = rates.rates.len(),
            point_tiers = rates.point_rates.len(),
            "rate table replaced"
        );
        self.inner.ctx.rates.store(Arc::new(rates));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.ctx.events.subscribe()
    }

    // ── Manual drivers ───────────────────────────────────────────────

    /// Run one countdown tick with an explicit elapsed delta.
    pub async fn run_countdown_tick(&self, delta_secs: u64) -> TickReport {
        let mut countdown = self.inner.countdown.lock().await;
        countdown.tick(delta_secs, Utc::now()).await
    }

    pub async fn run_idle_sweep(&self) -> SweepReport {
        self.inner.idle.sweep(Utc::now()).await
    }

    pub async fn run_reconcile_pass(&self) -> Result<ReconcileReport, EngineError> {
        Ok(self.inner.reconciler.pass().await?)
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Run one loop iteration, logging instead of unwinding if it panics.
async fn guarded(loop_name: &'static str, fut: impl Future<Output = ()>) {
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        error!(loop_name, "loop iteration panicked; continuing");
    }
}

/// Self-rescheduling: the next sleep starts only after the current tick
/// has finished, so ticks never overlap.
async fn countdown_task(engine: SessionEngine, cancel: CancellationToken) {
    let period = engine.config().countdown.tick;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(period) => {
                guarded("countdown", async {
                    let mut countdown = engine.inner.countdown.lock().await;
                    countdown.run_once(Utc::now()).await;
                })
                .await;
            }
        }
    }
    debug!("countdown loop stopped");
}

async fn idle_task(engine: SessionEngine, cancel: CancellationToken) {
    let period = engine.config().idle.check_interval;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(period) => {
                guarded("idle", async {
                    let report = engine.run_idle_sweep().await;
                    if report.paused + report.logged_out > 0 {
                        debug!(paused = report.paused, logged_out = report.logged_out, "idle sweep");
                    }
                })
                .await;
            }
        }
    }
    debug!("idle loop stopped");
}

async fn reconcile_task(engine: SessionEngine, cancel: CancellationToken) {
    let period = engine.config().reconcile_interval;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(period) => {
                guarded("reconcile", async {
                    match engine.inner.reconciler.pass().await {
                        Ok(report) if report.is_clean() => {}
                        Ok(report) => info!(
                            allowed = report.allowed,
                            blocked = report.blocked,
                            failed = report.failed,
                            "firewall drift repaired"
                        ),
                        Err(e) => warn!(error = %e, "reconciliation pass skipped"),
                    }
                })
                .await;
            }
        }
    }
    debug!("reconcile loop stopped");
}

async fn persist_task(engine: SessionEngine, cancel: CancellationToken) {
    if engine.store().path().is_none() {
        return;
    }
    let period = engine.config().persist_interval;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(period) => {}
            () = engine.inner.ctx.flush.notified() => {}
        }
        if let Err(e) = engine.flush().await {
            warn!(error = %e, "state flush failed; will retry");
        }
    }
    debug!("persist loop stopped");
}

/// Compare a presented sub-vendo key without leaking how much of it
/// matched. An empty configured key never matches.
fn subvendo_key_matches(expected: &SecretString, given: &str) -> bool {
    let expected = expected.expose_secret().as_bytes();
    !expected.is_empty() && bool::from(expected.ct_eq(given.as_bytes()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::EngineContext;
    use crate::config::EngineConfig;
    use crate::enforcer::MemoryEnforcer;
    use crate::model::{MacAddress, RateTable};
    use crate::relay::MemoryRelay;
    use crate::store::SessionStore;

    pub(crate) fn mac(n: u8) -> MacAddress {
        MacAddress::new(format!("aa:bb:cc:dd:ee:{n:02x}"))
    }

    pub(crate) fn context(
        rates: RateTable,
    ) -> (Arc<EngineContext>, Arc<MemoryEnforcer>, Arc<MemoryRelay>) {
        context_with(EngineConfig {
            rates,
            ..EngineConfig::default()
        })
    }

    pub(crate) fn context_with(
        config: EngineConfig,
    ) -> (Arc<EngineContext>, Arc<MemoryEnforcer>, Arc<MemoryRelay>) {
        let enforcer = Arc::new(MemoryEnforcer::new());
        let relay = Arc::new(MemoryRelay::new());
        let ctx = EngineContext::new(
            config,
            Arc::new(SessionStore::in_memory()),
            enforcer.clone(),
            relay.clone(),
        );
        (Arc::new(ctx), enforcer, relay)
    }
}
