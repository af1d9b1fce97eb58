// ── Coin aggregator ──
//
// Per-channel state machine: Idle → Accumulating → Finalizing → Idle.
//
// Each channel key owns one async mutex slot. start / pulse / finalize /
// timeout for a key all take that lock, so they are serialized against
// each other while different channels proceed in parallel. A finalize
// cancels the pending timer and takes the session out of its slot before
// doing anything else, which makes it at-most-once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::model::{
    ChannelKey, Credit, FinalizeReason, MacAddress, PendingCoin, PulseSource, SaleRecord,
    SelectionMode,
};
use crate::rates::{best_for_amount, best_for_amount_greedy, points_earned};

type Slot = Arc<Mutex<Option<CoinSession>>>;

/// Armed inactivity timer. `arm_id` lets a firing timer detect that it
/// was replaced while it waited for the slot lock.
#[derive(Debug)]
struct Timer {
    arm_id: u64,
    cancel: CancellationToken,
}

impl Timer {
    fn cancel(self) {
        self.cancel.cancel();
    }
}

/// In-flight payment on one channel.
#[derive(Debug)]
struct CoinSession {
    mac: MacAddress,
    pending_amount: u32,
    source_amounts: IndexMap<String, u32>,
    selection_mode: SelectionMode,
    target_device_id: Option<String>,
    started_at: DateTime<Utc>,
    timer: Option<Timer>,
}

impl CoinSession {
    fn accepts(&self, source: &PulseSource) -> bool {
        match self.selection_mode {
            SelectionMode::Auto => true,
            SelectionMode::Manual => self.target_device_id.as_deref() == Some(source.device_id()),
        }
    }
}

/// Why a pulse had no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IgnoreReason {
    NoActiveSession,
    SourceNotSelected,
    ZeroAmount,
}

/// Result of feeding a pulse into a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PulseOutcome {
    Accepted(PendingCoin),
    Ignored(IgnoreReason),
}

/// Result of a successful finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeOutcome {
    pub channel: ChannelKey,
    pub mac: MacAddress,
    pub reason: FinalizeReason,
    pub amount: u32,
    pub minutes_added: u64,
    pub download_speed: u32,
    pub upload_speed: u32,
    pub points_earned: u64,
    /// Session time after the credit, in seconds.
    pub time_remaining: u64,
    /// Whether the enforcer accepted the device. `false` also covers
    /// transient enforcer failures, which the reconciler retries.
    pub access_granted: bool,
}

impl FinalizeOutcome {
    /// Nothing was paid or no tier applied.
    pub fn is_noop(&self) -> bool {
        self.minutes_added == 0
    }
}

/// Accumulates pulses per channel and commits them as session time.
pub struct CoinAggregator {
    ctx: Arc<EngineContext>,
    channels: DashMap<ChannelKey, Slot>,
    next_arm: AtomicU64,
}

impl CoinAggregator {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            channels: DashMap::new(),
            next_arm: AtomicU64::new(1),
        }
    }

    fn slot(&self, channel: &ChannelKey) -> Slot {
        Arc::clone(
            self.channels
                .entry(channel.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        )
    }

    fn existing_slot(&self, channel: &ChannelKey) -> Option<Slot> {
        self.channels.get(channel).map(|s| Arc::clone(s.value()))
    }

    // ── Start ────────────────────────────────────────────────────────

    /// Bind `channel` to `mac` and open the coin slot.
    ///
    /// Starting again from the same device resumes the pending amount.
    /// Another device gets [`EngineError::ChannelBusy`] until the channel
    /// is finalized.
    pub async fn start(
        self: &Arc<Self>,
        channel: ChannelKey,
        mac: MacAddress,
        mode: SelectionMode,
        target_device_id: Option<String>,
    ) -> Result<PendingCoin, EngineError> {
        if !mac.is_valid() {
            return Err(EngineError::InvalidRequest {
                message: format!("'{mac}' is not a MAC address"),
            });
        }
        if mode == SelectionMode::Manual && target_device_id.is_none() {
            return Err(EngineError::InvalidRequest {
                message: "manual selection needs a target device".into(),
            });
        }

        let slot = self.slot(&channel);
        let mut guard = slot.lock().await;

        if let Some(existing) = guard.as_mut() {
            if existing.mac != mac {
                debug!(channel = %channel, bound_to = %existing.mac, %mac, "channel busy");
                return Err(EngineError::ChannelBusy {
                    channel,
                    bound_to: existing.mac.clone(),
                });
            }
            let timeout = self.ctx.config.coin.start_timeout;
            self.arm(&channel, existing, timeout);
            let view = self.view(&channel, existing);
            debug!(channel = %channel, %mac, amount = existing.pending_amount, "coin session resumed");
            self.ctx.emit(EngineEvent::CoinPending(view.clone()));
            return Ok(view);
        }

        self.ctx.relay.activate(&channel).await?;

        let mut session = CoinSession {
            mac: mac.clone(),
            pending_amount: 0,
            source_amounts: IndexMap::new(),
            selection_mode: mode,
            target_device_id,
            started_at: Utc::now(),
            timer: None,
        };
        self.arm(&channel, &mut session, self.ctx.config.coin.start_timeout);
        let view = self.view(&channel, &session);
        *guard = Some(session);

        info!(channel = %channel, %mac, mode = %mode, "coin session started");
        self.ctx.emit(EngineEvent::CoinPending(view.clone()));
        Ok(view)
    }

    // ── Pulse ────────────────────────────────────────────────────────

    /// Add `amount` from `source` to the channel's pending payment.
    pub async fn pulse(
        self: &Arc<Self>,
        channel: &ChannelKey,
        amount: u32,
        source: &PulseSource,
    ) -> PulseOutcome {
        if amount == 0 {
            return PulseOutcome::Ignored(IgnoreReason::ZeroAmount);
        }
        let Some(slot) = self.existing_slot(channel) else {
            warn!(channel = %channel, amount, "pulse on idle channel ignored");
            return PulseOutcome::Ignored(IgnoreReason::NoActiveSession);
        };

        let mut guard = slot.lock().await;
        let Some(session) = guard.as_mut() else {
            warn!(channel = %channel, amount, "pulse on idle channel ignored");
            return PulseOutcome::Ignored(IgnoreReason::NoActiveSession);
        };
        if !session.accepts(source) {
            info!(
                channel = %channel,
                source = %source,
                target = ?session.target_device_id,
                "pulse from unselected device ignored"
            );
            return PulseOutcome::Ignored(IgnoreReason::SourceNotSelected);
        }

        session.pending_amount = session.pending_amount.saturating_add(amount);
        let booked = session
            .source_amounts
            .entry(source.device_id().to_owned())
            .or_insert(0);
        *booked = booked.saturating_add(amount);

        self.arm(channel, session, self.ctx.config.coin.pulse_timeout);
        let view = self.view(channel, session);
        debug!(
            channel = %channel,
            mac = %session.mac,
            amount,
            pending = session.pending_amount,
            preview_minutes = view.preview_minutes,
            "pulse accepted"
        );
        self.ctx.emit(EngineEvent::CoinPending(view.clone()));
        PulseOutcome::Accepted(view)
    }

    // ── Finalize ─────────────────────────────────────────────────────

    /// Close the channel and credit the pooled amount.
    ///
    /// A second finalize on the same channel observes
    /// [`EngineError::NoActiveSession`] and has no side effect.
    pub async fn finalize(
        &self,
        channel: &ChannelKey,
        reason: FinalizeReason,
    ) -> Result<FinalizeOutcome, EngineError> {
        let session = self.take(channel, None).await?;
        Ok(self.commit(channel, session, reason).await)
    }

    /// Timer entry point: only finalizes if the timer that fired is still
    /// the armed one.
    async fn finalize_expired_timer(&self, channel: &ChannelKey, arm_id: u64) {
        match self.take(channel, Some(arm_id)).await {
            Ok(session) => {
                self.commit(channel, session, FinalizeReason::Timeout).await;
            }
            Err(_) => debug!(channel = %channel, arm_id, "stale coin timer ignored"),
        }
    }

    /// Cancel the timer, then remove the session from its slot.
    async fn take(
        &self,
        channel: &ChannelKey,
        expected_arm: Option<u64>,
    ) -> Result<CoinSession, EngineError> {
        let no_session = || EngineError::NoActiveSession {
            channel: channel.clone(),
        };
        let slot = self.existing_slot(channel).ok_or_else(no_session)?;
        let mut guard = slot.lock().await;
        let session = guard.as_mut().ok_or_else(no_session)?;

        if let Some(expected) = expected_arm {
            if session.timer.as_ref().map(|t| t.arm_id) != Some(expected) {
                return Err(no_session());
            }
        }
        if let Some(timer) = session.timer.take() {
            timer.cancel();
        }
        guard.take().ok_or_else(no_session)
    }

    async fn commit(
        &self,
        channel: &ChannelKey,
        session: CoinSession,
        reason: FinalizeReason,
    ) -> FinalizeOutcome {
        let ctx = &self.ctx;
        let now = Utc::now();
        let mac = session.mac.clone();
        let amount = session.pending_amount;

        if let Err(e) = ctx.relay.deactivate(channel).await {
            warn!(channel = %channel, error = %e, "failed to close coin relay");
        }

        for (source, &booked) in &session.source_amounts {
            if booked > 0 {
                ctx.store.record_sale(SaleRecord::new(
                    mac.clone(),
                    channel.clone(),
                    source.clone(),
                    booked,
                    now,
                ));
            }
        }

        let mut outcome = FinalizeOutcome {
            channel: channel.clone(),
            mac: mac.clone(),
            reason,
            amount,
            minutes_added: 0,
            download_speed: 0,
            upload_speed: 0,
            points_earned: 0,
            time_remaining: ctx.store.get(&mac).map_or(0, |s| s.time_remaining),
            access_granted: false,
        };

        let quote = best_for_amount(amount, &ctx.rates.load().rates);
        if quote.is_empty() {
            if amount > 0 {
                warn!(channel = %channel, %mac, amount, "paid amount buys no time");
            }
            info!(
                channel = %channel,
                %mac,
                amount,
                reason = %reason,
                elapsed_secs = (now - session.started_at).num_seconds(),
                "coin session closed without credit"
            );
            ctx.request_flush();
            return outcome;
        }

        let credit = Credit {
            seconds: quote.seconds(),
            download_speed: quote.download_speed,
            upload_speed: quote.upload_speed,
            pausable: quote.pausable,
            points_earned: points_earned(amount, ctx.config.coin.points_earning_rate),
        };

        let needs_binding = ctx.store.get(&mac).is_none_or(|s| s.ip.is_none());
        let binding = if needs_binding {
            ctx.lookup_binding(&mac).await
        } else {
            None
        };

        let updated = ctx.store.upsert(&mac, now, |s| {
            if let Some(binding) = binding {
                s.ip = Some(binding.ip);
                s.interface = binding.interface;
            }
            s.apply_credit(&credit, now);
            s.clone()
        });

        outcome.minutes_added = quote.minutes;
        outcome.download_speed = updated.download_speed;
        outcome.upload_speed = updated.upload_speed;
        outcome.points_earned = credit.points_earned;
        outcome.time_remaining = updated.time_remaining;
        outcome.access_granted = match ctx.enforcer.grant(&updated).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!(%mac, error = %e, "grant after payment failed; reconciler will retry");
                false
            }
        };

        info!(
            channel = %channel,
            %mac,
            amount,
            minutes = quote.minutes,
            tiers = ?quote.tiers_used,
            reason = %reason,
            "coin session finalized"
        );
        ctx.emit(EngineEvent::CoinFinalized {
            channel: channel.clone(),
            mac,
            amount,
            minutes: quote.minutes,
            reason,
        });
        ctx.request_flush();
        outcome
    }

    /// Finalize every open channel. Used on shutdown so inserted money is
    /// never dropped.
    pub async fn finalize_all(&self, reason: FinalizeReason) -> Vec<FinalizeOutcome> {
        let keys: Vec<ChannelKey> = self.channels.iter().map(|e| e.key().clone()).collect();
        let mut outcomes = Vec::new();
        for key in keys {
            if let Ok(outcome) = self.finalize(&key, reason).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    // ── Views ────────────────────────────────────────────────────────

    /// Pending payment on a channel, if any.
    pub async fn pending(&self, channel: &ChannelKey) -> Option<PendingCoin> {
        let slot = self.existing_slot(channel)?;
        let guard = slot.lock().await;
        guard.as_ref().map(|s| self.view(channel, s))
    }

    /// Pending payment bound to a device, on whichever channel.
    pub async fn pending_for(&self, mac: &MacAddress) -> Option<PendingCoin> {
        let slots: Vec<(ChannelKey, Slot)> = self
            .channels
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (channel, slot) in slots {
            let guard = slot.lock().await;
            if let Some(session) = guard.as_ref().filter(|s| &s.mac == mac) {
                return Some(self.view(&channel, session));
            }
        }
        None
    }

    fn view(&self, channel: &ChannelKey, session: &CoinSession) -> PendingCoin {
        let preview = best_for_amount_greedy(session.pending_amount, &self.ctx.rates.load().rates);
        PendingCoin {
            channel: channel.clone(),
            mac: session.mac.clone(),
            amount: session.pending_amount,
            preview_minutes: preview.minutes,
            source_amounts: session.source_amounts.clone(),
            selection_mode: session.selection_mode,
            target_device_id: session.target_device_id.clone(),
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Cancel the session's current timer and arm a new one.
    fn arm(self: &Arc<Self>, channel: &ChannelKey, session: &mut CoinSession, after: Duration) {
        if let Some(old) = session.timer.take() {
            old.cancel();
        }

        let arm_id = self.next_arm.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        session.timer = Some(Timer {
            arm_id,
            cancel: cancel.clone(),
        });

        // Weak so a pending timer never keeps a stopped engine (and its
        // state file lock) alive.
        let this = Arc::downgrade(self);
        let channel = channel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(after) => {
                    let Some(this) = this.upgrade() else {
                        return;
                    };
                    debug!(channel = %channel, arm_id, "coin timer fired");
                    this.finalize_expired_timer(&channel, arm_id).await;
                }
            }
        });
    }
}
