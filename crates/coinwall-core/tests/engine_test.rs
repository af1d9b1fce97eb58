#![allow(clippy::unwrap_used)]
// Integration tests for `SessionEngine` against the in-memory enforcer.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use coinwall_core::{
    ChannelKey, ClientBinding, EngineConfig, EngineError, EngineEvent, EnforcerCall,
    FinalizeReason, MacAddress, MemoryEnforcer, MemoryRelay, RateTable, RateTier, SelectionMode,
    SessionEngine, SessionState, SessionStore,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn mac(n: u8) -> MacAddress {
    MacAddress::new(format!("aa:bb:cc:dd:ee:{n:02x}"))
}

fn rates() -> RateTable {
    RateTable::new(
        vec![
            RateTier::new(1, 15),
            RateTier::new(5, 120).with_speeds(3072, 1024),
            RateTier::new(10, 300).with_speeds(5120, 2048),
        ],
        Vec::new(),
    )
}

fn config() -> EngineConfig {
    EngineConfig {
        rates: rates(),
        ..EngineConfig::default()
    }
}

fn setup() -> (SessionEngine, Arc<MemoryEnforcer>) {
    setup_with(config(), Arc::new(SessionStore::in_memory()))
}

fn setup_with(config: EngineConfig, store: Arc<SessionStore>) -> (SessionEngine, Arc<MemoryEnforcer>) {
    let enforcer = Arc::new(MemoryEnforcer::new());
    let engine = SessionEngine::with_store(
        config,
        store,
        enforcer.clone(),
        Arc::new(MemoryRelay::new()),
    );
    (engine, enforcer)
}

async fn pay(engine: &SessionEngine, who: &MacAddress, amount: u32) {
    engine
        .start_coin_session(ChannelKey::Hardware, who.clone(), SelectionMode::Auto, None)
        .await
        .unwrap();
    engine.coin_pulse(amount).await;
    engine.coin_done(&ChannelKey::Hardware).await.unwrap();
}

// ── Coin channel ────────────────────────────────────────────────────

#[tokio::test]
async fn test_optimal_time_is_committed() {
    let (engine, enforcer) = setup();
    pay(&engine, &mac(1), 15).await;

    let session = engine.session(&mac(1)).unwrap();
    assert_eq!(session.time_remaining, 420 * 60);
    assert_eq!(session.state(), SessionState::Active);
    assert!(enforcer.is_authorized(&mac(1)));
}

#[tokio::test]
async fn test_channel_is_exclusive_until_finalized() {
    let (engine, _) = setup();
    let key = ChannelKey::Hardware;
    engine
        .start_coin_session(key.clone(), mac(1), SelectionMode::Auto, None)
        .await
        .unwrap();

    let busy = engine
        .start_coin_session(key.clone(), mac(2), SelectionMode::Auto, None)
        .await;
    assert!(matches!(busy, Err(EngineError::ChannelBusy { .. })));

    engine.coin_done(&key).await.unwrap();
    engine
        .start_coin_session(key, mac(2), SelectionMode::Auto, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_channels_are_independent() {
    let (engine, _) = setup();
    engine
        .start_coin_session(ChannelKey::Hardware, mac(1), SelectionMode::Auto, None)
        .await
        .unwrap();
    engine
        .start_coin_session(ChannelKey::subvendo("esp-01"), mac(2), SelectionMode::Auto, None)
        .await
        .unwrap();

    assert!(engine.pending(&ChannelKey::Hardware).await.is_some());
    assert!(engine.pending(&ChannelKey::subvendo("esp-01")).await.is_some());
}

#[tokio::test]
async fn test_double_finalize_has_no_side_effect() {
    let (engine, _) = setup();
    pay(&engine, &mac(1), 5).await;

    let again = engine.coin_done(&ChannelKey::Hardware).await;
    assert!(matches!(again, Err(EngineError::NoActiveSession { .. })));
    assert_eq!(engine.session(&mac(1)).unwrap().time_remaining, 120 * 60);
    assert_eq!(engine.sales().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timer_and_done_race_finalizes_once() {
    let (engine, _) = setup();
    engine
        .start_coin_session(ChannelKey::Hardware, mac(1), SelectionMode::Auto, None)
        .await
        .unwrap();
    engine.coin_pulse(10).await;

    // Land the explicit "done" right as the 30s pulse timer fires.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let done = engine.coin_done(&ChannelKey::Hardware).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let finalized = done.is_ok();
    let session = engine.session(&mac(1)).unwrap();
    assert_eq!(session.time_remaining, 300 * 60, "credited once (done ok: {finalized})");
    assert_eq!(engine.sales().len(), 1);
}

#[tokio::test]
async fn test_speed_never_decreases() {
    let (engine, enforcer) = setup();
    let ip: IpAddr = "10.0.0.20".parse().unwrap();
    enforcer.set_neighbor(&mac(1), ClientBinding { ip, interface: Some("wlan0".into()) });

    pay(&engine, &mac(1), 10).await;
    pay(&engine, &mac(1), 5).await;

    let session = engine.session(&mac(1)).unwrap();
    assert_eq!(session.download_speed, 5120);
    assert_eq!(session.upload_speed, 2048);
    assert_eq!(enforcer.limit_for(ip), Some((5120, 2048)));
}

#[tokio::test]
async fn test_events_follow_the_payment() {
    let (engine, _) = setup();
    let mut events = engine.subscribe();
    pay(&engine, &mac(1), 1).await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event);
    }
    assert!(matches!(kinds.first(), Some(EngineEvent::CoinPending(_))));
    assert!(matches!(
        kinds.last(),
        Some(EngineEvent::CoinFinalized { amount: 1, minutes: 15, reason: FinalizeReason::Done, .. })
    ));
}

// ── Countdown / idle ────────────────────────────────────────────────

#[tokio::test]
async fn test_paused_session_keeps_its_time() {
    let (engine, enforcer) = setup();
    pay(&engine, &mac(1), 5).await;
    engine.pause_session(&mac(1)).await.unwrap();
    assert!(!enforcer.is_authorized(&mac(1)));

    for _ in 0..10 {
        engine.run_countdown_tick(1).await;
    }
    let paused = engine.session(&mac(1)).unwrap();
    assert_eq!(paused.time_remaining, 120 * 60);
    assert_eq!(paused.state(), SessionState::Paused);

    engine.resume_session(&mac(1)).await.unwrap();
    engine.run_countdown_tick(1).await;
    assert_eq!(engine.session(&mac(1)).unwrap().time_remaining, 120 * 60 - 1);
    assert!(enforcer.is_authorized(&mac(1)));
}

#[tokio::test]
async fn test_expiry_is_exact_and_idempotent() {
    let (engine, enforcer) = setup();
    engine
        .credit_time(&mac(1), 65, 0, 0)
        .await
        .unwrap();

    let report = engine.run_countdown_tick(70).await;
    assert_eq!(report.expired, 1);
    assert!(!enforcer.is_authorized(&mac(1)));

    let blocks = enforcer.count_calls(|c| matches!(c, EnforcerCall::Block { .. }));
    let report = engine.run_countdown_tick(70).await;
    assert_eq!(report.expired, 0);
    assert_eq!(
        enforcer.count_calls(|c| matches!(c, EnforcerCall::Block { .. })),
        blocks
    );
    assert_eq!(engine.session(&mac(1)).unwrap().time_remaining, 0);
}

#[tokio::test]
async fn test_topup_after_expiry_restores_access() {
    let (engine, enforcer) = setup();
    engine.credit_time(&mac(1), 5, 0, 0).await.unwrap();
    engine.run_countdown_tick(10).await;
    assert!(!enforcer.is_authorized(&mac(1)));

    pay(&engine, &mac(1), 1).await;
    let session = engine.session(&mac(1)).unwrap();
    assert_eq!(session.time_remaining, 15 * 60);
    assert!(session.is_connected);
    assert!(enforcer.is_authorized(&mac(1)));
}

// ── Reconciliation ──────────────────────────────────────────────────

#[tokio::test]
async fn test_reconcile_converges_both_ways() {
    let (engine, enforcer) = setup();
    pay(&engine, &mac(1), 5).await;

    enforcer.force_authorized(&mac(1), false);
    enforcer.force_authorized(&mac(9), true);

    let report = engine.run_reconcile_pass().await.unwrap();
    assert_eq!(report.allowed, 1);
    assert_eq!(report.blocked, 1);
    assert!(enforcer.is_authorized(&mac(1)));
    assert!(!enforcer.is_authorized(&mac(9)));

    assert!(engine.run_reconcile_pass().await.unwrap().is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_slow_enforcer_does_not_stall_finalize() {
    let (engine, enforcer) = setup();
    engine
        .start_coin_session(ChannelKey::Hardware, mac(1), SelectionMode::Auto, None)
        .await
        .unwrap();
    engine.coin_pulse(5).await;
    enforcer.set_delay(Some(Duration::from_secs(120)));

    let outcome = engine.coin_done(&ChannelKey::Hardware).await.unwrap();
    assert!(!outcome.access_granted);
    assert_eq!(engine.session(&mac(1)).unwrap().time_remaining, 120 * 60);

    enforcer.set_delay(None);
    engine.run_reconcile_pass().await.unwrap();
    assert!(enforcer.is_authorized(&mac(1)));
}

// ── Persistence / restart ───────────────────────────────────────────

#[tokio::test]
async fn test_restart_restores_enforcement() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("sessions.json");
    let config = EngineConfig {
        state_file: Some(state_file.clone()),
        ..config()
    };

    {
        let enforcer = Arc::new(MemoryEnforcer::new());
        let engine = SessionEngine::new(config.clone(), enforcer, Arc::new(MemoryRelay::new())).unwrap();
        engine.start().await.unwrap();
        pay(&engine, &mac(1), 5).await;
        engine.credit_time(&mac(2), 600, 0, 0).await.unwrap();
        engine.pause_session(&mac(2)).await.unwrap();
        engine.stop().await.unwrap();
    }

    let enforcer = Arc::new(MemoryEnforcer::new());
    let engine = SessionEngine::new(config, enforcer.clone(), Arc::new(MemoryRelay::new())).unwrap();
    assert_eq!(engine.sessions().len(), 2);
    engine.start().await.unwrap();

    assert!(enforcer.is_authorized(&mac(1)));
    assert!(!enforcer.is_authorized(&mac(2)), "paused sessions stay blocked");
    assert_eq!(engine.sales().len(), 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_reports_pending_coins() {
    let (engine, _) = setup();
    engine
        .start_coin_session(ChannelKey::Hardware, mac(3), SelectionMode::Auto, None)
        .await
        .unwrap();
    engine.coin_pulse(6).await;

    let status = engine.get_status(&mac(3)).await;
    assert_eq!(status.state, SessionState::Offline);
    let pending = status.pending.unwrap();
    assert_eq!(pending.amount, 6);
    assert_eq!(pending.preview_minutes, 135);
    assert!(status.session.is_none());
}
