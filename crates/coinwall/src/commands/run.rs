//! `coinwall run`: drive the engine loops until interrupted.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use coinwall_core::{EngineEvent, MemoryEnforcer, MemoryRelay, SessionEngine};

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;

pub async fn handle(args: &RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = super::engine_config(global)?;
    if config.rates.rates.is_empty() {
        warn!("no rate tiers configured; coin payments will buy no time");
    }

    // In-process enforcement: access decisions are tracked and logged but
    // not applied to a packet filter.
    let engine = SessionEngine::new(
        config,
        Arc::new(MemoryEnforcer::new()),
        Arc::new(MemoryRelay::new()),
    )?;
    let events = tokio::spawn(log_events(engine.subscribe()));

    engine.start().await?;
    info!(
        sessions = engine.sessions().len(),
        state_file = ?engine.config().state_file,
        "engine running"
    );

    match args.duration {
        Some(limit) => tokio::time::sleep(limit).await,
        None => tokio::signal::ctrl_c().await?,
    }

    info!("shutting down");
    engine.stop().await?;
    events.abort();
    Ok(())
}

async fn log_events(mut rx: broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(n)) => warn!(missed = n, "event log lagging"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::CoinPending(p) => {
            info!(channel = %p.channel, mac = %p.mac, amount = p.amount, "coins pending");
        }
        EngineEvent::CoinFinalized {
            channel,
            mac,
            amount,
            minutes,
            reason,
        } => info!(%channel, %mac, amount, minutes, %reason, "coins finalized"),
        EngineEvent::TimeCredited { mac, seconds } => info!(%mac, seconds, "time credited"),
        EngineEvent::PointsRedeemed {
            mac,
            points,
            seconds,
        } => info!(%mac, points, seconds, "points redeemed"),
        EngineEvent::SessionExpired { mac } => info!(%mac, "session expired"),
        EngineEvent::SessionPaused { mac } => info!(%mac, "session paused"),
        EngineEvent::SessionResumed { mac } => info!(%mac, "session resumed"),
        EngineEvent::SessionRoamed { mac, from, to } => {
            info!(%mac, ?from, %to, "session roamed");
        }
        EngineEvent::SessionLoggedOut { mac } => info!(%mac, "session logged out"),
    }
}
