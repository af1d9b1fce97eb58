// ── Enforcement capability ──
//
// The engine never touches packet filters or traffic shapers itself. It
// talks to whatever backend the gateway runs (nftables, tc, a vendor
// daemon) through `AccessEnforcer`, and every call goes through
// `BoundedEnforcer` so a hung backend can't stall a scheduler loop.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EnforceError;
use crate::model::{MacAddress, Session};

/// Where a device currently sits on the network, per the neighbor/lease table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientBinding {
    pub ip: IpAddr,
    pub interface: Option<String>,
}

/// Cumulative byte counters reported for one IP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Capability interface to the external enforcement mechanism.
///
/// Implementations must be idempotent: `allow` on an allowed device and
/// `block` on a blocked one are no-ops.
#[async_trait]
pub trait AccessEnforcer: Send + Sync {
    /// Grant network access. `Ok(false)` means the backend refused, e.g. a
    /// capacity or license limit was reached.
    async fn allow(&self, mac: &MacAddress, ip: Option<IpAddr>) -> Result<bool, EnforceError>;

    async fn block(&self, mac: &MacAddress, ip: Option<IpAddr>) -> Result<(), EnforceError>;

    async fn set_bandwidth_limit(
        &self,
        ip: IpAddr,
        down_kbps: u32,
        up_kbps: u32,
    ) -> Result<(), EnforceError>;

    async fn remove_bandwidth_limit(&self, ip: IpAddr) -> Result<(), EnforceError>;

    /// Devices the backend currently lets through.
    async fn authorized_macs(&self) -> Result<HashSet<MacAddress>, EnforceError>;

    /// Neighbor/lease table snapshot.
    async fn active_macs(&self) -> Result<HashMap<MacAddress, ClientBinding>, EnforceError>;

    /// Cumulative per-IP byte counters.
    async fn traffic_stats(&self) -> Result<HashMap<IpAddr, TrafficCounters>, EnforceError>;
}

// ── Bounded wrapper ──────────────────────────────────────────────────

/// Wraps an [`AccessEnforcer`] so every call is bounded by a timeout.
///
/// A timeout surfaces as [`EnforceError::Timeout`], which callers treat
/// like any other transient failure.
#[derive(Clone)]
pub struct BoundedEnforcer {
    inner: Arc<dyn AccessEnforcer>,
    timeout: Duration,
}

impl BoundedEnforcer {
    pub fn new(inner: Arc<dyn AccessEnforcer>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, EnforceError>>,
    ) -> Result<T, EnforceError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| EnforceError::Timeout {
                operation,
                timeout: self.timeout,
            })?
    }

    pub async fn allow(&self, mac: &MacAddress, ip: Option<IpAddr>) -> Result<bool, EnforceError> {
        self.bounded("allow", self.inner.allow(mac, ip)).await
    }

    pub async fn block(&self, mac: &MacAddress, ip: Option<IpAddr>) -> Result<(), EnforceError> {
        self.bounded("block", self.inner.block(mac, ip)).await
    }

    pub async fn set_bandwidth_limit(
        &self,
        ip: IpAddr,
        down_kbps: u32,
        up_kbps: u32,
    ) -> Result<(), EnforceError> {
        self.bounded(
            "set_bandwidth_limit",
            self.inner.set_bandwidth_limit(ip, down_kbps, up_kbps),
        )
        .await
    }

    pub async fn remove_bandwidth_limit(&self, ip: IpAddr) -> Result<(), EnforceError> {
        self.bounded("remove_bandwidth_limit", self.inner.remove_bandwidth_limit(ip))
            .await
    }

    pub async fn authorized_macs(&self) -> Result<HashSet<MacAddress>, EnforceError> {
        self.bounded("authorized_macs", self.inner.authorized_macs())
            .await
    }

    pub async fn active_macs(&self) -> Result<HashMap<MacAddress, ClientBinding>, EnforceError> {
        self.bounded("active_macs", self.inner.active_macs()).await
    }

    pub async fn traffic_stats(&self) -> Result<HashMap<IpAddr, TrafficCounters>, EnforceError> {
        self.bounded("traffic_stats", self.inner.traffic_stats())
            .await
    }

    // ── Composite transitions ────────────────────────────────────────

    /// Allow the device and shape it to the session's speeds.
    ///
    /// Returns the backend's verdict on `allow`. Shaping is skipped when the
    /// device has no known IP or no speed was ever paid for.
    pub async fn grant(&self, session: &Session) -> Result<bool, EnforceError> {
        let allowed = self.allow(&session.mac, session.ip).await?;
        if !allowed {
            warn!(mac = %session.mac, "enforcer refused access (capacity limit?)");
            return Ok(false);
        }
        if let Some(ip) = session.ip {
            if session.download_speed > 0 || session.upload_speed > 0 {
                self.set_bandwidth_limit(ip, session.download_speed, session.upload_speed)
                    .await?;
            }
        }
        debug!(mac = %session.mac, ip = ?session.ip, "access granted");
        Ok(true)
    }

    /// Block the device and drop its shaping rule.
    pub async fn revoke(&self, session: &Session) -> Result<(), EnforceError> {
        self.block(&session.mac, session.ip).await?;
        if let Some(ip) = session.ip {
            self.remove_bandwidth_limit(ip).await?;
        }
        debug!(mac = %session.mac, ip = ?session.ip, "access revoked");
        Ok(())
    }
}

// ── In-memory backend ────────────────────────────────────────────────

/// One recorded call against a [`MemoryEnforcer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcerCall {
    Allow { mac: MacAddress, ip: Option<IpAddr> },
    Block { mac: MacAddress, ip: Option<IpAddr> },
    SetLimit { ip: IpAddr, down_kbps: u32, up_kbps: u32 },
    RemoveLimit { ip: IpAddr },
}

#[derive(Debug, Default)]
struct MemoryState {
    authorized: HashSet<MacAddress>,
    limits: HashMap<IpAddr, (u32, u32)>,
    neighbors: HashMap<MacAddress, ClientBinding>,
    traffic: HashMap<IpAddr, TrafficCounters>,
    calls: Vec<EnforcerCall>,
    capacity: Option<usize>,
    failing: HashSet<&'static str>,
    delay: Option<Duration>,
}

/// Enforcement backend that only keeps state in memory.
///
/// Used for dry runs of the daemon and as the test double for the engine:
/// every call is recorded, and failures, latency, and capacity limits can
/// be injected.
#[derive(Debug, Default)]
pub struct MemoryEnforcer {
    state: Mutex<MemoryState>,
}

impl MemoryEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    async fn enter(&self, operation: &'static str) -> Result<(), EnforceError> {
        let (delay, failing) =
            self.with_state(|s| (s.delay, s.failing.contains(operation)));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(EnforceError::Backend(format!("injected failure in {operation}")));
        }
        Ok(())
    }

    // ── Fixture setup ────────────────────────────────────────────────

    /// Refuse `allow` once this many devices are authorized.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.with_state(|s| s.capacity = capacity);
    }

    /// Make every call to `operation` fail until cleared.
    pub fn fail(&self, operation: &'static str) {
        self.with_state(|s| {
            s.failing.insert(operation);
        });
    }

    pub fn clear_failures(&self) {
        self.with_state(|s| s.failing.clear());
    }

    /// Delay every call, to exercise caller timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.delay = delay);
    }

    pub fn set_neighbor(&self, mac: &MacAddress, binding: ClientBinding) {
        self.with_state(|s| {
            s.neighbors.insert(mac.clone(), binding);
        });
    }

    pub fn set_traffic(&self, ip: IpAddr, counters: TrafficCounters) {
        self.with_state(|s| {
            s.traffic.insert(ip, counters);
        });
    }

    /// Pretend the backend lost or gained state behind the engine's back.
    pub fn force_authorized(&self, mac: &MacAddress, authorized: bool) {
        self.with_state(|s| {
            if authorized {
                s.authorized.insert(mac.clone());
            } else {
                s.authorized.remove(mac);
            }
        });
    }

    // ── Inspection ───────────────────────────────────────────────────

    pub fn is_authorized(&self, mac: &MacAddress) -> bool {
        self.with_state(|s| s.authorized.contains(mac))
    }

    pub fn limit_for(&self, ip: IpAddr) -> Option<(u32, u32)> {
        self.with_state(|s| s.limits.get(&ip).copied())
    }

    pub fn calls(&self) -> Vec<EnforcerCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    pub fn count_calls(&self, pred: impl Fn(&EnforcerCall) -> bool) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| pred(c)).count())
    }
}

#[async_trait]
impl AccessEnforcer for MemoryEnforcer {
    async fn allow(&self, mac: &MacAddress, ip: Option<IpAddr>) -> Result<bool, EnforceError> {
        self.enter("allow").await?;
        Ok(self.with_state(|s| {
            s.calls.push(EnforcerCall::Allow {
                mac: mac.clone(),
                ip,
            });
            let full = s
                .capacity
                .is_some_and(|cap| s.authorized.len() >= cap && !s.authorized.contains(mac));
            if full {
                return false;
            }
            s.authorized.insert(mac.clone());
            true
        }))
    }

    async fn block(&self, mac: &MacAddress, ip: Option<IpAddr>) -> Result<(), EnforceError> {
        self.enter("block").await?;
        self.with_state(|s| {
            s.calls.push(EnforcerCall::Block {
                mac: mac.clone(),
                ip,
            });
            s.authorized.remove(mac);
        });
        Ok(())
    }

    async fn set_bandwidth_limit(
        &self,
        ip: IpAddr,
        down_kbps: u32,
        up_kbps: u32,
    ) -> Result<(), EnforceError> {
        self.enter("set_bandwidth_limit").await?;
        self.with_state(|s| {
            s.calls.push(EnforcerCall::SetLimit {
                ip,
                down_kbps,
                up_kbps,
            });
            s.limits.insert(ip, (down_kbps, up_kbps));
        });
        Ok(())
    }

    async fn remove_bandwidth_limit(&self, ip: IpAddr) -> Result<(), EnforceError> {
        self.enter("remove_bandwidth_limit").await?;
        self.with_state(|s| {
            s.calls.push(EnforcerCall::RemoveLimit { ip });
            s.limits.remove(&ip);
        });
        Ok(())
    }

    async fn authorized_macs(&self) -> Result<HashSet<MacAddress>, EnforceError> {
        self.enter("authorized_macs").await?;
        Ok(self.with_state(|s| s.authorized.clone()))
    }

    async fn active_macs(&self) -> Result<HashMap<MacAddress, ClientBinding>, EnforceError> {
        self.enter("active_macs").await?;
        Ok(self.with_state(|s| s.neighbors.clone()))
    }

    async fn traffic_stats(&self) -> Result<HashMap<IpAddr, TrafficCounters>, EnforceError> {
        self.enter("traffic_stats").await?;
        Ok(self.with_state(|s| s.traffic.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn mac() -> MacAddress {
        MacAddress::new("aa:bb:cc:dd:ee:01")
    }

    #[tokio::test]
    async fn allow_and_block_are_idempotent() {
        let backend = MemoryEnforcer::new();
        assert!(backend.allow(&mac(), None).await.unwrap());
        assert!(backend.allow(&mac(), None).await.unwrap());
        assert!(backend.is_authorized(&mac()));

        backend.block(&mac(), None).await.unwrap();
        backend.block(&mac(), None).await.unwrap();
        assert!(!backend.is_authorized(&mac()));
    }

    #[tokio::test]
    async fn capacity_limit_refuses_new_devices_only() {
        let backend = MemoryEnforcer::new();
        backend.set_capacity(Some(1));
        assert!(backend.allow(&mac(), None).await.unwrap());
        assert!(backend.allow(&mac(), None).await.unwrap());
        let other = MacAddress::new("aa:bb:cc:dd:ee:02");
        assert!(!backend.allow(&other, None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_enforcer_times_out_slow_backend() {
        let backend = Arc::new(MemoryEnforcer::new());
        backend.set_delay(Some(Duration::from_secs(30)));
        let bounded = BoundedEnforcer::new(backend.clone(), Duration::from_secs(2));

        let err = bounded.allow(&mac(), None).await.unwrap_err();
        assert!(matches!(err, EnforceError::Timeout { operation: "allow", .. }));
        assert!(!backend.is_authorized(&mac()));
    }

    #[tokio::test]
    async fn grant_shapes_only_with_ip_and_speed() {
        let backend = Arc::new(MemoryEnforcer::new());
        let bounded = BoundedEnforcer::new(backend.clone(), Duration::from_secs(2));
        let ip: IpAddr = "10.0.0.20".parse().unwrap();

        let mut session = Session::new(mac(), Utc::now());
        assert!(bounded.grant(&session).await.unwrap());
        assert_eq!(backend.count_calls(|c| matches!(c, EnforcerCall::SetLimit { .. })), 0);

        session.ip = Some(ip);
        session.download_speed = 5120;
        session.upload_speed = 1024;
        bounded.grant(&session).await.unwrap();
        assert_eq!(backend.limit_for(ip), Some((5120, 1024)));

        bounded.revoke(&session).await.unwrap();
        assert_eq!(backend.limit_for(ip), None);
        assert!(!backend.is_authorized(&mac()));
    }
}
