// ── Coin acceptor relay capability ──
//
// The coin slot only takes money while its relay is energized. For the
// main unit that is a GPIO line; for a sub-vendo it is a command sent to
// the satellite. Both sit behind this trait. The aggregator holds a
// channel's slot lock across `activate`, so every call goes through
// `BoundedRelay`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EnforceError;
use crate::model::ChannelKey;

#[async_trait]
pub trait ChannelRelay: Send + Sync {
    /// Energize the coin acceptor for `channel`.
    async fn activate(&self, channel: &ChannelKey) -> Result<(), EnforceError>;

    /// De-energize it. Must be safe on an already inactive channel.
    async fn deactivate(&self, channel: &ChannelKey) -> Result<(), EnforceError>;
}

/// Wraps a [`ChannelRelay`] so every call is bounded by a timeout.
#[derive(Clone)]
pub struct BoundedRelay {
    inner: Arc<dyn ChannelRelay>,
    timeout: Duration,
}

impl BoundedRelay {
    pub fn new(inner: Arc<dyn ChannelRelay>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<(), EnforceError>>,
    ) -> Result<(), EnforceError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| EnforceError::Timeout {
                operation,
                timeout: self.timeout,
            })?
    }

    pub async fn activate(&self, channel: &ChannelKey) -> Result<(), EnforceError> {
        self.bounded("relay_activate", self.inner.activate(channel))
            .await
    }

    pub async fn deactivate(&self, channel: &ChannelKey) -> Result<(), EnforceError> {
        self.bounded("relay_deactivate", self.inner.deactivate(channel))
            .await
    }
}

/// Relay that only tracks which channels are armed.
#[derive(Debug, Default)]
pub struct MemoryRelay {
    active: Mutex<HashSet<ChannelKey>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, channel: &ChannelKey) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(channel)
    }
}

#[async_trait]
impl ChannelRelay for MemoryRelay {
    async fn activate(&self, channel: &ChannelKey) -> Result<(), EnforceError> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.clone());
        Ok(())
    }

    async fn deactivate(&self, channel: &ChannelKey) -> Result<(), EnforceError> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct StuckRelay;

    #[async_trait]
    impl ChannelRelay for StuckRelay {
        async fn activate(&self, _: &ChannelKey) -> Result<(), EnforceError> {
            std::future::pending().await
        }

        async fn deactivate(&self, _: &ChannelKey) -> Result<(), EnforceError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_relay_times_out_stuck_hardware() {
        let relay = BoundedRelay::new(Arc::new(StuckRelay), Duration::from_secs(2));
        let err = relay.activate(&ChannelKey::Hardware).await.unwrap_err();
        assert!(matches!(err, EnforceError::Timeout { operation: "relay_activate", .. }));
        let err = relay.deactivate(&ChannelKey::Hardware).await.unwrap_err();
        assert!(matches!(err, EnforceError::Timeout { operation: "relay_deactivate", .. }));
    }

    #[tokio::test]
    async fn memory_relay_tracks_armed_channels() {
        let memory = Arc::new(MemoryRelay::new());
        let relay = BoundedRelay::new(memory.clone(), Duration::from_secs(2));
        relay.activate(&ChannelKey::Hardware).await.unwrap();
        assert!(memory.is_active(&ChannelKey::Hardware));
        relay.deactivate(&ChannelKey::Hardware).await.unwrap();
        assert!(!memory.is_active(&ChannelKey::Hardware));
    }
}
