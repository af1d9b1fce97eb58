// ── Traffic delta cache ──
//
// The enforcement layer reports cumulative per-IP byte counters. The
// countdown keeps the last reading per device to turn them into deltas.

use dashmap::DashMap;

use crate::enforcer::TrafficCounters;
use crate::model::MacAddress;

/// Bytes moved since the previous reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub up: u64,
    pub down: u64,
}

impl TrafficDelta {
    pub fn total(&self) -> u64 {
        self.up.saturating_add(self.down)
    }
}

/// Last seen counters per device. Process-local; rebuilt from scratch
/// after a restart.
#[derive(Debug, Default)]
pub struct TrafficCache {
    last: DashMap<MacAddress, TrafficCounters>,
}

impl TrafficCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new reading and return the delta from the previous one.
    ///
    /// The first reading for a device (after a restart, a roam, or an
    /// expiry) only sets the baseline and yields no delta. A counter that
    /// went down was reset (interface flap, rule reload), so the raw value
    /// is the delta.
    pub fn observe(&self, mac: &MacAddress, current: TrafficCounters) -> TrafficDelta {
        let previous = self.last.insert(mac.clone(), current);
        let Some(previous) = previous else {
            return TrafficDelta::default();
        };
        TrafficDelta {
            up: counter_delta(previous.bytes_up, current.bytes_up),
            down: counter_delta(previous.bytes_down, current.bytes_down),
        }
    }

    pub fn forget(&self, mac: &MacAddress) {
        self.last.remove(mac);
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.last.contains_key(mac)
    }
}

fn counter_delta(previous: u64, current: u64) -> u64 {
    if current < previous {
        current
    } else {
        current - previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(up: u64, down: u64) -> TrafficCounters {
        TrafficCounters {
            bytes_up: up,
            bytes_down: down,
        }
    }

    #[test]
    fn deltas_follow_counters() {
        let cache = TrafficCache::new();
        let mac = MacAddress::new("aa:bb:cc:dd:ee:01");
        cache.observe(&mac, counters(100, 1000));
        let delta = cache.observe(&mac, counters(150, 4000));
        assert_eq!(delta, TrafficDelta { up: 50, down: 3000 });
    }

    #[test]
    fn first_reading_only_sets_baseline() {
        let cache = TrafficCache::new();
        let mac = MacAddress::new("aa:bb:cc:dd:ee:01");
        assert_eq!(cache.observe(&mac, counters(7_000_000, 90_000_000)).total(), 0);
        assert!(cache.contains(&mac));
        assert_eq!(cache.observe(&mac, counters(7_000_010, 90_000_020)).total(), 30);
    }

    #[test]
    fn decrease_is_treated_as_reset() {
        let cache = TrafficCache::new();
        let mac = MacAddress::new("aa:bb:cc:dd:ee:01");
        cache.observe(&mac, counters(5000, 9000));
        let delta = cache.observe(&mac, counters(40, 9100));
        assert_eq!(delta, TrafficDelta { up: 40, down: 100 });
    }

    #[test]
    fn forget_restarts_baseline() {
        let cache = TrafficCache::new();
        let mac = MacAddress::new("aa:bb:cc:dd:ee:01");
        cache.observe(&mac, counters(10, 10));
        cache.forget(&mac);
        assert!(!cache.contains(&mac));
        assert_eq!(cache.observe(&mac, counters(30, 30)).total(), 0);
        assert_eq!(cache.observe(&mac, counters(35, 40)).total(), 15);
    }
}
