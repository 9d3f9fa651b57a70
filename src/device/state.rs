use tokio::time::Instant;

use crate::device::types::Telemetry;

/// When a cached value was observed. Restored values rank below every real observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Freshness {
    Restored,
    Observed(Instant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fresh<T> {
    pub value: T,
    pub freshness: Freshness,
}

/// Most recent value of one field. Older observations never replace newer ones; the value
/// itself plays no part in the decision.
#[derive(Debug, Clone, Copy)]
pub struct FreshValue<T> {
    latest: Option<Fresh<T>>,
}

impl<T: Copy + PartialEq> FreshValue<T> {
    pub fn new() -> Self {
        FreshValue { latest: None }
    }

    pub fn get(&self) -> Option<T> {
        self.latest.map(|fresh| fresh.value)
    }

    pub fn freshness(&self) -> Option<Freshness> {
        self.latest.map(|fresh| fresh.freshness)
    }

    /// Returns true if `value` was stored.
    pub fn offer(&mut self, value: T, freshness: Freshness) -> bool {
        if let Some(latest) = &self.latest {
            if freshness < latest.freshness {
                return false;
            }
        }

        self.latest = Some(Fresh { value, freshness });
        true
    }
}

impl<T: Copy + PartialEq> Default for FreshValue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// What changed after offering new telemetry to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accepted {
    pub position: Option<u8>,
    pub battery: Option<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryCache {
    pub position: FreshValue<u8>,
    pub battery: FreshValue<u8>,
}

impl TelemetryCache {
    pub fn offer(&mut self, telemetry: Telemetry, freshness: Freshness) -> Accepted {
        let mut accepted = Accepted::default();

        if let Some(position) = telemetry.position {
            if self.position.offer(position, freshness) {
                accepted.position = Some(position);
            }
        }
        if let Some(battery) = telemetry.battery {
            if self.battery.offer(battery, freshness) {
                accepted.battery = Some(battery);
            }
        }

        accepted
    }

    /// Seeds fields that have never been observed with last known values from the host.
    pub fn restore(&mut self, telemetry: Telemetry) -> Accepted {
        let mut missing = Telemetry::default();
        if self.position.get().is_none() {
            missing.position = telemetry.position;
        }
        if self.battery.get().is_none() {
            missing.battery = telemetry.battery;
        }
        self.offer(missing, Freshness::Restored)
    }

    pub fn snapshot(&self) -> Telemetry {
        Telemetry {
            position: self.position.get(),
            battery: self.battery.get(),
        }
    }
}
