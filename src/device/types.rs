use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;
use uuid::Uuid;

use crate::device::state::Accepted;

/// Stable identifier of one physical shade (a MAC address on most platforms).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: &str) -> Self {
        DeviceAddress(address.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Addresses compare case-insensitively; platforms disagree on the case of hex digits.
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DeviceAddress::new(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };

        write!(f, "{}", result)
    }
}

/// One received advertisement. Only lives as long as it takes to parse it.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub rssi: Option<i16>,
    pub observed_at: Instant,
}

impl Advertisement {
    pub fn new(address: DeviceAddress, name: Option<String>, manufacturer_data: HashMap<u16, Vec<u8>>) -> Self {
        Advertisement {
            address,
            name,
            manufacturer_data,
            rssi: None,
            observed_at: Instant::now(),
        }
    }

    pub fn observed_at(mut self, observed_at: Instant) -> Self {
        self.observed_at = observed_at;
        self
    }
}

/// Position / battery extracted from a single source. Either field may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub position: Option<u8>, // raw wire value: 0 = open, 100 = closed
    pub battery: Option<u8>,  // percent
}

impl Telemetry {
    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.battery.is_none()
    }
}

/// A value pushed by the shade on a subscribed characteristic.
#[derive(Debug, Clone)]
pub struct GattNotification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
    pub received_at: Instant,
}

/// Everything the session's dispatch task acts on, queued in the order it happened.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Pushed by the shade on the subscribed characteristic.
    Notification(GattNotification),
    /// Battery Level characteristic, read right after connecting.
    BatteryRead { level: u8, read_at: Instant },
    Connected,
    /// A connect gave up or an established link went away.
    Unavailable,
    /// An advertisement of the shade arrived.
    Seen,
    /// Telemetry that made it into the cache and still has to reach the observers.
    Accepted(Accepted),
}
