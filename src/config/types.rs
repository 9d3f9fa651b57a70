use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use uuid::Uuid;

use crate::device::connection::ConnectionSettings;
use crate::device::constants::{
    BATTERY_LEVEL_CHARACTERISTIC, COMPANY_ID, CONNECT_BACKOFF, CONNECT_TIMEOUTS, DEVICE_NAME_PREFIX, INIT_TIMEOUT, IO_DEADLINE,
    MAX_CONNECT_ATTEMPTS, POLL_INTERVAL, RECONNECT_COOLDOWN, RX_CHARACTERISTIC, TX_CHARACTERISTIC,
};
use crate::device::discovery::{Discovery, DiscoveryMode};
use crate::device::session::SessionConfig;
use crate::device::types::DeviceAddress;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Address of the shade this instance drives.
    pub address: Option<String>,
    pub name: Option<String>,
    /// Characteristic position reports are read from / notified on.
    pub rx_uuid: String,
    /// Characteristic commands are written to.
    pub tx_uuid: String,
    /// Battery Level characteristic read after connecting; `null` to rely on advertisements only.
    pub battery_uuid: Option<String>,
    pub company_id: u16,
    pub name_prefix: String,
    pub discovery_mode: DiscoveryMode,
    pub connect_timeouts_ms: Vec<u64>,
    pub connect_backoff_ms: Vec<u64>,
    pub max_attempts: usize,
    pub reconnect_cooldown_ms: u64,
    pub io_timeout_ms: u64,
    pub poll_interval_secs: u64,
    pub init_timeout_secs: u64,
    pub strict_checksum: bool,
    pub connect_on_pairing_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: None,
            name: None,
            rx_uuid: RX_CHARACTERISTIC.to_string(),
            tx_uuid: TX_CHARACTERISTIC.to_string(),
            battery_uuid: Some(BATTERY_LEVEL_CHARACTERISTIC.to_string()),
            company_id: COMPANY_ID,
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
            discovery_mode: DiscoveryMode::Any,
            connect_timeouts_ms: CONNECT_TIMEOUTS.to_vec(),
            connect_backoff_ms: CONNECT_BACKOFF.to_vec(),
            max_attempts: MAX_CONNECT_ATTEMPTS,
            reconnect_cooldown_ms: RECONNECT_COOLDOWN,
            io_timeout_ms: IO_DEADLINE,
            poll_interval_secs: POLL_INTERVAL,
            init_timeout_secs: INIT_TIMEOUT,
            strict_checksum: false,
            connect_on_pairing_mode: false,
        }
    }
}

fn millis(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|ms| Duration::from_millis(*ms)).collect()
}

impl Config {
    pub fn device_address(&self) -> Option<DeviceAddress> {
        self.address
            .as_deref()
            .filter(|address| !address.trim().is_empty())
            .map(DeviceAddress::new)
    }

    pub fn discovery(&self) -> Discovery {
        Discovery {
            mode: self.discovery_mode,
            company_id: self.company_id,
            name_prefix: self.name_prefix.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue { field: "maxAttempts", reason: "must be at least 1".to_string() });
        }
        if self.connect_timeouts_ms.is_empty() || self.connect_timeouts_ms.contains(&0) {
            return Err(ConfigError::InvalidValue {
                field: "connectTimeoutsMs",
                reason: "needs at least one timeout and every timeout must be above 0".to_string(),
            });
        }
        if self.io_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue { field: "ioTimeoutMs", reason: "must be above 0".to_string() });
        }

        let battery_characteristic = self.battery_uuid
            .as_deref()
            .filter(|uuid| !uuid.trim().is_empty())
            .map(Uuid::parse_str)
            .transpose()?;

        Ok(SessionConfig {
            command_characteristic: Uuid::parse_str(&self.tx_uuid)?,
            company_id: self.company_id,
            connection: ConnectionSettings {
                connect_timeouts: millis(&self.connect_timeouts_ms),
                connect_backoff: millis(&self.connect_backoff_ms),
                max_attempts: self.max_attempts,
                reconnect_cooldown: Duration::from_millis(self.reconnect_cooldown_ms),
                notify_characteristic: Uuid::parse_str(&self.rx_uuid)?,
                battery_characteristic,
            },
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            strict_checksum: self.strict_checksum,
            connect_on_pairing_mode: self.connect_on_pairing_mode,
        })
    }
}
