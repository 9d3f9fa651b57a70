//! The seam between the shade session and whatever BLE stack is underneath.
//!
//! [`crate::device::btle`] implements it on top of btleplug; tests plug in an in-memory fake.

use std::sync::Arc;
use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::device::types::DeviceAddress;
use crate::error::DeviceError;

/// Value pushed by the peer on a subscribed characteristic.
pub type RawNotification = (Uuid, Vec<u8>);

#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Looks up a connectable handle for `address`. `Ok(None)` means the platform does not
    /// currently know the device (not advertising / out of range).
    async fn resolve(&self, address: &DeviceAddress) -> Result<Option<Arc<dyn BleLink>>, DeviceError>;
}

#[async_trait]
pub trait BleLink: Send + Sync {
    async fn connect(&self) -> Result<(), DeviceError>;

    async fn disconnect(&self) -> Result<(), DeviceError>;

    async fn is_connected(&self) -> Result<bool, DeviceError>;

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), DeviceError>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, DeviceError>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), DeviceError>;

    /// Stream of notifications for every subscribed characteristic. Ends when the link drops.
    async fn notifications(&self) -> Result<BoxStream<'static, RawNotification>, DeviceError>;
}
