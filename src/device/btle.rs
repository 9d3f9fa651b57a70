use std::sync::Arc;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use futures::stream::BoxStream;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::backend::{BleCentral, BleLink, RawNotification};
use crate::device::session::ShadeSession;
use crate::device::types::{Advertisement, DeviceAddress};
use crate::error::DeviceError;

fn advertisement_from(properties: PeripheralProperties) -> Advertisement {
    let mut advertisement = Advertisement::new(
        DeviceAddress::new(&properties.address.to_string()),
        properties.local_name,
        properties.manufacturer_data,
    );
    advertisement.rssi = properties.rssi;
    advertisement
}

/// btleplug backed [`BleCentral`], using the first adapter of the system.
#[derive(Clone)]
pub struct BtleCentral {
    adapter: Adapter,
}

impl BtleCentral {
    pub async fn new() -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(DeviceError::NoAdapter)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        Ok(BtleCentral { adapter })
    }

    pub async fn start_scan(&self) -> Result<(), DeviceError> {
        // Shades do not advertise a service uuid, so the filter stays empty.
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    /// Scans for `duration` and returns the latest advertisement of every peripheral seen.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>, DeviceError> {
        self.start_scan().await?;
        sleep(duration).await;

        let mut advertisements = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            match peripheral.properties().await {
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                },
                Ok(None) => {
                    debug!("Peripheral {} has no properties", peripheral.address());
                },
                Ok(Some(properties)) => {
                    advertisements.push(advertisement_from(properties));
                },
            }
        }

        if let Err(err) = self.adapter.stop_scan().await {
            warn!("Failed to stop scanning: {}", err);
        }

        Ok(advertisements)
    }

    async fn peripheral_of(&self, id: &PeripheralId, address: &DeviceAddress) -> Option<Peripheral> {
        match self.adapter.peripheral(id).await {
            Ok(peripheral) if address.matches(&peripheral.address().to_string()) => Some(peripheral),
            Ok(_) => None,
            Err(err) => {
                debug!("Unknown peripheral {:?}: {}", id, err);
                None
            },
        }
    }

    /// Forwards advertisements and disconnects of the session's shade into the session until
    /// `cancel` fires. Scanning must have been started.
    pub fn watch(&self, session: ShadeSession, cancel: CancellationToken) -> JoinHandle<Result<(), DeviceError>> {
        let central = self.clone();

        spawn(async move {
            let mut events = central.adapter.events().await?;
            let address = session.address().clone();

            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    Some(event) = events.next() => match event {
                        CentralEvent::ManufacturerDataAdvertisement { id, manufacturer_data } => {
                            let Some(peripheral) = central.peripheral_of(&id, &address).await else { continue 'mainloop };
                            let name = match peripheral.properties().await {
                                Ok(Some(properties)) => properties.local_name,
                                _ => None,
                            };
                            session.handle_advertisement(&Advertisement::new(address.clone(), name, manufacturer_data));
                        },
                        CentralEvent::DeviceDisconnected(id) => {
                            if central.peripheral_of(&id, &address).await.is_some() {
                                session.handle_peer_disconnect();
                            }
                        },
                        _ => {},
                    },
                    else => {
                        break 'mainloop;
                    },
                }
            }

            Ok(())
        })
    }
}

#[async_trait]
impl BleCentral for BtleCentral {
    async fn resolve(&self, address: &DeviceAddress) -> Result<Option<Arc<dyn BleLink>>, DeviceError> {
        for peripheral in self.adapter.peripherals().await? {
            if address.matches(&peripheral.address().to_string()) {
                return Ok(Some(Arc::new(BtleLink { peripheral })));
            }
        }

        Ok(None)
    }
}

pub struct BtleLink {
    peripheral: Peripheral,
}

impl BtleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, DeviceError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or(DeviceError::MissingCharacteristic { uuid })
    }
}

#[async_trait]
impl BleLink for BtleLink {
    async fn connect(&self) -> Result<(), DeviceError> {
        if !self.peripheral.is_connected().await? {
            info!("Connecting to peripheral {}...", self.peripheral.address());
            self.peripheral.connect().await?;
        }

        info!("Connected; Discovering services...");
        self.peripheral.discover_services().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool, DeviceError> {
        Ok(self.peripheral.is_connected().await?)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), DeviceError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.write(&characteristic, data, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, DeviceError> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), DeviceError> {
        let characteristic = self.characteristic(characteristic)?;
        info!("Subscribing to characteristic {:?}", characteristic.uuid);
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, RawNotification>, DeviceError> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream.map(|notification| (notification.uuid, notification.value)).boxed())
    }
}
