#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use tokio::sync::Notify;
use uuid::Uuid;

use ryse_shade::device::backend::{BleCentral, BleLink, RawNotification};
use ryse_shade::device::constants::{make_battery_uuid, make_rx_uuid, COMPANY_ID};
use ryse_shade::device::observer::{AvailabilityObserver, OnBattery};
use ryse_shade::device::types::{Advertisement, DeviceAddress};
use ryse_shade::error::DeviceError;

pub const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

pub fn address() -> DeviceAddress {
    DeviceAddress::new(ADDRESS)
}

fn transport_error() -> DeviceError {
    DeviceError::Btle { source: btleplug::Error::NotConnected }
}

/// How the next `connect` call of a [`FakeLink`] behaves.
#[derive(Clone)]
pub enum ConnectBehavior {
    Succeed,
    Fail,
    /// Never completes.
    Hang,
    /// Succeeds once the gate is notified.
    WaitFor(Arc<Notify>),
}

/// In-memory shade. Connects succeed unless told otherwise.
#[derive(Default)]
pub struct FakeLink {
    behaviors: Mutex<VecDeque<ConnectBehavior>>,
    connected: AtomicBool,
    fail_writes: AtomicBool,
    // characteristics the shade has, with the value a read returns
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    notifier: Mutex<Option<UnboundedSender<RawNotification>>>,
    pub connect_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
    pub writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    pub subscriptions: Mutex<Vec<Uuid>>,
}

impl FakeLink {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeLink::default())
    }

    pub fn with_behaviors(behaviors: Vec<ConnectBehavior>) -> Arc<Self> {
        let link = FakeLink::default();
        *link.behaviors.lock().unwrap() = behaviors.into();
        Arc::new(link)
    }

    pub fn push_behavior(&self, behavior: ConnectBehavior) {
        self.behaviors.lock().unwrap().push_back(behavior);
    }

    pub fn connects(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().iter().map(|(_, data)| data.clone()).collect()
    }

    /// Value of the position characteristic.
    pub fn set_read_value(&self, value: &[u8]) {
        self.values.lock().unwrap().insert(make_rx_uuid(), value.to_vec());
    }

    /// Gives the shade a Battery Level characteristic.
    pub fn set_battery_value(&self, level: u8) {
        self.values.lock().unwrap().insert(make_battery_uuid(), vec![level]);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The shade drops the link on its side.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Whether anyone was still listening for notifications.
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) -> bool {
        let notifier = self.notifier.lock().unwrap();
        notifier
            .as_ref()
            .expect("nothing subscribed")
            .unbounded_send((characteristic, value.to_vec()))
            .is_ok()
    }
}

#[async_trait]
impl BleLink for FakeLink {
    async fn connect(&self) -> Result<(), DeviceError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behaviors.lock().unwrap().pop_front().unwrap_or(ConnectBehavior::Succeed);

        match behavior {
            ConnectBehavior::Succeed => {},
            ConnectBehavior::Fail => return Err(transport_error()),
            ConnectBehavior::Hang => std::future::pending::<()>().await,
            ConnectBehavior::WaitFor(gate) => gate.notified().await,
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool, DeviceError> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), DeviceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(transport_error());
        }
        self.writes.lock().unwrap().push((characteristic, data.to_vec()));
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, DeviceError> {
        let values = self.values.lock().unwrap();
        match values.get(&characteristic) {
            Some(value) => Ok(value.clone()),
            None if characteristic == make_rx_uuid() => Ok(Vec::new()),
            None => Err(DeviceError::MissingCharacteristic { uuid: characteristic }),
        }
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), DeviceError> {
        self.subscriptions.lock().unwrap().push(characteristic);
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, RawNotification>, DeviceError> {
        let (sender, receiver) = unbounded();
        *self.notifier.lock().unwrap() = Some(sender);
        Ok(receiver.boxed())
    }
}

/// Resolves [`ADDRESS`] to one shared [`FakeLink`].
pub struct FakeCentral {
    pub link: Arc<FakeLink>,
    resolvable: AtomicBool,
    pub resolve_calls: AtomicUsize,
}

impl FakeCentral {
    pub fn new(link: Arc<FakeLink>) -> Arc<Self> {
        Arc::new(FakeCentral { link, resolvable: AtomicBool::new(true), resolve_calls: AtomicUsize::new(0) })
    }

    /// A central that never finds the shade.
    pub fn empty() -> Arc<Self> {
        let central = FakeCentral::new(FakeLink::new());
        central.resolvable.store(false, Ordering::SeqCst);
        central
    }

    pub fn resolves(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleCentral for FakeCentral {
    async fn resolve(&self, address: &DeviceAddress) -> Result<Option<Arc<dyn BleLink>>, DeviceError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if !self.resolvable.load(Ordering::SeqCst) || !address.matches(ADDRESS) {
            return Ok(None);
        }
        let link: Arc<dyn BleLink> = self.link.clone();
        Ok(Some(link))
    }
}

/// Counts and records what observers were handed.
#[derive(Default)]
pub struct Recorder {
    pub positions: Mutex<Vec<u8>>,
    pub batteries: Mutex<Vec<u8>>,
    pub unavailable: AtomicUsize,
    pub available: AtomicUsize,
}

impl AvailabilityObserver for Recorder {
    fn on_unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::SeqCst);
    }

    fn on_available(&self) {
        self.available.fetch_add(1, Ordering::SeqCst);
    }
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Recorder::default())
    }

    pub fn position_observer(self: &Arc<Self>) -> Arc<impl Fn(u8) + Send + Sync> {
        let this = self.clone();
        Arc::new(move |position: u8| this.positions.lock().unwrap().push(position))
    }

    pub fn battery_observer(self: &Arc<Self>) -> Arc<OnBattery<impl Fn(u8) + Send + Sync>> {
        let this = self.clone();
        Arc::new(OnBattery(move |level: u8| this.batteries.lock().unwrap().push(level)))
    }

    pub fn unavailable_observer(self: &Arc<Self>) -> Arc<Self> {
        self.clone()
    }

    pub fn positions(&self) -> Vec<u8> {
        self.positions.lock().unwrap().clone()
    }

    pub fn batteries(&self) -> Vec<u8> {
        self.batteries.lock().unwrap().clone()
    }

    pub fn unavailable_count(&self) -> usize {
        self.unavailable.load(Ordering::SeqCst)
    }

    pub fn available_count(&self) -> usize {
        self.available.load(Ordering::SeqCst)
    }
}

pub fn advertisement(payload: &[u8]) -> Advertisement {
    let mut manufacturer_data = HashMap::new();
    manufacturer_data.insert(COMPANY_ID, payload.to_vec());
    Advertisement::new(address(), Some("RZSS-Test".to_string()), manufacturer_data)
}

/// Lets spawned tasks (observer dispatch, notification pump) run.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
