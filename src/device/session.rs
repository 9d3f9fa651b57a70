use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::advertisement::{is_pairing_mode, manufacturer_payload, parse_payload};
use crate::device::backend::{BleCentral, BleLink};
use crate::device::connection::{ConnectionManager, ConnectionSettings};
use crate::device::constants::{
    make_tx_uuid, BATTERY_MAX, COMPANY_ID, IO_DEADLINE, POSITION_CLOSED, POSITION_MAX, POSITION_OPEN,
};
use crate::device::observer::{AvailabilityObserver, BatteryObserver, ObserverRegistry, PositionObserver};
use crate::device::protocol::{
    decode_notification, decode_notification_strict, encode_get_position, encode_set_position,
    is_frame, is_user_target_report, open_percentage, raw_from_open_percentage, Notification,
};
use crate::device::state::{Accepted, Freshness, TelemetryCache};
use crate::device::types::{Advertisement, ConnectionState, DeviceAddress, GattNotification, SessionEvent, Telemetry};
use crate::error::{ConnectionError, SessionError};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Characteristic commands are written to.
    pub command_characteristic: Uuid,
    pub company_id: u16,
    pub connection: ConnectionSettings,
    /// Deadline for a single GATT read or write.
    pub io_timeout: Duration,
    /// Only accept position reports that end in a valid checksum.
    pub strict_checksum: bool,
    /// Connect as soon as the shade advertises that it is in pairing mode.
    pub connect_on_pairing_mode: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            command_characteristic: make_tx_uuid(),
            company_id: COMPANY_ID,
            connection: ConnectionSettings::default(),
            io_timeout: Duration::from_millis(IO_DEADLINE),
            strict_checksum: false,
            connect_on_pairing_mode: false,
        }
    }
}

struct SessionInner {
    address: DeviceAddress,
    config: SessionConfig,
    connection: Arc<ConnectionManager>,
    observers: Arc<ObserverRegistry>,
    telemetry: Mutex<TelemetryCache>,
    events: UnboundedSender<SessionEvent>,
    // only written by the dispatch task
    available: AtomicBool,
    ready: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl SessionInner {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Notification<'a> {
        if self.config.strict_checksum {
            decode_notification_strict(bytes)
        } else {
            decode_notification(bytes)
        }
    }

    fn offer(&self, telemetry: Telemetry, freshness: Freshness) -> Accepted {
        let accepted = self.telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offer(telemetry, freshness);

        if accepted.position.is_some() {
            self.ready.send_replace(true);
        }
        accepted
    }

    fn queue_dispatch(&self, accepted: Accepted) {
        if accepted == Accepted::default() {
            return;
        }
        self.emit(SessionEvent::Accepted(accepted));
    }

    fn emit(&self, event: SessionEvent) {
        // fails only once the session is shut down
        let _ = self.events.unbounded_send(event);
    }

    fn dispatch_now(&self, accepted: Accepted) {
        if let Some(position) = accepted.position {
            self.observers.notify_position(position);
        }
        if let Some(battery) = accepted.battery {
            self.observers.notify_battery(battery);
        }
    }

    fn apply_notification(&self, notification: &GattNotification) -> Accepted {
        if notification.uuid != self.config.connection.notify_characteristic {
            debug!("Ignoring notification on unexpected characteristic {}", notification.uuid);
            return Accepted::default();
        }

        match self.decode(&notification.value) {
            Notification::UserTarget => {
                debug!("Ignoring user target report from {}", self.address);
                Accepted::default()
            },
            Notification::Position(position) if position <= POSITION_MAX => {
                debug!("Position report from {}: {}", self.address, position);
                let telemetry = Telemetry { position: Some(position), battery: None };
                self.offer(telemetry, Freshness::Observed(notification.received_at))
            },
            Notification::Position(position) => {
                debug!("Ignoring out of range position {} from {}", position, self.address);
                Accepted::default()
            },
            Notification::Rejected(bytes) => {
                debug!("Ignoring report with bad checksum from {}: {:02x?}", self.address, bytes);
                Accepted::default()
            },
            Notification::Unclassified(bytes) => {
                debug!("Ignoring unclassified notification from {}: {:02x?}", self.address, bytes);
                Accepted::default()
            },
        }
    }

    fn mark_available(&self) {
        if !self.available.swap(true, Ordering::SeqCst) {
            info!("{} is online", self.address);
            self.observers.notify_available();
        }
    }

    fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Notification(notification) => {
                let accepted = self.apply_notification(&notification);
                self.dispatch_now(accepted);
            },
            SessionEvent::BatteryRead { level, read_at } => {
                let telemetry = Telemetry { position: None, battery: Some(level) };
                let accepted = self.offer(telemetry, Freshness::Observed(read_at));
                self.dispatch_now(accepted);
            },
            SessionEvent::Connected | SessionEvent::Seen => self.mark_available(),
            SessionEvent::Unavailable => {
                // reported every time, not only on the available -> unavailable edge
                self.available.store(false, Ordering::SeqCst);
                self.observers.notify_unavailable();
            },
            SessionEvent::Accepted(accepted) => self.dispatch_now(accepted),
        }
    }
}

async fn session_events(
    inner: Weak<SessionInner>,
    cancel: CancellationToken,
    mut events: UnboundedReceiver<SessionEvent>,
) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            Some(event) = events.next() => {
                let Some(inner) = inner.upgrade() else { break 'mainloop };
                inner.handle_event(event);
            },
            else => {
                break 'mainloop;
            },
        }
    }
}

/// Everything the host needs to drive one shade.
///
/// Telemetry arrives from two independent sources (advertisements and GATT) and is merged by
/// observation time: the most recently observed value wins. Observers (telemetry and
/// availability alike) are called on a task owned by the session, never on the caller's context.
///
/// Must be created inside a tokio runtime. Cloning is cheap; all clones share one session.
#[derive(Clone)]
pub struct ShadeSession {
    inner: Arc<SessionInner>,
}

impl ShadeSession {
    pub fn new(address: DeviceAddress, central: Arc<dyn BleCentral>, config: SessionConfig) -> Self {
        let shutdown = CancellationToken::new();
        let observers = Arc::new(ObserverRegistry::new());
        let (events_tx, events_rx) = unbounded();
        let (ready, _) = watch::channel(false);

        let connection = ConnectionManager::new(
            address.clone(),
            central,
            config.connection.clone(),
            events_tx.clone(),
            shutdown.clone(),
        );

        let inner = Arc::new(SessionInner {
            address,
            config,
            connection,
            observers,
            telemetry: Mutex::new(TelemetryCache::default()),
            events: events_tx,
            available: AtomicBool::new(false),
            ready,
            shutdown: shutdown.clone(),
        });

        spawn(session_events(Arc::downgrade(&inner), shutdown, events_rx));

        ShadeSession { inner }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.inner.address
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// False until the shade advertised or a connect succeeded, and again after it became
    /// unavailable. Follows the events the observers receive.
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    pub fn add_position_observer(&self, observer: Arc<dyn PositionObserver>) {
        self.inner.observers.add_position(observer);
    }

    pub fn add_battery_observer(&self, observer: Arc<dyn BatteryObserver>) {
        self.inner.observers.add_battery(observer);
    }

    /// The observer hears about both directions: `on_unavailable` when a connect gives up or the
    /// link goes away, `on_available` when the shade shows up again.
    pub fn add_unavailable_observer(&self, observer: Arc<dyn AvailabilityObserver>) {
        self.inner.observers.add_unavailable(observer);
    }

    /// Last known raw position (0 = open, 100 = closed).
    pub fn position(&self) -> Option<u8> {
        self.telemetry().position
    }

    /// Last known position as "percent open", the convention most hosts display.
    pub fn open_percentage(&self) -> Option<u8> {
        self.position().map(open_percentage)
    }

    pub fn battery_level(&self) -> Option<u8> {
        self.telemetry().battery
    }

    pub fn telemetry(&self) -> Telemetry {
        self.inner.telemetry.lock().unwrap_or_else(PoisonError::into_inner).snapshot()
    }

    /// Seeds the cache with the last values the host persisted. Anything actually observed,
    /// before or after, takes precedence.
    pub fn restore(&self, last_known: Telemetry) {
        let accepted = self.inner.telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .restore(last_known);

        if accepted.position.is_some() {
            self.inner.ready.send_replace(true);
        }
        self.inner.queue_dispatch(accepted);
    }

    /// Resolves to true once a position is known, false if `limit` passes first.
    pub async fn wait_ready(&self, limit: Duration) -> bool {
        let mut ready = self.inner.ready.subscribe();

        let wait = async {
            loop {
                if *ready.borrow_and_update() {
                    return true;
                }
                if ready.changed().await.is_err() {
                    return false;
                }
            }
        };

        timeout(limit, wait).await.unwrap_or(false)
    }

    /// Feeds one advertisement into the session. Never blocks and never needs a connection;
    /// observers and any follow-up connect run on other tasks.
    pub fn handle_advertisement(&self, advertisement: &Advertisement) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() || advertisement.address != inner.address {
            return;
        }

        inner.emit(SessionEvent::Seen);

        let Some(raw) = manufacturer_payload(&advertisement.manufacturer_data, inner.config.company_id) else {
            debug!("[ADV] {}: no manufacturer data for company {:#06x}", inner.address, inner.config.company_id);
            return;
        };
        debug!("[ADV] {}: {:02x?}", inner.address, raw);

        let mut pairing = false;
        let telemetry = match inner.decode(raw) {
            Notification::UserTarget => Telemetry::default(),
            Notification::Position(position) => Telemetry {
                position: Some(position).filter(|p| *p <= POSITION_MAX),
                battery: None,
            },
            Notification::Rejected(raw) => {
                debug!("[ADV] {}: dropping report with bad checksum {:02x?}", inner.address, raw);
                Telemetry::default()
            },
            Notification::Unclassified(raw) if is_frame(raw) => {
                debug!("[ADV] {}: ignoring frame {:02x?}", inner.address, raw);
                Telemetry::default()
            },
            Notification::Unclassified(raw) => {
                pairing = is_pairing_mode(raw);
                parse_payload(raw)
            },
        };

        let accepted = inner.offer(telemetry, Freshness::Observed(advertisement.observed_at));
        inner.queue_dispatch(accepted);

        if pairing && inner.config.connect_on_pairing_mode && inner.connection.state() == ConnectionState::Disconnected {
            info!("{} is in pairing mode, connecting", inner.address);
            let connection = inner.connection.clone();
            spawn(async move {
                if let Err(err) = connection.connect().await {
                    debug!("Pairing mode connect to {} failed: {}", connection.address(), err);
                }
            });
        }
    }

    /// Called when the BLE stack reports that the shade dropped the link.
    pub fn handle_peer_disconnect(&self) {
        self.inner.connection.handle_peer_disconnect();
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.inner.connection.connect().await
    }

    /// Alias of [`ShadeSession::connect`].
    pub async fn pair(&self) -> Result<(), ConnectionError> {
        self.connect().await
    }

    pub async fn disconnect(&self) {
        self.inner.connection.disconnect().await
    }

    /// Alias of [`ShadeSession::disconnect`].
    pub async fn unpair(&self) {
        self.disconnect().await
    }

    /// Ends the session for good: pending follow-up work is cancelled, the link released and
    /// every later operation fails with [`SessionError::ShutDown`].
    pub async fn shutdown(&self) {
        self.inner.connection.shutdown().await;
    }

    async fn ensure_link(&self) -> Result<Arc<dyn BleLink>, SessionError> {
        let connection = &self.inner.connection;
        if connection.is_shut_down() {
            return Err(SessionError::ShutDown);
        }

        if let Some(link) = connection.live_link().await {
            return Ok(link);
        }

        match connection.connect().await {
            Ok(()) => {},
            Err(ConnectionError::AlreadyInProgress) => connection.settled().await,
            Err(ConnectionError::ShutDown) => return Err(SessionError::ShutDown),
            Err(source) => return Err(SessionError::NotConnected { source }),
        }

        match connection.live_link().await {
            Some(link) => Ok(link),
            None if connection.is_shut_down() => Err(SessionError::ShutDown),
            None => Err(SessionError::NotConnected { source: ConnectionError::Dropped }),
        }
    }

    /// Writes raw bytes to the command characteristic, connecting first if needed.
    pub async fn write_command(&self, data: &[u8]) -> Result<(), SessionError> {
        let link = self.ensure_link().await?;
        let characteristic = self.inner.config.command_characteristic;
        let deadline = self.inner.config.io_timeout;

        match timeout(deadline, link.write(characteristic, data)).await {
            Ok(Ok(())) => {
                debug!("Sent {:02x?} to {}", data, self.inner.address);
                Ok(())
            },
            Ok(Err(source)) => {
                warn!("Failed to write to {}: {}", self.inner.address, source);
                self.inner.connection.mark_degraded();
                Err(SessionError::Transport { source })
            },
            Err(_) => {
                warn!("Writing to {} took too long", self.inner.address);
                self.inner.connection.mark_degraded();
                Err(SessionError::Timeout { operation: "write", after: deadline })
            },
        }
    }

    async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>, SessionError> {
        let link = self.ensure_link().await?;
        let deadline = self.inner.config.io_timeout;

        match timeout(deadline, link.read(characteristic)).await {
            Ok(Ok(data)) => {
                debug!("Read {:02x?} from {}", data, self.inner.address);
                Ok(data)
            },
            Ok(Err(source)) if source.is_missing_characteristic() => {
                debug!("{} has no characteristic {}", self.inner.address, characteristic);
                Err(SessionError::Transport { source })
            },
            Ok(Err(source)) => {
                warn!("Failed to read from {}: {}", self.inner.address, source);
                self.inner.connection.mark_degraded();
                Err(SessionError::Transport { source })
            },
            Err(_) => {
                warn!("Reading from {} took too long", self.inner.address);
                self.inner.connection.mark_degraded();
                Err(SessionError::Timeout { operation: "read", after: deadline })
            },
        }
    }

    /// Reads the position characteristic. "Report user target" frames yield `None`.
    pub async fn read_data(&self) -> Result<Option<Vec<u8>>, SessionError> {
        let data = self.read_characteristic(self.inner.config.connection.notify_characteristic).await?;
        if is_user_target_report(&data) {
            debug!("Dropping user target report read from {}", self.inner.address);
            return Ok(None);
        }
        Ok(Some(data))
    }

    /// Reads position and battery directly over GATT (`data[1]`, `data[2]`) and merges them
    /// into the cache.
    pub async fn poll(&self) -> Result<Telemetry, SessionError> {
        let data = self.read_characteristic(self.inner.config.connection.notify_characteristic).await?;
        let telemetry = parse_payload(&data);

        let accepted = self.inner.offer(telemetry, Freshness::Observed(Instant::now()));
        self.inner.queue_dispatch(accepted);
        Ok(telemetry)
    }

    pub async fn get_position(&self) -> Result<Option<u8>, SessionError> {
        Ok(self.poll().await?.position)
    }

    /// Reads the Battery Level characteristic, or polls the position characteristic when the
    /// shade does not have one.
    pub async fn get_battery(&self) -> Result<Option<u8>, SessionError> {
        if let Some(characteristic) = self.inner.config.connection.battery_characteristic {
            match self.read_characteristic(characteristic).await {
                Ok(data) => {
                    let level = data.first().copied().filter(|level| *level <= BATTERY_MAX);
                    let telemetry = Telemetry { position: None, battery: level };
                    let accepted = self.inner.offer(telemetry, Freshness::Observed(Instant::now()));
                    self.inner.queue_dispatch(accepted);
                    return Ok(level);
                },
                Err(SessionError::Transport { source }) if source.is_missing_characteristic() => {},
                Err(err) => return Err(err),
            }
        }

        Ok(self.poll().await?.battery)
    }

    /// Asks the shade to report its position. The answer arrives as a notification.
    pub async fn request_position(&self) -> Result<(), SessionError> {
        self.write_command(&encode_get_position()).await
    }

    /// Moves to a raw position (0 = open, 100 = closed).
    pub async fn set_position(&self, position: i32) -> Result<(), SessionError> {
        let packet = encode_set_position(position)?;
        self.write_command(&packet).await
    }

    /// Moves to a host facing "percent open" position.
    pub async fn set_open_percentage(&self, open_percentage: u8) -> Result<(), SessionError> {
        let raw = raw_from_open_percentage(open_percentage)?;
        self.set_position(raw.into()).await
    }

    pub async fn open(&self) -> Result<(), SessionError> {
        self.set_position(POSITION_OPEN.into()).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.set_position(POSITION_CLOSED.into()).await
    }

    /// Polls over GATT every `period` while position or battery are still unknown.
    /// Advertisements are the primary source, so once both are known this does nothing.
    pub fn spawn_poller(&self, period: Duration) -> JoinHandle<()> {
        let session = self.clone();
        let cancel = self.inner.shutdown.clone();

        spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    _ = ticker.tick() => {
                        let telemetry = session.telemetry();
                        if telemetry.position.is_some() && telemetry.battery.is_some() {
                            continue 'mainloop;
                        }
                        if let Err(err) = session.poll().await {
                            warn!("Polling {} failed: {}", session.address(), err);
                        }
                    },
                }
            }
        })
    }
}
