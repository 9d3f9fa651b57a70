use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use futures::StreamExt;
use futures::channel::mpsc::UnboundedSender;
use futures::stream::BoxStream;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::backend::{BleCentral, BleLink, RawNotification};
use crate::device::constants::{
    make_battery_uuid, make_rx_uuid, BATTERY_MAX, CONNECT_BACKOFF, CONNECT_TIMEOUTS, IO_DEADLINE,
    MAX_CONNECT_ATTEMPTS, RECONNECT_COOLDOWN,
};
use crate::device::types::{ConnectionState, DeviceAddress, GattNotification, SessionEvent};
use crate::error::ConnectionError;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Timeout of each connect attempt; attempts past the end reuse the last entry.
    pub connect_timeouts: Vec<Duration>,
    /// Delay before each connect attempt; attempts past the end reuse the last entry.
    pub connect_backoff: Vec<Duration>,
    pub max_attempts: usize,
    pub reconnect_cooldown: Duration,
    /// Characteristic subscribed to after connecting.
    pub notify_characteristic: Uuid,
    /// Battery Level characteristic read once after connecting, if the shade has one.
    pub battery_characteristic: Option<Uuid>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            connect_timeouts: CONNECT_TIMEOUTS.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            connect_backoff: CONNECT_BACKOFF.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            max_attempts: MAX_CONNECT_ATTEMPTS,
            reconnect_cooldown: Duration::from_millis(RECONNECT_COOLDOWN),
            notify_characteristic: make_rx_uuid(),
            battery_characteristic: Some(make_battery_uuid()),
        }
    }
}

fn schedule_entry(schedule: &[Duration], attempt: usize) -> Duration {
    schedule
        .get(attempt)
        .or(schedule.last())
        .copied()
        .unwrap_or(Duration::ZERO)
}

impl ConnectionSettings {
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    pub fn timeout_for(&self, attempt: usize) -> Duration {
        schedule_entry(&self.connect_timeouts, attempt)
    }

    pub fn backoff_for(&self, attempt: usize) -> Duration {
        schedule_entry(&self.connect_backoff, attempt)
    }

    /// Upper bound for one `connect` call: every attempt with its backoff.
    pub fn retry_budget(&self) -> Duration {
        (0..self.attempts())
            .map(|attempt| self.timeout_for(attempt) + self.backoff_for(attempt))
            .sum()
    }
}

struct ActiveLink {
    link: Arc<dyn BleLink>,
    // cancels the notification pump of this link
    cancel: CancellationToken,
}

/// Owns the BLE link to one shade.
///
/// All state transitions go through here. `connect` is serialized: while an attempt is in
/// flight, further `connect` calls return [`ConnectionError::AlreadyInProgress`] at once.
///
/// Nothing here calls observers. Availability changes, notifications and connect-time reads are
/// queued as [`SessionEvent`]s for the session's dispatch task.
pub struct ConnectionManager {
    address: DeviceAddress,
    central: Arc<dyn BleCentral>,
    settings: ConnectionSettings,
    events: UnboundedSender<SessionEvent>,
    state: Mutex<ConnectionState>,
    link: Mutex<Option<ActiveLink>>,
    connect_guard: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

fn notification_pump(
    cancel: CancellationToken,
    address: DeviceAddress,
    mut stream: BoxStream<'static, RawNotification>,
    sender: UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                next = stream.next() => match next {
                    Some((uuid, value)) => {
                        debug!("Notification from {} on {}: {:02x?}", address, uuid, value);
                        let notification = GattNotification { uuid, value, received_at: Instant::now() };
                        if sender.unbounded_send(SessionEvent::Notification(notification)).is_err() {
                            break 'mainloop;
                        }
                    },
                    None => {
                        debug!("Notification stream of {} ended", address);
                        break 'mainloop;
                    },
                },
            }
        }
    })
}

impl ConnectionManager {
    pub fn new(
        address: DeviceAddress,
        central: Arc<dyn BleCentral>,
        settings: ConnectionSettings,
        events: UnboundedSender<SessionEvent>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(ConnectionManager {
            address,
            central,
            settings,
            events,
            state: Mutex::new(ConnectionState::Disconnected),
            link: Mutex::new(None),
            connect_guard: tokio::sync::Mutex::new(()),
            shutdown,
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != new_state {
            debug!("{}: {} -> {}", self.address, *state, new_state);
            *state = new_state;
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn emit(&self, event: SessionEvent) {
        // fails only once the session's dispatch task is gone
        let _ = self.events.unbounded_send(event);
    }

    /// Connects with retries. Queues one [`SessionEvent::Unavailable`] if all attempts fail.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_shut_down() {
            return Err(ConnectionError::ShutDown);
        }

        let _guard = match self.connect_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Connect to {} already in progress", self.address);
                return Err(ConnectionError::AlreadyInProgress);
            },
        };

        if self.live_link().await.is_some() {
            debug!("Already connected to {}", self.address);
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let budget = self.settings.retry_budget();

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err(ConnectionError::ShutDown),
            result = timeout(budget, self.attempt_loop()) => match result {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout { attempt: self.settings.attempts(), after: budget }),
            },
        };

        match result {
            Ok(link) if self.is_shut_down() => {
                self.set_state(ConnectionState::Disconnected);
                if let Err(err) = link.disconnect().await {
                    warn!("Error disconnecting {} after shutdown: {}", self.address, err);
                }
                Err(ConnectionError::ShutDown)
            },
            Ok(link) => {
                self.install(link).await;
                self.set_state(ConnectionState::Connected);
                info!("Connected to {}", self.address);
                self.emit(SessionEvent::Connected);
                Ok(())
            },
            Err(ConnectionError::ShutDown) => {
                self.set_state(ConnectionState::Disconnected);
                Err(ConnectionError::ShutDown)
            },
            Err(err) => {
                warn!("Giving up connecting to {}: {}", self.address, err);
                self.set_state(ConnectionState::Disconnected);
                self.emit(SessionEvent::Unavailable);
                Err(err)
            },
        }
    }

    async fn attempt_loop(&self) -> Result<Arc<dyn BleLink>, ConnectionError> {
        let attempts = self.settings.attempts();
        let mut last_error = ConnectionError::NoDeviceHandle;

        for attempt in 0..attempts {
            let backoff = self.settings.backoff_for(attempt);
            if !backoff.is_zero() {
                sleep(backoff).await;
            }

            let deadline = self.settings.timeout_for(attempt);
            debug!("Connect attempt {}/{} to {} (timeout {:?})", attempt + 1, attempts, self.address, deadline);

            match self.try_connect(attempt + 1, deadline).await {
                Ok(link) => return Ok(link),
                Err(err) => {
                    warn!("Connect attempt {}/{} to {} failed: {}", attempt + 1, attempts, self.address, err);
                    last_error = err;
                },
            }
        }

        Err(last_error)
    }

    async fn try_connect(&self, attempt: usize, deadline: Duration) -> Result<Arc<dyn BleLink>, ConnectionError> {
        let expires = Instant::now() + deadline;
        let timed_out = || ConnectionError::Timeout { attempt, after: deadline };

        let link = timeout_at(expires, self.central.resolve(&self.address))
            .await
            .map_err(|_| timed_out())??
            .ok_or(ConnectionError::NoDeviceHandle)?;

        let err = match timeout_at(expires, link.connect()).await {
            Ok(Ok(())) => return Ok(link),
            Ok(Err(source)) => ConnectionError::Failed { source },
            Err(_) => timed_out(),
        };

        // the platform may hold a half-open connection after a failed attempt
        match timeout(Duration::from_millis(IO_DEADLINE), link.disconnect()).await {
            Ok(Ok(())) => {},
            Ok(Err(disconnect_err)) => debug!("Cleanup after failed attempt on {}: {}", self.address, disconnect_err),
            Err(_) => debug!("Cleanup after failed attempt on {} took too long", self.address),
        }
        Err(err)
    }

    async fn read_battery(&self, link: &dyn BleLink, characteristic: Uuid) {
        match timeout(Duration::from_millis(IO_DEADLINE), link.read(characteristic)).await {
            Ok(Ok(data)) => match data.first().copied().filter(|level| *level <= BATTERY_MAX) {
                Some(level) => {
                    debug!("Battery level of {}: {}%", self.address, level);
                    self.emit(SessionEvent::BatteryRead { level, read_at: Instant::now() });
                },
                None => debug!("Ignoring battery level {:02x?} from {}", data, self.address),
            },
            Ok(Err(err)) => debug!("No battery level on {}: {}", self.address, err),
            Err(_) => warn!("Reading the battery level of {} took too long", self.address),
        }
    }

    async fn install(&self, link: Arc<dyn BleLink>) {
        let cancel = self.shutdown.child_token();
        let characteristic = self.settings.notify_characteristic;

        // The link is usable without notifications (GATT reads still work), so failures here
        // are not fatal.
        match link.subscribe(characteristic).await {
            Err(err) => warn!("Failed to subscribe to {} on {}: {}", characteristic, self.address, err),
            Ok(()) => match link.notifications().await {
                Ok(stream) => {
                    info!("Subscribed to {} on {}", characteristic, self.address);
                    notification_pump(cancel.clone(), self.address.clone(), stream, self.events.clone());
                },
                Err(err) => warn!("Failed to open notification stream of {}: {}", self.address, err),
            },
        }

        if let Some(battery) = self.settings.battery_characteristic {
            self.read_battery(link.as_ref(), battery).await;
        }

        let previous = self.lock_link().replace(ActiveLink { link, cancel });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    /// Waits until no connect attempt is in flight.
    pub async fn settled(&self) {
        drop(self.connect_guard.lock().await);
    }

    /// The current link, if the state is Connected and the transport agrees that it is.
    pub async fn live_link(&self) -> Option<Arc<dyn BleLink>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }

        let link = self.lock_link().as_ref().map(|active| active.link.clone())?;

        match link.is_connected().await {
            Ok(true) => Some(link),
            Ok(false) => {
                warn!("Connection to {} lost", self.address);
                self.mark_degraded();
                None
            },
            Err(err) => {
                warn!("Error checking connection state of {}: {}", self.address, err);
                self.mark_degraded();
                None
            },
        }
    }

    /// Marks the link as unusable after a failed read/write. The next operation reconnects;
    /// no disconnect is sent and no observers are called. The link's notification pump stops.
    pub fn mark_degraded(&self) {
        if let Some(active) = self.lock_link().as_ref() {
            active.cancel.cancel();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Drops the link. A no-op (apart from logging) if there is no link.
    pub async fn disconnect(&self) {
        let _guard = self.connect_guard.lock().await;
        self.release(true).await;
    }

    async fn release(&self, notify: bool) {
        let active = self.lock_link().take();
        self.set_state(ConnectionState::Disconnected);

        match active {
            None => {
                debug!("{} is already disconnected", self.address);
            },
            Some(active) => {
                active.cancel.cancel();
                if let Err(err) = active.link.disconnect().await {
                    warn!("Error disconnecting {}: {}", self.address, err);
                }
                info!("Disconnected from {}", self.address);

                if notify {
                    self.emit(SessionEvent::Unavailable);
                }
            },
        }
    }

    /// Called when the BLE stack reports that the peer dropped the link. Cheap and
    /// non-blocking: the reconnect runs on its own task after the cooldown.
    pub fn handle_peer_disconnect(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }

        let active = self.lock_link().take();
        let Some(active) = active else {
            debug!("Ignoring disconnect of {}: no active link", self.address);
            return;
        };

        active.cancel.cancel();
        self.set_state(ConnectionState::Disconnected);
        info!("{} dropped the connection", self.address);
        self.emit(SessionEvent::Unavailable);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let cooldown = self.settings.reconnect_cooldown;

        spawn(async move {
            tokio::select! {
                _ = this.shutdown.cancelled() => {},
                _ = sleep(cooldown) => {
                    info!("Reconnecting to {}", this.address);
                    if let Err(err) = this.connect().await {
                        warn!("Reconnecting to {} failed: {}", this.address, err);
                    }
                },
            }
        });
    }

    /// Terminal. Cancels pending reconnects and in-flight connects, then drops the link.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down connection to {}", self.address);
            self.shutdown.cancel();
        }

        let _guard = self.connect_guard.lock().await;
        self.release(false).await;
    }
}
