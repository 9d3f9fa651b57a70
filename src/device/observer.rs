use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use log::error;

use crate::error::readable_panic_error;

pub trait PositionObserver: Send + Sync {
    /// Raw wire position: 0 = open, 100 = closed.
    fn on_position(&self, position: u8);
}

pub trait BatteryObserver: Send + Sync {
    fn on_battery(&self, level: u8);
}

pub trait AvailabilityObserver: Send + Sync {
    fn on_unavailable(&self);

    /// The shade is reachable again: it advertised or a connect succeeded after it was unavailable.
    fn on_available(&self) {}
}

impl<F: Fn(u8) + Send + Sync> PositionObserver for F {
    fn on_position(&self, position: u8) {
        self(position)
    }
}

/// Wrapper so that a closure can be registered as a battery observer; a bare `Fn(u8)` already
/// means "position".
pub struct OnBattery<F>(pub F);

impl<F: Fn(u8) + Send + Sync> BatteryObserver for OnBattery<F> {
    fn on_battery(&self, level: u8) {
        (self.0)(level)
    }
}

pub struct OnUnavailable<F>(pub F);

impl<F: Fn() + Send + Sync> AvailabilityObserver for OnUnavailable<F> {
    fn on_unavailable(&self) {
        (self.0)()
    }
}

pub struct OnAvailable<F>(pub F);

impl<F: Fn() + Send + Sync> AvailabilityObserver for OnAvailable<F> {
    fn on_unavailable(&self) {}

    fn on_available(&self) {
        (self.0)()
    }
}

/// Observers registered on a session. Called in registration order; a panicking observer is
/// logged and does not stop the others.
#[derive(Default)]
pub struct ObserverRegistry {
    position: RwLock<Vec<Arc<dyn PositionObserver>>>,
    battery: RwLock<Vec<Arc<dyn BatteryObserver>>>,
    unavailable: RwLock<Vec<Arc<dyn AvailabilityObserver>>>,
}

fn call_isolated<F: FnOnce()>(kind: &str, f: F) {
    if let Err(err) = catch_unwind(AssertUnwindSafe(f)) {
        error!("{} observer failed: {}", kind, readable_panic_error(&err));
    }
}

fn snapshot<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>) -> Vec<Arc<T>> {
    list.read().unwrap_or_else(PoisonError::into_inner).clone()
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_position(&self, observer: Arc<dyn PositionObserver>) {
        self.position.write().unwrap_or_else(PoisonError::into_inner).push(observer);
    }

    pub fn add_battery(&self, observer: Arc<dyn BatteryObserver>) {
        self.battery.write().unwrap_or_else(PoisonError::into_inner).push(observer);
    }

    pub fn add_unavailable(&self, observer: Arc<dyn AvailabilityObserver>) {
        self.unavailable.write().unwrap_or_else(PoisonError::into_inner).push(observer);
    }

    // Observers are called on a copy of the list so they may register further observers.
    pub fn notify_position(&self, position: u8) {
        for observer in snapshot(&self.position) {
            call_isolated("Position", || observer.on_position(position));
        }
    }

    pub fn notify_battery(&self, level: u8) {
        for observer in snapshot(&self.battery) {
            call_isolated("Battery", || observer.on_battery(level));
        }
    }

    pub fn notify_unavailable(&self) {
        for observer in snapshot(&self.unavailable) {
            call_isolated("Availability", || observer.on_unavailable());
        }
    }

    pub fn notify_available(&self) {
        for observer in snapshot(&self.unavailable) {
            call_isolated("Availability", || observer.on_available());
        }
    }
}
