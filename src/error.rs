use std::any::Any;
use std::io;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;
use btleplug;
use serde_json;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid characteristic uuid in config file: {source}")]
    InvalidUuid { #[from] source: uuid::Error },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Position must be between 0 and 100, got {position}")]
    PositionOutOfRange { position: i32 },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("The bluetooth characteristic {uuid} is not available")]
    MissingCharacteristic { uuid: Uuid },

    #[error("No bluetooth adapter is available")]
    NoAdapter,
}

impl DeviceError {
    pub fn is_missing_characteristic(&self) -> bool {
        matches!(self, DeviceError::MissingCharacteristic { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("The device could not be resolved to a connectable handle")]
    NoDeviceHandle,

    #[error("Connect attempt {attempt} timed out after {after:?}")]
    Timeout { attempt: usize, after: Duration },

    #[error("Failed to connect: {source}")]
    Failed { #[from] source: DeviceError },

    #[error("A connection attempt is already in progress")]
    AlreadyInProgress,

    #[error("The connection dropped before it could be used")]
    Dropped,

    #[error("The session has been shut down")]
    ShutDown,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid argument: {source}")]
    InvalidArgument { #[from] source: ProtocolError },

    #[error("Not connected to the device: {source}")]
    NotConnected { source: ConnectionError },

    #[error("Error communicating with device: {source}")]
    Transport { #[from] source: DeviceError },

    #[error("The {operation} took longer than {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error("The session has been shut down")]
    ShutDown,
}

impl SessionError {
    pub fn is_shut_down(&self) -> bool {
        matches!(self, SessionError::ShutDown | SessionError::NotConnected { source: ConnectionError::ShutDown })
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to set up logging: {source}")]
    Logging { #[from] source: log::SetLoggerError },

    #[error("Failed to open log file: {source}")]
    LogFile { source: io::Error },

    #[error("No device address given; pass --address or set \"address\" in the config file")]
    NoAddress,

    #[error("Bluetooth error: {source}")]
    Device { #[from] source: DeviceError },

    #[error("{source}")]
    Session { #[from] source: SessionError },

    #[error("{source}")]
    Connection { #[from] source: ConnectionError },
}

pub fn readable_panic_error(error: &Box<dyn Any + Send + 'static>) -> String {
    let mut stringified = String::from("???");

    if let Some(s) = error.downcast_ref::<&str>() {
        stringified = format!("{}", s);
    }
    else if let Some(s) = error.downcast_ref::<String>() {
        stringified = format!("{}", s);
    }

    format!("panic: [{}]", stringified)
}
