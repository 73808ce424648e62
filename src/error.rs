use std::io;
use thiserror::Error;
use btleplug;
use serde_json;

use crate::device::types::ConnectionState;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

/// Failures at the boundary to the BLE stack itself.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with the Bluetooth stack (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No Bluetooth adapter is available")]
    NoAdapter,

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("The connection is closed")]
    LinkClosed,
}

#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("Bluetooth use was denied by the platform")]
    Denied,
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("A scan is already active")]
    AlreadyActive,

    #[error("Failed to scan for peripherals: {source}")]
    Transport { #[from] source: TransportError },
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connecting to the peripheral timed out")]
    Timeout,

    #[error("The peripheral rejected the connection: {source}")]
    Rejected { source: TransportError },

    #[error("A connection is already established or in progress")]
    AlreadyConnected,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Service discovery is not valid while {0:?}")]
    InvalidStateTransition(ConnectionState),

    #[error("Service discovery failed: {source}")]
    Failed { #[from] source: TransportError },
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("A monitor session is already active")]
    AlreadyActive,

    #[error("Monitoring is not valid while {0:?}")]
    InvalidStateTransition(ConnectionState),

    #[error("Failed to subscribe to the measurement characteristic: {source}")]
    Subscribe { #[from] source: TransportError },
}

/// Per-notification decode failures. These never end a monitor session;
/// the offending notification is skipped and reported.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty heart rate notification")]
    Empty,

    #[error("Truncated heart rate notification")]
    Truncated,
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start (config): {source}")]
    Config { #[from] source: ConfigError },

    #[error("Failed to initialize the Bluetooth transport: {source}")]
    Transport { #[from] source: TransportError },

    #[error("Bluetooth permission: {source}")]
    Permission { #[from] source: PermissionError },

    #[error("Scanning for peripherals: {source}")]
    Scan { #[from] source: ScanError },

    #[error("Connecting to peripheral: {source}")]
    Connect { #[from] source: ConnectError },

    #[error("Discovering services: {source}")]
    Discovery { #[from] source: DiscoveryError },

    #[error("Monitoring heart rate: {source}")]
    Monitor { #[from] source: MonitorError },
}
