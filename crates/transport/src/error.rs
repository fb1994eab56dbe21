use thiserror::Error;

use crate::types::{DeviceAddress, StatusCode};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no BLE adapter available")]
    AdapterNotAvailable,

    #[error("scan already in progress")]
    ScanInProgress,

    #[error("not scanning")]
    NotScanning,

    #[error("device not found: {0}")]
    DeviceNotFound(DeviceAddress),

    #[error("gatt operation failed: {0}")]
    Gatt(StatusCode),

    #[error("operation timed out")]
    Timeout,

    #[error("hardware error: {0}")]
    Hardware(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
