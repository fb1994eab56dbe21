use thiserror::Error;

use vitalink_transport::{DeviceAddress, PairingOutcome, StatusCode, TransportError};

use crate::slot::SlotStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine already running")]
    AlreadyRunning,

    #[error("engine not running")]
    NotRunning,

    #[error("no slot for device {0}")]
    SlotNotFound(DeviceAddress),

    #[error("invalid slot transition {from:?} -> {to:?}")]
    InvalidTransition { from: SlotStatus, to: SlotStatus },

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("pairing failed: {0:?}")]
    PairingFailed(PairingOutcome),

    #[error("gatt operation failed: {0}")]
    Gatt(StatusCode),

    #[error("no subscribable characteristic found")]
    NoSubscribableCharacteristic,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
