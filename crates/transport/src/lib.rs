//! Platform-neutral BLE transport abstraction.
//!
//! The ingestion engine never talks to a host Bluetooth stack directly; it
//! consumes the traits defined here. Two implementations ship with the
//! crate: [`mock::MockTransport`], a scriptable in-memory transport used by
//! every engine test, and (behind the `ble` feature) a host adapter backed
//! by `btleplug`.

pub mod error;
pub mod mock;
pub mod traits;
pub mod types;

#[cfg(feature = "ble")]
pub mod host;

pub use error::{Result, TransportError};
pub use traits::{
    AdvertisementStream, BleTransport, ConnectionEventStream, DeviceSession, GattCharacteristic,
    GattService, ValueStream,
};
pub use types::{
    Advertisement, CccdValue, CharProperties, ConnectionStatus, DeviceAddress, PairingOutcome,
    StatusCode,
};
