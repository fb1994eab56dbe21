use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    Advertisement, CccdValue, CharProperties, ConnectionStatus, DeviceAddress, PairingOutcome,
    StatusCode,
};

pub type AdvertisementStream = BoxStream<'static, Advertisement>;
pub type ConnectionEventStream = BoxStream<'static, ConnectionStatus>;
pub type ValueStream = BoxStream<'static, Vec<u8>>;

/// The host BLE stack, seen from the engine.
///
/// Implementations must never block inside stream callbacks; events are
/// expected to be handed over through channels and consumed at the
/// engine's pace.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Begin active scanning. `filter` narrows by advertised service UUID;
    /// an empty set scans everything. Idempotent.
    async fn start_scan(&self, filter: &[Uuid]) -> Result<()>;

    /// End scanning. Idempotent.
    async fn stop_scan(&self) -> Result<()>;

    /// Stream of received advertisements. The stream ends when the
    /// platform scanner dies; the engine treats that as a scanner failure.
    fn advertisements(&self) -> AdvertisementStream;

    /// Allocate a session for the given device.
    async fn open_device(&self, address: DeviceAddress) -> Result<Arc<dyn DeviceSession>>;
}

/// An open handle to a single peripheral.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    fn address(&self) -> DeviceAddress;

    /// Ensure the device is OS-paired. Idempotent: returns
    /// [`PairingOutcome::AlreadyPaired`] when a bond already exists.
    async fn pair(&self) -> Result<PairingOutcome>;

    /// Discover (or refetch) the service catalogue.
    async fn services(&self) -> std::result::Result<Vec<Arc<dyn GattService>>, StatusCode>;

    /// Link-level status transitions for this device.
    fn connection_events(&self) -> ConnectionEventStream;

    /// Release the underlying platform object. Best-effort; must not fail.
    async fn release(&self);
}

#[async_trait]
pub trait GattService: Send + Sync {
    fn uuid(&self) -> Uuid;

    async fn characteristics(&self)
        -> std::result::Result<Vec<Arc<dyn GattCharacteristic>>, StatusCode>;
}

impl std::fmt::Debug for dyn GattService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattService").field("uuid", &self.uuid()).finish()
    }
}

#[async_trait]
pub trait GattCharacteristic: Send + Sync {
    fn uuid(&self) -> Uuid;

    fn properties(&self) -> CharProperties;

    async fn read_cccd(&self) -> std::result::Result<CccdValue, StatusCode>;

    async fn write_cccd(&self, value: CccdValue) -> std::result::Result<(), StatusCode>;

    /// Value-changed notifications/indications for this characteristic.
    /// Yields raw attribute payloads in arrival order.
    fn subscribe(&self) -> ValueStream;
}
