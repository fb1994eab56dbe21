//! Scriptable in-memory transport for tests and demos.
//!
//! `MockTransport` models a host stack whose behavior tests control
//! directly: advertisements are injected, GATT trees are declared up
//! front, and per-operation failure queues let a test replay exactly the
//! error sequences the engine's retry policies are specified against.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Result, TransportError};
use crate::traits::{
    AdvertisementStream, BleTransport, ConnectionEventStream, DeviceSession, GattCharacteristic,
    GattService, ValueStream,
};
use crate::types::{
    Advertisement, CccdValue, CharProperties, ConnectionStatus, DeviceAddress, PairingOutcome,
    StatusCode,
};

const CHANNEL_CAPACITY: usize = 256;

fn broadcast_stream<T: Clone + Send + 'static>(
    mut rx: broadcast::Receiver<T>,
) -> futures::stream::BoxStream<'static, T> {
    Box::pin(async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(item) => yield item,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

pub struct MockTransport {
    scanning: AtomicBool,
    // None is the scanner-death sentinel; it terminates advertisement streams.
    adv_tx: broadcast::Sender<Option<Advertisement>>,
    devices: Mutex<HashMap<DeviceAddress, Arc<MockDevice>>>,
    scan_start_failures: Mutex<VecDeque<TransportError>>,
    scan_starts: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        let (adv_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            scanning: AtomicBool::new(false),
            adv_tx,
            devices: Mutex::new(HashMap::new()),
            scan_start_failures: Mutex::new(VecDeque::new()),
            scan_starts: AtomicUsize::new(0),
        }
    }

    /// Register a device so `open_device` can find it.
    pub fn add_device(&self, address: DeviceAddress) -> Arc<MockDevice> {
        let device = Arc::new(MockDevice::new(address));
        self.devices
            .lock()
            .insert(address, Arc::clone(&device));
        device
    }

    pub fn device(&self, address: DeviceAddress) -> Option<Arc<MockDevice>> {
        self.devices.lock().get(&address).cloned()
    }

    /// Deliver an advertisement to every live advertisement stream.
    pub fn inject_advertisement(&self, advertisement: Advertisement) {
        let _ = self.adv_tx.send(Some(advertisement));
    }

    /// Terminate every live advertisement stream, simulating scanner death.
    pub fn kill_scanner(&self) {
        self.scanning.store(false, Ordering::SeqCst);
        let _ = self.adv_tx.send(None);
    }

    /// Queue an error for an upcoming `start_scan` call.
    pub fn fail_next_scan_start(&self, error: TransportError) {
        self.scan_start_failures.lock().push_back(error);
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn scan_start_count(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn start_scan(&self, _filter: &[Uuid]) -> Result<()> {
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scan_start_failures.lock().pop_front() {
            return Err(err);
        }
        self.scanning.store(true, Ordering::SeqCst);
        tracing::debug!("mock transport: scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        tracing::debug!("mock transport: scan stopped");
        Ok(())
    }

    fn advertisements(&self) -> AdvertisementStream {
        let mut rx = self.adv_tx.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(Some(adv)) => yield adv,
                    Ok(None) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn open_device(&self, address: DeviceAddress) -> Result<Arc<dyn DeviceSession>> {
        let device = self
            .device(address)
            .ok_or(TransportError::DeviceNotFound(address))?;
        if let Some(err) = device.open_failures.lock().pop_front() {
            return Err(err);
        }
        device.opens.fetch_add(1, Ordering::SeqCst);
        Ok(device as Arc<dyn DeviceSession>)
    }
}

pub struct MockDevice {
    address: DeviceAddress,
    paired: AtomicBool,
    pair_script: Mutex<VecDeque<PairingOutcome>>,
    open_failures: Mutex<VecDeque<TransportError>>,
    service_failures: Mutex<VecDeque<StatusCode>>,
    services: Mutex<Vec<Arc<MockService>>>,
    conn_tx: broadcast::Sender<ConnectionStatus>,
    opens: AtomicUsize,
    service_fetches: AtomicUsize,
    releases: AtomicUsize,
    pair_attempts: AtomicUsize,
}

impl MockDevice {
    fn new(address: DeviceAddress) -> Self {
        let (conn_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            address,
            paired: AtomicBool::new(false),
            pair_script: Mutex::new(VecDeque::new()),
            open_failures: Mutex::new(VecDeque::new()),
            service_failures: Mutex::new(VecDeque::new()),
            services: Mutex::new(Vec::new()),
            conn_tx,
            opens: AtomicUsize::new(0),
            service_fetches: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            pair_attempts: AtomicUsize::new(0),
        }
    }

    pub fn add_service(&self, uuid: Uuid) -> Arc<MockService> {
        let service = Arc::new(MockService::new(uuid));
        self.services.lock().push(Arc::clone(&service));
        service
    }

    pub fn set_paired(&self, paired: bool) {
        self.paired.store(paired, Ordering::SeqCst);
    }

    pub fn is_paired(&self) -> bool {
        self.paired.load(Ordering::SeqCst)
    }

    /// Queue an outcome for an upcoming `pair` call.
    pub fn script_pair_outcome(&self, outcome: PairingOutcome) {
        self.pair_script.lock().push_back(outcome);
    }

    /// Queue an error for an upcoming `open_device` call.
    pub fn fail_next_open(&self, error: TransportError) {
        self.open_failures.lock().push_back(error);
    }

    /// Queue a non-success status for an upcoming `services` call.
    pub fn fail_next_services(&self, status: StatusCode) {
        self.service_failures.lock().push_back(status);
    }

    /// Emit a link-level status transition to connection-event streams.
    pub fn emit_connection_status(&self, status: ConnectionStatus) {
        let _ = self.conn_tx.send(status);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn service_fetch_count(&self) -> usize {
        self.service_fetches.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn pair_attempt_count(&self) -> usize {
        self.pair_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceSession for MockDevice {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    async fn pair(&self) -> Result<PairingOutcome> {
        self.pair_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.pair_script.lock().pop_front() {
            if outcome.is_paired() {
                self.paired.store(true, Ordering::SeqCst);
            }
            return Ok(outcome);
        }
        if self.paired.swap(true, Ordering::SeqCst) {
            Ok(PairingOutcome::AlreadyPaired)
        } else {
            Ok(PairingOutcome::Paired)
        }
    }

    async fn services(&self) -> std::result::Result<Vec<Arc<dyn GattService>>, StatusCode> {
        self.service_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.service_failures.lock().pop_front() {
            return Err(status);
        }
        let services = self.services.lock();
        Ok(services
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn GattService>)
            .collect())
    }

    fn connection_events(&self) -> ConnectionEventStream {
        broadcast_stream(self.conn_tx.subscribe())
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockService {
    uuid: Uuid,
    characteristics: Mutex<Vec<Arc<MockCharacteristic>>>,
    char_failures: Mutex<VecDeque<StatusCode>>,
}

impl MockService {
    fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Mutex::new(Vec::new()),
            char_failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add_characteristic(
        &self,
        uuid: Uuid,
        properties: CharProperties,
    ) -> Arc<MockCharacteristic> {
        let characteristic = Arc::new(MockCharacteristic::new(uuid, properties));
        self.characteristics
            .lock()
            .push(Arc::clone(&characteristic));
        characteristic
    }

    /// Queue a non-success status for an upcoming `characteristics` call.
    pub fn fail_next_characteristics(&self, status: StatusCode) {
        self.char_failures.lock().push_back(status);
    }
}

#[async_trait]
impl GattService for MockService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn characteristics(
        &self,
    ) -> std::result::Result<Vec<Arc<dyn GattCharacteristic>>, StatusCode> {
        if let Some(status) = self.char_failures.lock().pop_front() {
            return Err(status);
        }
        let characteristics = self.characteristics.lock();
        Ok(characteristics
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn GattCharacteristic>)
            .collect())
    }
}

pub struct MockCharacteristic {
    uuid: Uuid,
    properties: CharProperties,
    cccd: Mutex<CccdValue>,
    read_failures: Mutex<VecDeque<StatusCode>>,
    write_failures: Mutex<VecDeque<StatusCode>>,
    cccd_writes: Mutex<Vec<CccdValue>>,
    value_tx: broadcast::Sender<Vec<u8>>,
}

impl MockCharacteristic {
    fn new(uuid: Uuid, properties: CharProperties) -> Self {
        let (value_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            uuid,
            properties,
            cccd: Mutex::new(CccdValue::None),
            read_failures: Mutex::new(VecDeque::new()),
            write_failures: Mutex::new(VecDeque::new()),
            cccd_writes: Mutex::new(Vec::new()),
            value_tx,
        }
    }

    /// Deliver a notification payload to subscribers.
    pub fn notify(&self, payload: Vec<u8>) {
        let _ = self.value_tx.send(payload);
    }

    /// Pre-set the descriptor, e.g. to model stale state left by a
    /// previous session.
    pub fn set_cccd(&self, value: CccdValue) {
        *self.cccd.lock() = value;
    }

    pub fn cccd(&self) -> CccdValue {
        *self.cccd.lock()
    }

    /// Queue a non-success status for an upcoming `read_cccd` call.
    pub fn fail_next_read(&self, status: StatusCode) {
        self.read_failures.lock().push_back(status);
    }

    /// Queue a non-success status for an upcoming `write_cccd` call.
    pub fn fail_next_write(&self, status: StatusCode) {
        self.write_failures.lock().push_back(status);
    }

    /// Every descriptor value successfully written, in order.
    pub fn cccd_write_log(&self) -> Vec<CccdValue> {
        self.cccd_writes.lock().clone()
    }
}

#[async_trait]
impl GattCharacteristic for MockCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn properties(&self) -> CharProperties {
        self.properties
    }

    async fn read_cccd(&self) -> std::result::Result<CccdValue, StatusCode> {
        if let Some(status) = self.read_failures.lock().pop_front() {
            return Err(status);
        }
        Ok(*self.cccd.lock())
    }

    async fn write_cccd(&self, value: CccdValue) -> std::result::Result<(), StatusCode> {
        if let Some(status) = self.write_failures.lock().pop_front() {
            return Err(status);
        }
        *self.cccd.lock() = value;
        self.cccd_writes.lock().push(value);
        Ok(())
    }

    fn subscribe(&self) -> ValueStream {
        broadcast_stream(self.value_tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn addr(n: u64) -> DeviceAddress {
        DeviceAddress::from_u64(n)
    }

    #[tokio::test]
    async fn test_advertisement_injection_reaches_stream() {
        let transport = MockTransport::new();
        let mut stream = transport.advertisements();

        transport.inject_advertisement(Advertisement {
            address: addr(0x10),
            local_name: Some("BP Monitor".into()),
            rssi: -60,
            services: vec![],
        });

        let adv = stream.next().await.unwrap();
        assert_eq!(adv.address, addr(0x10));
        assert_eq!(adv.rssi, -60);
    }

    #[tokio::test]
    async fn test_kill_scanner_terminates_stream() {
        let transport = MockTransport::new();
        let mut stream = transport.advertisements();
        transport.kill_scanner();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_pair_is_idempotent() {
        let transport = MockTransport::new();
        let device = transport.add_device(addr(0x22));

        assert_eq!(device.pair().await.unwrap(), PairingOutcome::Paired);
        assert_eq!(device.pair().await.unwrap(), PairingOutcome::AlreadyPaired);
    }

    #[tokio::test]
    async fn test_scripted_service_failures_drain_in_order() {
        let transport = MockTransport::new();
        let device = transport.add_device(addr(0x33));
        device.fail_next_services(StatusCode::Unreachable);
        device.fail_next_services(StatusCode::AccessDenied);

        assert_eq!(device.services().await.unwrap_err(), StatusCode::Unreachable);
        assert_eq!(device.services().await.unwrap_err(), StatusCode::AccessDenied);
        assert!(device.services().await.is_ok());
        assert_eq!(device.service_fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_cccd_write_log_records_values() {
        let transport = MockTransport::new();
        let device = transport.add_device(addr(0x44));
        let service = device.add_service(Uuid::from_u128(0x1809));
        let ch = service.add_characteristic(
            Uuid::from_u128(0x2A1C),
            CharProperties {
                notify: false,
                indicate: true,
            },
        );

        ch.write_cccd(CccdValue::Indicate).await.unwrap();
        ch.write_cccd(CccdValue::None).await.unwrap();

        assert_eq!(ch.cccd_write_log(), vec![CccdValue::Indicate, CccdValue::None]);
        assert_eq!(ch.cccd(), CccdValue::None);
    }

    #[tokio::test]
    async fn test_notification_reaches_subscriber() {
        let transport = MockTransport::new();
        let device = transport.add_device(addr(0x55));
        let service = device.add_service(Uuid::from_u128(0x1810));
        let ch = service.add_characteristic(
            Uuid::from_u128(0x2A35),
            CharProperties {
                notify: true,
                indicate: false,
            },
        );

        let mut values = ch.subscribe();
        ch.notify(vec![0x1E, 0x78, 0xF0]);
        assert_eq!(values.next().await.unwrap(), vec![0x1E, 0x78, 0xF0]);
    }
}
