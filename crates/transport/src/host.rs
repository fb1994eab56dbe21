//! Host BLE stack adapter backed by `btleplug`.
//!
//! Maps the transport traits onto whatever platform stack `btleplug`
//! wraps. Two mappings are approximations and documented inline: btleplug
//! owns the CCCD (subscribe/unsubscribe writes it), so `read_cccd` reports
//! the value this adapter last wrote, and explicit pairing is left to the
//! host (stacks bond on demand when a secured attribute is touched).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic as PlugCharacteristic,
    Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
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

fn map_btleplug_error(e: btleplug::Error) -> StatusCode {
    match e {
        btleplug::Error::PermissionDenied => StatusCode::AccessDenied,
        btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => StatusCode::Unreachable,
        btleplug::Error::InvalidBDAddr(_) | btleplug::Error::UnexpectedCallback => {
            StatusCode::ProtocolError
        }
        _ => StatusCode::Unknown,
    }
}

pub struct HostTransport {
    adapter: Adapter,
}

impl HostTransport {
    /// Open the first available adapter on this host.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::Hardware(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| TransportError::Hardware(e.to_string()))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterNotAvailable)?;

        tracing::info!(adapter = ?adapter.adapter_info().await, "host transport initialized");
        Ok(Self { adapter })
    }

    async fn find_peripheral(&self, address: DeviceAddress) -> Result<Peripheral> {
        let wanted = BDAddr::from(*address.as_bytes());
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::Hardware(e.to_string()))?;
        peripherals
            .into_iter()
            .find(|p| p.address() == wanted)
            .ok_or(TransportError::DeviceNotFound(address))
    }
}

#[async_trait]
impl BleTransport for HostTransport {
    async fn start_scan(&self, filter: &[Uuid]) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter {
                services: filter.to_vec(),
            })
            .await
            .map_err(|e| TransportError::Hardware(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| TransportError::Hardware(e.to_string()))
    }

    fn advertisements(&self) -> AdvertisementStream {
        let adapter = self.adapter.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, "adapter event stream unavailable");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let advertisement = Advertisement {
                    address: DeviceAddress::new(props.address.into_inner()),
                    local_name: props.local_name,
                    rssi: props.rssi.unwrap_or(i16::MIN),
                    services: props.services,
                };
                if tx.send(advertisement).is_err() {
                    break;
                }
            }
        });

        Box::pin(async_stream::stream! {
            let mut rx = rx;
            while let Some(adv) = rx.recv().await {
                yield adv;
            }
        })
    }

    async fn open_device(&self, address: DeviceAddress) -> Result<Arc<dyn DeviceSession>> {
        let peripheral = self.find_peripheral(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Hardware(e.to_string()))?;
        Ok(Arc::new(HostSession {
            adapter: self.adapter.clone(),
            peripheral,
            address,
            written_cccds: Arc::new(Mutex::new(HashMap::new())),
        }))
    }
}

struct HostSession {
    adapter: Adapter,
    peripheral: Peripheral,
    address: DeviceAddress,
    // btleplug writes the CCCD itself on subscribe/unsubscribe; this map
    // tracks what we last requested so read_cccd has an answer.
    written_cccds: Arc<Mutex<HashMap<Uuid, CccdValue>>>,
}

#[async_trait]
impl DeviceSession for HostSession {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    async fn pair(&self) -> Result<PairingOutcome> {
        // btleplug exposes no explicit bonding call; host stacks bond when a
        // secured attribute is first accessed.
        Ok(PairingOutcome::AlreadyPaired)
    }

    async fn services(&self) -> std::result::Result<Vec<Arc<dyn GattService>>, StatusCode> {
        self.peripheral
            .discover_services()
            .await
            .map_err(map_btleplug_error)?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| {
                Arc::new(HostService {
                    peripheral: self.peripheral.clone(),
                    uuid: service.uuid,
                    characteristics: service.characteristics.into_iter().collect(),
                    written_cccds: Arc::clone(&self.written_cccds),
                }) as Arc<dyn GattService>
            })
            .collect())
    }

    fn connection_events(&self) -> ConnectionEventStream {
        let adapter = self.adapter.clone();
        let id = self.peripheral.id();
        Box::pin(async_stream::stream! {
            let Ok(mut events) = adapter.events().await else { return };
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceConnected(other) if other == id => {
                        yield ConnectionStatus::Connected;
                    }
                    CentralEvent::DeviceDisconnected(other) if other == id => {
                        yield ConnectionStatus::Disconnected;
                    }
                    _ => {}
                }
            }
        })
    }

    async fn release(&self) {
        if let Err(e) = self.peripheral.disconnect().await {
            tracing::debug!(address = %self.address, error = %e, "release: disconnect failed");
        }
    }
}

struct HostService {
    peripheral: Peripheral,
    uuid: Uuid,
    characteristics: Vec<PlugCharacteristic>,
    written_cccds: Arc<Mutex<HashMap<Uuid, CccdValue>>>,
}

#[async_trait]
impl GattService for HostService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn characteristics(
        &self,
    ) -> std::result::Result<Vec<Arc<dyn GattCharacteristic>>, StatusCode> {
        Ok(self
            .characteristics
            .iter()
            .cloned()
            .map(|inner| {
                Arc::new(HostCharacteristic {
                    peripheral: self.peripheral.clone(),
                    inner,
                    written_cccds: Arc::clone(&self.written_cccds),
                }) as Arc<dyn GattCharacteristic>
            })
            .collect())
    }
}

struct HostCharacteristic {
    peripheral: Peripheral,
    inner: PlugCharacteristic,
    written_cccds: Arc<Mutex<HashMap<Uuid, CccdValue>>>,
}

#[async_trait]
impl GattCharacteristic for HostCharacteristic {
    fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    fn properties(&self) -> CharProperties {
        CharProperties {
            notify: self.inner.properties.contains(CharPropFlags::NOTIFY),
            indicate: self.inner.properties.contains(CharPropFlags::INDICATE),
        }
    }

    async fn read_cccd(&self) -> std::result::Result<CccdValue, StatusCode> {
        Ok(self
            .written_cccds
            .lock()
            .get(&self.inner.uuid)
            .copied()
            .unwrap_or(CccdValue::None))
    }

    async fn write_cccd(&self, value: CccdValue) -> std::result::Result<(), StatusCode> {
        match value {
            CccdValue::Notify | CccdValue::Indicate => self
                .peripheral
                .subscribe(&self.inner)
                .await
                .map_err(map_btleplug_error)?,
            CccdValue::None => self
                .peripheral
                .unsubscribe(&self.inner)
                .await
                .map_err(map_btleplug_error)?,
        }
        self.written_cccds
            .lock()
            .insert(self.inner.uuid, value);
        Ok(())
    }

    fn subscribe(&self) -> ValueStream {
        let peripheral = self.peripheral.clone();
        let uuid = self.inner.uuid;
        Box::pin(async_stream::stream! {
            let Ok(mut notifications) = peripheral.notifications().await else { return };
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid {
                    yield notification.value;
                }
            }
        })
    }
}
