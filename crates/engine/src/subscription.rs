//! Measurement subscription management.
//!
//! After a connect, resolves the measurement characteristics for the
//! device's kind, enables notify/indicate on each with the retry budgets
//! the flaky firmware out there actually needs, and spawns the forwarder
//! tasks that turn value changes into raw frames for the demultiplexer.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use vitalink_codec::uuids::{uuid16_of, CHAR_BLOOD_PRESSURE_MEASUREMENT, TEMPERATURE_CHARACTERISTICS};
use vitalink_codec::{DeviceKind, RawFrame};
use vitalink_transport::{CccdValue, DeviceSession, GattCharacteristic, GattService, StatusCode};

use crate::error::{EngineError, Result};
use crate::slot::{ConnectionSlot, Subscription};

const SERVICE_FETCH_RETRIES: usize = 3;
const SERVICE_FETCH_SPACING: Duration = Duration::from_secs(1);
const CHARACTERISTIC_FETCH_RETRIES: usize = 3;
const CHARACTERISTIC_FETCH_SPACING: Duration = Duration::from_millis(500);
const CCCD_WRITE_ATTEMPTS: usize = 3;
/// Settle time after clearing a stale descriptor before re-writing it.
const CCCD_CLEAR_SETTLE: Duration = Duration::from_millis(500);

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn target_characteristics(kind: DeviceKind) -> &'static [u16] {
    match kind {
        DeviceKind::BloodPressure => &[CHAR_BLOOD_PRESSURE_MEASUREMENT],
        DeviceKind::Thermometer => &TEMPERATURE_CHARACTERISTICS,
    }
}

pub(crate) struct SubscriptionManager {
    pub frames: mpsc::UnboundedSender<RawFrame>,
}

impl SubscriptionManager {
    /// Enable measurement subscriptions on a freshly connected slot.
    /// Returns how many characteristics were enabled.
    pub async fn subscribe_slot(&self, slot: &Arc<ConnectionSlot>) -> Result<usize> {
        let session = slot
            .session()
            .await
            .ok_or(EngineError::Gatt(StatusCode::Unreachable))?;
        let link_stop = slot.new_link_epoch();

        let mut services = slot.catalogue().await;
        if services.is_empty() {
            services = self.fetch_services(session.as_ref()).await?;
            slot.set_catalogue(services.clone()).await;
        }

        let wanted = target_characteristics(slot.kind);
        let mut enabled = 0usize;
        let mut fallback_pool: Vec<Arc<dyn GattCharacteristic>> = Vec::new();

        for service in &services {
            let characteristics = match self.fetch_characteristics(service.as_ref()).await {
                Ok(characteristics) => characteristics,
                Err(status) => {
                    warn!(
                        address = %slot.address,
                        service = %service.uuid(),
                        %status,
                        "characteristic discovery failed"
                    );
                    continue;
                }
            };
            for characteristic in characteristics {
                if !characteristic.properties().supports_subscription() {
                    continue;
                }
                let is_target = uuid16_of(characteristic.uuid())
                    .is_some_and(|short| wanted.contains(&short));
                if is_target {
                    if self.enable(slot, &characteristic, &link_stop).await {
                        enabled += 1;
                    }
                } else if slot.kind == DeviceKind::Thermometer {
                    fallback_pool.push(characteristic);
                }
            }
        }

        // Vendor thermometers often notify on proprietary characteristics
        // only; when nothing standard matched, take everything capable.
        if enabled == 0 && slot.kind == DeviceKind::Thermometer && !fallback_pool.is_empty() {
            info!(
                address = %slot.address,
                candidates = fallback_pool.len(),
                "no standard thermometer characteristic, enabling fallbacks"
            );
            for characteristic in fallback_pool {
                if self.enable(slot, &characteristic, &link_stop).await {
                    enabled += 1;
                }
            }
        }

        if enabled == 0 {
            return Err(EngineError::NoSubscribableCharacteristic);
        }
        info!(address = %slot.address, enabled, "subscriptions enabled");
        Ok(enabled)
    }

    async fn fetch_services(
        &self,
        session: &dyn DeviceSession,
    ) -> Result<Vec<Arc<dyn GattService>>> {
        let mut last = StatusCode::Unknown;
        for attempt in 0..=SERVICE_FETCH_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(SERVICE_FETCH_SPACING).await;
            }
            match session.services().await {
                Ok(services) => return Ok(services),
                Err(status) => {
                    debug!(attempt, %status, "service fetch failed");
                    last = status;
                }
            }
        }
        Err(EngineError::Gatt(last))
    }

    async fn fetch_characteristics(
        &self,
        service: &dyn GattService,
    ) -> std::result::Result<Vec<Arc<dyn GattCharacteristic>>, StatusCode> {
        let mut last = StatusCode::Unknown;
        for attempt in 0..=CHARACTERISTIC_FETCH_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(CHARACTERISTIC_FETCH_SPACING).await;
            }
            match service.characteristics().await {
                Ok(characteristics) => return Ok(characteristics),
                Err(status) => {
                    debug!(attempt, %status, "characteristic fetch failed");
                    last = status;
                }
            }
        }
        Err(last)
    }

    async fn enable(
        &self,
        slot: &Arc<ConnectionSlot>,
        characteristic: &Arc<dyn GattCharacteristic>,
        link_stop: &watch::Receiver<bool>,
    ) -> bool {
        match self.enable_cccd(characteristic.as_ref()).await {
            Ok(mode) => {
                debug!(
                    address = %slot.address,
                    characteristic = %characteristic.uuid(),
                    ?mode,
                    "subscription enabled"
                );
                self.spawn_forwarder(slot, characteristic, link_stop.clone());
                slot.add_subscription(Subscription {
                    characteristic: Arc::clone(characteristic),
                    uuid: characteristic.uuid(),
                    mode,
                });
                true
            }
            Err(e) => {
                warn!(
                    address = %slot.address,
                    characteristic = %characteristic.uuid(),
                    error = %e,
                    "subscription enable failed"
                );
                false
            }
        }
    }

    /// Write the descriptor, preferring Indicate, with the stale-state
    /// guard: a descriptor left enabled by a previous session is cleared
    /// and allowed to settle first, which prevents the AccessDenied some
    /// hosts return on re-subscription.
    async fn enable_cccd(&self, characteristic: &dyn GattCharacteristic) -> Result<CccdValue> {
        let desired = characteristic
            .properties()
            .preferred_cccd()
            .ok_or(EngineError::NoSubscribableCharacteristic)?;

        if let Ok(current) = characteristic.read_cccd().await {
            if current.is_enabled() {
                debug!(?current, "clearing stale descriptor");
                let _ = characteristic.write_cccd(CccdValue::None).await;
                tokio::time::sleep(CCCD_CLEAR_SETTLE).await;
            }
        }

        let mut last = StatusCode::Unknown;
        for attempt in 1..=CCCD_WRITE_ATTEMPTS {
            match characteristic.write_cccd(desired).await {
                Ok(()) => return Ok(desired),
                Err(status) => {
                    debug!(attempt, %status, "cccd write failed");
                    last = status;
                    if attempt == CCCD_WRITE_ATTEMPTS {
                        break;
                    }
                    let wait = match status {
                        StatusCode::AccessDenied => Duration::from_secs(2),
                        _ => Duration::from_secs(1),
                    };
                    tokio::time::sleep(wait).await;
                }
            }
        }
        Err(EngineError::Gatt(last))
    }

    /// Pump value changes into raw frames until the link epoch ends. The
    /// liveness record updates on the same path.
    fn spawn_forwarder(
        &self,
        slot: &Arc<ConnectionSlot>,
        characteristic: &Arc<dyn GattCharacteristic>,
        mut link_stop: watch::Receiver<bool>,
    ) {
        let frames = self.frames.clone();
        let slot = Arc::clone(slot);
        let uuid = characteristic.uuid();
        let mut values = characteristic.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = link_stop.changed() => break,
                    value = values.next() => match value {
                        Some(bytes) => {
                            slot.mark_frame();
                            let frame = RawFrame {
                                address: slot.address,
                                characteristic: uuid,
                                bytes,
                                received_at: unix_millis(),
                            };
                            if frames.send(frame).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!(address = %slot.address, characteristic = %uuid, "forwarder ended");
        });
    }
}
