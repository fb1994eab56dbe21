//! Per-device connection slot.
//!
//! A slot is created on first discovery of a target device and owns
//! everything tied to that device: the state machine, the transport
//! session, the service catalogue, the subscription set, and the
//! liveness record. All mutation happens on the device's supervisor
//! task; observers read status through a cheap rwlock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use vitalink_codec::DeviceKind;
use vitalink_transport::{CccdValue, DeviceAddress, DeviceSession, GattCharacteristic, GattService};

use crate::error::{EngineError, Result};

/// Connection lifecycle states.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Reconnecting -> ...
///                     |             |             |
///                   Failed     Disconnected     Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl SlotStatus {
    /// Whether the automaton permits this edge. `Failed` is terminal
    /// except for an explicit reset; teardown may take any state back to
    /// `Disconnected`.
    pub fn can_transition(self, to: SlotStatus) -> bool {
        use SlotStatus::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Reconnecting, Disconnected)
                | (Failed, Disconnected)
        )
    }
}

/// An enabled measurement subscription. Dropped (with its CCCD cleared)
/// whenever the slot leaves `Connected`.
pub struct Subscription {
    pub characteristic: Arc<dyn GattCharacteristic>,
    pub uuid: Uuid,
    pub mode: CccdValue,
}

pub struct ConnectionSlot {
    pub address: DeviceAddress,
    pub kind: DeviceKind,
    pub local_name: Mutex<Option<String>>,

    status: RwLock<SlotStatus>,
    retry_count: AtomicU32,

    last_attempt_at: Mutex<Option<Instant>>,
    last_connected_at: Mutex<Option<Instant>>,
    last_disconnected_at: Mutex<Option<Instant>>,

    /// Updated only from the value-changed path.
    last_frame_at: Mutex<Option<Instant>>,
    /// Anchor of the smart-disconnect window: the first valid measurement
    /// of the current connection epoch.
    smart_anchor: Mutex<Option<Instant>>,

    session: tokio::sync::Mutex<Option<Arc<dyn DeviceSession>>>,
    catalogue: tokio::sync::Mutex<Vec<Arc<dyn GattService>>>,
    subscriptions: Mutex<Vec<Subscription>>,

    /// Slot-scoped stop signal; replaced when a supervisor is respawned.
    stop: Mutex<watch::Sender<bool>>,
    /// Connection-epoch stop signal; replaced on every successful connect
    /// and fired on teardown so frame forwarders never outlive the link.
    link_stop: Mutex<watch::Sender<bool>>,
}

impl ConnectionSlot {
    pub fn new(address: DeviceAddress, kind: DeviceKind) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        let (link_stop, _) = watch::channel(false);
        Arc::new(Self {
            address,
            kind,
            local_name: Mutex::new(None),
            status: RwLock::new(SlotStatus::Disconnected),
            retry_count: AtomicU32::new(0),
            last_attempt_at: Mutex::new(None),
            last_connected_at: Mutex::new(None),
            last_disconnected_at: Mutex::new(None),
            last_frame_at: Mutex::new(None),
            smart_anchor: Mutex::new(None),
            session: tokio::sync::Mutex::new(None),
            catalogue: tokio::sync::Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            stop: Mutex::new(stop),
            link_stop: Mutex::new(link_stop),
        })
    }

    pub fn status(&self) -> SlotStatus {
        *self.status.read()
    }

    /// Move through the automaton; rejects forbidden edges. Bookkeeping
    /// timestamps update as a side effect.
    pub fn transition(&self, to: SlotStatus) -> Result<()> {
        let mut status = self.status.write();
        let from = *status;
        if from == to {
            return Ok(());
        }
        if !from.can_transition(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }
        *status = to;
        drop(status);

        let now = Instant::now();
        match to {
            SlotStatus::Connecting | SlotStatus::Reconnecting => {
                *self.last_attempt_at.lock() = Some(now);
            }
            SlotStatus::Connected => {
                *self.last_connected_at.lock() = Some(now);
            }
            SlotStatus::Disconnected | SlotStatus::Failed => {
                *self.last_disconnected_at.lock() = Some(now);
            }
        }
        tracing::debug!(address = %self.address, ?from, ?to, "slot transition");
        Ok(())
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn set_retry_count(&self, value: u32) {
        self.retry_count.store(value, Ordering::SeqCst);
    }

    pub fn note_attempt(&self) {
        *self.last_attempt_at.lock() = Some(Instant::now());
    }

    pub fn last_connected_at(&self) -> Option<Instant> {
        *self.last_connected_at.lock()
    }

    pub fn last_disconnected_at(&self) -> Option<Instant> {
        *self.last_disconnected_at.lock()
    }

    // Liveness.

    pub fn mark_frame(&self) {
        *self.last_frame_at.lock() = Some(Instant::now());
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        *self.last_frame_at.lock()
    }

    /// Age of the newest frame, measured from the connection start when
    /// nothing has arrived yet.
    pub fn frame_age(&self) -> Option<std::time::Duration> {
        let reference = (*self.last_frame_at.lock()).or(*self.last_connected_at.lock())?;
        Some(reference.elapsed())
    }

    pub fn note_valid_measurement(&self) {
        let mut anchor = self.smart_anchor.lock();
        if anchor.is_none() {
            *anchor = Some(Instant::now());
        }
    }

    pub fn smart_anchor(&self) -> Option<Instant> {
        *self.smart_anchor.lock()
    }

    pub fn clear_smart_anchor(&self) {
        *self.smart_anchor.lock() = None;
    }

    // Session and catalogue.

    pub async fn set_session(&self, session: Arc<dyn DeviceSession>) {
        *self.session.lock().await = Some(session);
    }

    pub async fn session(&self) -> Option<Arc<dyn DeviceSession>> {
        self.session.lock().await.clone()
    }

    pub async fn take_session(&self) -> Option<Arc<dyn DeviceSession>> {
        self.session.lock().await.take()
    }

    pub async fn set_catalogue(&self, services: Vec<Arc<dyn GattService>>) {
        *self.catalogue.lock().await = services;
    }

    pub async fn catalogue(&self) -> Vec<Arc<dyn GattService>> {
        self.catalogue.lock().await.clone()
    }

    pub async fn clear_catalogue(&self) {
        self.catalogue.lock().await.clear();
    }

    // Subscriptions.

    pub fn add_subscription(&self, subscription: Subscription) {
        self.subscriptions.lock().push(subscription);
    }

    pub fn take_subscriptions(&self) -> Vec<Subscription> {
        std::mem::take(&mut *self.subscriptions.lock())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    // Cancellation.

    /// Ask the supervisor (and everything scoped to the slot) to stop.
    pub fn request_stop(&self) {
        let _ = self.stop.lock().send(true);
    }

    pub fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop.lock().subscribe()
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop.lock().borrow()
    }

    /// Re-arm the stop signal so a fresh supervisor can run the slot.
    pub fn rearm_stop(&self) {
        let (stop, _) = watch::channel(false);
        *self.stop.lock() = stop;
    }

    /// Begin a new connection epoch; previous forwarders are told to end.
    pub fn new_link_epoch(&self) -> watch::Receiver<bool> {
        let (link_stop, rx) = watch::channel(false);
        *self.link_stop.lock() = link_stop;
        self.clear_smart_anchor();
        rx
    }

    pub fn end_link_epoch(&self) {
        let _ = self.link_stop.lock().send(true);
    }
}
