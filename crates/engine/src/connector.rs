//! Connection establishment and teardown.
//!
//! One `Connector` is shared by every slot supervisor. It owns the global
//! connect semaphore and implements the two halves of the lifecycle
//! contract: bounded connect attempts driven through the backoff
//! schedule, and the deliberately over-thorough disconnect sequence that
//! coaxes host stacks into dropping stale GATT caches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use vitalink_transport::{BleTransport, CccdValue};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::slot::{ConnectionSlot, SlotStatus};

/// Redundant service refetches performed during teardown. Some host
/// stacks only evict a stale GATT cache after repeated discovery, and a
/// stale cache makes the next subscription fail with AccessDenied.
const CACHE_EVICT_REFETCHES: usize = 3;
const CACHE_EVICT_SPACING: Duration = Duration::from_millis(200);

pub(crate) enum EstablishOutcome {
    Connected,
    Failed,
    PairingRejected,
    Cancelled,
}

pub(crate) struct Connector {
    pub transport: Arc<dyn BleTransport>,
    pub config: Arc<EngineConfig>,
    pub bus: EventBus,
    pub permits: Arc<Semaphore>,
}

impl Connector {
    /// One bounded connect attempt: open the device, ensure pairing,
    /// discover services, store the catalogue on the slot.
    async fn attempt(&self, slot: &Arc<ConnectionSlot>) -> Result<()> {
        slot.note_attempt();

        tokio::time::timeout(self.config.connect_timeout, async {
            let session = self.transport.open_device(slot.address).await?;
            let outcome = session.pair().await?;
            if !outcome.is_paired() {
                return Err(EngineError::PairingFailed(outcome));
            }
            let services = session.services().await.map_err(EngineError::Gatt)?;
            slot.set_session(session).await;
            slot.set_catalogue(services).await;
            Ok(())
        })
        .await
        .map_err(|_| EngineError::ConnectTimeout)?
    }

    /// Drive the slot to `Connected` through the backoff schedule.
    ///
    /// `phase` is `Connecting` for a first connect (which gets an
    /// immediate attempt before the schedule) or `Reconnecting` after a
    /// lost link (where attempt 1 waits out the first backoff step).
    /// Exhausting the schedule fails the slot and emits exactly one
    /// Failed status event.
    pub async fn establish(
        &self,
        slot: &Arc<ConnectionSlot>,
        phase: SlotStatus,
    ) -> EstablishOutcome {
        if slot.status() == SlotStatus::Connected {
            return EstablishOutcome::Connected;
        }
        // A stop sent before this point would be invisible to the watch
        // receiver subscribed below.
        if slot.is_stop_requested() {
            return EstablishOutcome::Cancelled;
        }

        // The permit spans the whole operation, retries included, and is
        // taken before the slot becomes Connecting: the count of slots in
        // the Connecting state never exceeds the semaphore limit.
        let mut stop = slot.stop_rx();
        let _permit = tokio::select! {
            _ = stop.changed() => return EstablishOutcome::Cancelled,
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return EstablishOutcome::Cancelled,
            }
        };

        if slot.status() != phase {
            if let Err(e) = slot.transition(phase) {
                warn!(address = %slot.address, error = %e, "cannot enter connect phase");
                return EstablishOutcome::Cancelled;
            }
            self.bus.publish_status(slot.address, phase, None);
        }

        let mut last_error: Option<EngineError> = None;

        if phase == SlotStatus::Connecting {
            match self.guarded_attempt(slot, &mut stop).await {
                Ok(()) => return self.finish(slot),
                Err(EngineError::Cancelled) => return EstablishOutcome::Cancelled,
                Err(EngineError::PairingFailed(outcome)) => {
                    warn!(address = %slot.address, ?outcome, "pairing failed");
                    return EstablishOutcome::PairingRejected;
                }
                Err(e) => {
                    debug!(address = %slot.address, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        for (index, delay) in self.config.reconnect_backoff.iter().enumerate() {
            tokio::select! {
                _ = stop.changed() => return EstablishOutcome::Cancelled,
                _ = tokio::time::sleep(*delay) => {}
            }
            slot.set_retry_count(index as u32 + 1);

            match self.guarded_attempt(slot, &mut stop).await {
                Ok(()) => return self.finish(slot),
                Err(EngineError::Cancelled) => return EstablishOutcome::Cancelled,
                Err(EngineError::PairingFailed(outcome)) => {
                    warn!(address = %slot.address, ?outcome, "pairing failed");
                    return EstablishOutcome::PairingRejected;
                }
                Err(e) => {
                    debug!(
                        address = %slot.address,
                        attempt = index + 1,
                        error = %e,
                        "connect attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error.map(|e| e.to_string());
        warn!(address = %slot.address, error = ?reason, "connect attempts exhausted");
        if slot.transition(SlotStatus::Failed).is_ok() {
            self.bus
                .publish_status(slot.address, SlotStatus::Failed, reason);
        }
        EstablishOutcome::Failed
    }

    async fn guarded_attempt(
        &self,
        slot: &Arc<ConnectionSlot>,
        stop: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        tokio::select! {
            _ = stop.changed() => Err(EngineError::Cancelled),
            result = self.attempt(slot) => result,
        }
    }

    fn finish(&self, slot: &Arc<ConnectionSlot>) -> EstablishOutcome {
        slot.set_retry_count(0);
        match slot.transition(SlotStatus::Connected) {
            Ok(()) => {
                info!(address = %slot.address, kind = %slot.kind, "connected");
                self.bus
                    .publish_status(slot.address, SlotStatus::Connected, None);
                EstablishOutcome::Connected
            }
            Err(e) => {
                warn!(address = %slot.address, error = %e, "late connect discarded");
                EstablishOutcome::Cancelled
            }
        }
    }

    /// Best-effort teardown; completes every step regardless of
    /// per-step outcome. When `set_disconnected` is false the caller has
    /// already moved the slot (e.g. into `Reconnecting`) and only the
    /// resource cleanup runs.
    pub async fn teardown(&self, slot: &Arc<ConnectionSlot>, set_disconnected: bool) {
        slot.end_link_epoch();

        for subscription in slot.take_subscriptions() {
            if let Err(status) = subscription.characteristic.write_cccd(CccdValue::None).await {
                debug!(
                    address = %slot.address,
                    characteristic = %subscription.uuid,
                    %status,
                    "cccd clear failed during teardown"
                );
            }
        }

        slot.clear_catalogue().await;

        if let Some(session) = slot.take_session().await {
            for _ in 0..CACHE_EVICT_REFETCHES {
                let _ = session.services().await;
                tokio::time::sleep(CACHE_EVICT_SPACING).await;
            }
            session.release().await;
        }

        if set_disconnected && slot.status() != SlotStatus::Disconnected {
            match slot.transition(SlotStatus::Disconnected) {
                Ok(()) => {
                    self.bus
                        .publish_status(slot.address, SlotStatus::Disconnected, None);
                }
                Err(e) => warn!(address = %slot.address, error = %e, "teardown transition"),
            }
        }
        debug!(address = %slot.address, "teardown complete");
    }
}
