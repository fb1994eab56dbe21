//! Engine assembly: slot supervision, frame pump, start/stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vitalink_codec::{decode_frame, DeviceKind, RawFrame, Validator};
use vitalink_transport::{BleTransport, DeviceAddress};

use crate::config::EngineConfig;
use crate::connector::{Connector, EstablishOutcome};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EngineStatus, EventBus, MeasurementEvent};
use crate::probe::{monitor_connection, MonitorOutcome};
use crate::scanner::{ScanMessage, ScanTask};
use crate::slot::{ConnectionSlot, SlotStatus};
use crate::subscription::SubscriptionManager;

/// How long shutdown waits for each slot supervisor before abandoning it.
const SLOT_JOIN_DEADLINE: Duration = Duration::from_secs(2);

/// Engine lifecycle. Start and stop are linearized through this state;
/// there is no re-entrant path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct Shared {
    transport: Arc<dyn BleTransport>,
    config: Arc<EngineConfig>,
    bus: EventBus,
    validator: Validator,
    slots: DashMap<DeviceAddress, Arc<ConnectionSlot>>,
    supervisors: Mutex<HashMap<DeviceAddress, JoinHandle<()>>>,
    /// Devices that refused pairing, with the time the refusal was seen.
    ignored: Mutex<HashMap<DeviceAddress, Instant>>,
    shutdown: Mutex<watch::Sender<bool>>,
}

impl Shared {
    fn ignore(&self, address: DeviceAddress) {
        self.ignored.lock().insert(address, Instant::now());
    }

    /// Whether this device's advertisements are currently suppressed.
    /// Expired entries are dropped so the device gets re-evaluated.
    fn is_ignored(&self, address: DeviceAddress) -> bool {
        let mut ignored = self.ignored.lock();
        match ignored.get(&address) {
            Some(at) if at.elapsed() < self.config.pairing_retry_cooldown => true,
            Some(_) => {
                ignored.remove(&address);
                false
            }
            None => false,
        }
    }

    async fn stop_all_slots(&self) {
        for entry in self.slots.iter() {
            entry.value().request_stop();
        }
        let handles: Vec<(DeviceAddress, JoinHandle<()>)> =
            self.supervisors.lock().drain().collect();
        let joins = handles.into_iter().map(|(address, mut handle)| async move {
            if tokio::time::timeout(SLOT_JOIN_DEADLINE, &mut handle)
                .await
                .is_err()
            {
                warn!(address = %address, "slot supervisor missed join deadline, aborting");
                handle.abort();
            }
        });
        futures::future::join_all(joins).await;
    }
}

/// Everything a slot supervisor needs.
struct EngineCtx {
    shared: Arc<Shared>,
    connector: Connector,
    subscriptions: SubscriptionManager,
}

pub struct IngestionEngine {
    shared: Arc<Shared>,
    state: Mutex<EngineState>,
    ctx: Mutex<Option<Arc<EngineCtx>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestionEngine {
    pub fn new(transport: Arc<dyn BleTransport>, config: EngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let bus = EventBus::new(config.event_capacity);
        let validator = Validator::new(config.normal_ranges.clone());
        let shared = Arc::new(Shared {
            transport,
            config: Arc::new(config),
            bus,
            validator,
            slots: DashMap::new(),
            supervisors: Mutex::new(HashMap::new()),
            ignored: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(shutdown),
        });
        Self {
            shared,
            state: Mutex::new(EngineState::Idle),
            ctx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Subscribe to the engine's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.bus.subscribe()
    }

    pub fn device_status(&self, address: DeviceAddress) -> Option<SlotStatus> {
        self.shared
            .slots
            .get(&address)
            .map(|entry| entry.value().status())
    }

    pub fn devices(&self) -> Vec<(DeviceAddress, DeviceKind, SlotStatus)> {
        self.shared
            .slots
            .iter()
            .map(|entry| {
                let slot = entry.value();
                (slot.address, slot.kind, slot.status())
            })
            .collect()
    }

    /// Start scanning and serving devices. Idempotence is rejected
    /// explicitly: a second start while running is an error, not a
    /// silent no-op.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Idle {
                return Err(EngineError::AlreadyRunning);
            }
            *state = EngineState::Starting;
        }
        info!("engine starting");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shared.shutdown.lock() = shutdown_tx;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(EngineCtx {
            shared: Arc::clone(&self.shared),
            connector: Connector {
                transport: Arc::clone(&self.shared.transport),
                config: Arc::clone(&self.shared.config),
                bus: self.shared.bus.clone(),
                permits: Arc::new(Semaphore::new(self.shared.config.concurrent_connects)),
            },
            subscriptions: SubscriptionManager { frames: frames_tx },
        });
        *self.ctx.lock() = Some(Arc::clone(&ctx));

        let scan_task = ScanTask {
            transport: Arc::clone(&self.shared.transport),
            config: Arc::clone(&self.shared.config),
            bus: self.shared.bus.clone(),
            intake: scan_tx,
        };

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(scan_task.run(shutdown_rx.clone())));
        tasks.push(tokio::spawn(run_intake(
            Arc::clone(&ctx),
            scan_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(run_frame_pump(
            Arc::clone(&self.shared),
            frames_rx,
            shutdown_rx,
        )));
        drop(tasks);

        *self.state.lock() = EngineState::Running;
        info!("engine running");
        Ok(())
    }

    /// Disconnect every slot (running the full disconnect contract) and
    /// release the pipeline tasks.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Running {
                return Err(EngineError::NotRunning);
            }
            *state = EngineState::Stopping;
        }
        info!("engine stopping");

        // Quiesce the pipeline first so no new slots appear, then run the
        // disconnect contract on every slot.
        let _ = self.shared.shutdown.lock().send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(SLOT_JOIN_DEADLINE, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        self.shared.stop_all_slots().await;
        let _ = self.shared.transport.stop_scan().await;

        // Slots do not outlive the engine run.
        self.shared.slots.clear();
        self.shared.ignored.lock().clear();
        *self.ctx.lock() = None;
        *self.state.lock() = EngineState::Idle;
        info!("engine stopped");
        Ok(())
    }

    /// Connect a discovered device. Idempotent: a slot that is already
    /// connected (or on its way) succeeds immediately; a failed slot is
    /// reset first.
    pub async fn connect(&self, address: DeviceAddress) -> Result<()> {
        let slot = self.slot(address)?;
        match slot.status() {
            SlotStatus::Connected | SlotStatus::Connecting | SlotStatus::Reconnecting => Ok(()),
            SlotStatus::Failed => {
                self.reset(address)?;
                Ok(())
            }
            SlotStatus::Disconnected => {
                let ctx = self.running_ctx()?;
                spawn_supervisor(&ctx, slot);
                Ok(())
            }
        }
    }

    /// Disconnect a device, running the teardown contract. Idempotent.
    pub async fn disconnect(&self, address: DeviceAddress) -> Result<()> {
        let slot = self.slot(address)?;
        if slot.status() == SlotStatus::Disconnected {
            return Ok(());
        }
        slot.request_stop();
        let handle = self.shared.supervisors.lock().remove(&address);
        match handle {
            Some(mut handle) => {
                if tokio::time::timeout(SLOT_JOIN_DEADLINE, &mut handle)
                    .await
                    .is_err()
                {
                    handle.abort();
                }
            }
            None => {
                // No supervisor alive; clean up directly.
                if let Some(ctx) = self.ctx.lock().clone() {
                    ctx.connector.teardown(&slot, true).await;
                }
            }
        }
        Ok(())
    }

    /// Bring a failed slot back to `Disconnected` and let it reconnect.
    pub fn reset(&self, address: DeviceAddress) -> Result<()> {
        let slot = self.slot(address)?;
        slot.transition(SlotStatus::Disconnected)?;
        self.shared
            .bus
            .publish_status(address, SlotStatus::Disconnected, None);
        let ctx = self.running_ctx()?;
        spawn_supervisor(&ctx, slot);
        Ok(())
    }

    /// Disconnect and drop all knowledge of a device.
    pub async fn forget(&self, address: DeviceAddress) -> Result<()> {
        self.disconnect(address).await?;
        self.shared.slots.remove(&address);
        self.shared.supervisors.lock().remove(&address);
        Ok(())
    }

    fn slot(&self, address: DeviceAddress) -> Result<Arc<ConnectionSlot>> {
        self.shared
            .slots
            .get(&address)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::SlotNotFound(address))
    }

    fn running_ctx(&self) -> Result<Arc<EngineCtx>> {
        if *self.state.lock() != EngineState::Running {
            return Err(EngineError::NotRunning);
        }
        self.ctx.lock().clone().ok_or(EngineError::NotRunning)
    }
}

fn spawn_supervisor(ctx: &Arc<EngineCtx>, slot: Arc<ConnectionSlot>) {
    slot.rearm_stop();
    let address = slot.address;
    let handle = tokio::spawn(run_slot(Arc::clone(ctx), slot));
    if let Some(stale) = ctx.shared.supervisors.lock().insert(address, handle) {
        stale.abort();
    }
}

/// Per-device supervisor: owns every state transition of its slot and
/// keeps the connect -> subscribe -> monitor loop running until the slot
/// fails or is stopped.
async fn run_slot(ctx: Arc<EngineCtx>, slot: Arc<ConnectionSlot>) {
    let mut phase = SlotStatus::Connecting;
    loop {
        match ctx.connector.establish(&slot, phase).await {
            EstablishOutcome::Connected => {}
            EstablishOutcome::Failed => return,
            EstablishOutcome::PairingRejected => {
                ctx.shared.ignore(slot.address);
                ctx.connector.teardown(&slot, true).await;
                ctx.shared.slots.remove(&slot.address);
                return;
            }
            EstablishOutcome::Cancelled => {
                ctx.connector.teardown(&slot, true).await;
                return;
            }
        }

        if let Err(e) = ctx.subscriptions.subscribe_slot(&slot).await {
            warn!(address = %slot.address, error = %e, "no subscriptions enabled");
        }

        let Some(session) = slot.session().await else {
            // Session vanished between connect and monitor; go around.
            phase = SlotStatus::Connecting;
            continue;
        };
        let events = session.connection_events();
        drop(session);

        match monitor_connection(&slot, &ctx.shared.config, events).await {
            MonitorOutcome::Stopped => {
                ctx.connector.teardown(&slot, true).await;
                return;
            }
            MonitorOutcome::LinkLost | MonitorOutcome::Unhealthy => {
                if slot.transition(SlotStatus::Reconnecting).is_ok() {
                    ctx.shared
                        .bus
                        .publish_status(slot.address, SlotStatus::Reconnecting, None);
                }
                ctx.connector.teardown(&slot, false).await;
                phase = SlotStatus::Reconnecting;
            }
            MonitorOutcome::SmartQuiet | MonitorOutcome::SmartExpired => {
                debug!(address = %slot.address, "smart disconnect cycle");
                ctx.connector.teardown(&slot, true).await;
                let mut stop = slot.stop_rx();
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = tokio::time::sleep(ctx.shared.config.smart_disconnect_cooldown) => {}
                }
                phase = SlotStatus::Connecting;
            }
        }
    }
}

/// Accepts candidates from the scanner, creates slots, and reacts to
/// fatal scanner conditions with a graceful shutdown of every slot.
async fn run_intake(
    ctx: Arc<EngineCtx>,
    mut intake: mpsc::UnboundedReceiver<ScanMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            message = intake.recv() => match message {
                Some(ScanMessage::Candidate(candidate)) => {
                    if ctx.shared.is_ignored(candidate.address) {
                        continue;
                    }
                    if let Some(slot) = ctx.shared.slots.get(&candidate.address) {
                        if candidate.local_name.is_some() {
                            *slot.local_name.lock() = candidate.local_name;
                        }
                        continue;
                    }
                    info!(
                        address = %candidate.address,
                        kind = %candidate.kind,
                        rssi = candidate.rssi,
                        "target device discovered"
                    );
                    let slot = ConnectionSlot::new(candidate.address, candidate.kind);
                    *slot.local_name.lock() = candidate.local_name;
                    ctx.shared
                        .slots
                        .insert(candidate.address, Arc::clone(&slot));
                    spawn_supervisor(&ctx, slot);
                }
                Some(ScanMessage::Fatal(reason)) => {
                    warn!(reason = %reason, "fatal engine condition");
                    ctx.shared
                        .bus
                        .publish(EngineEvent::Engine(EngineStatus::Fatal { reason }));
                    ctx.shared.stop_all_slots().await;
                    return;
                }
                None => return,
            }
        }
    }
}

/// Decodes, validates, and publishes frames from every subscription.
async fn run_frame_pump(
    shared: Arc<Shared>,
    mut frames: mpsc::UnboundedReceiver<RawFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    let slot = shared
                        .slots
                        .get(&frame.address)
                        .map(|entry| Arc::clone(entry.value()));
                    let Some(slot) = slot else {
                        debug!(address = %frame.address, "frame from unknown device dropped");
                        continue;
                    };
                    match decode_frame(&frame, slot.kind) {
                        Ok(mut measurement) => {
                            shared.validator.assess(&mut measurement);
                            if measurement.is_valid() && shared.config.smart_disconnect {
                                slot.note_valid_measurement();
                            }
                            shared.bus.publish(EngineEvent::Measurement(MeasurementEvent {
                                measurement,
                            }));
                        }
                        Err(e) => {
                            warn!(
                                address = %frame.address,
                                characteristic = %frame.characteristic,
                                error = %e,
                                "frame dropped"
                            );
                            shared.bus.publish(EngineEvent::Engine(EngineStatus::DecoderDropped {
                                address: frame.address,
                                characteristic: frame.characteristic,
                            }));
                        }
                    }
                }
                None => return,
            }
        }
    }
}
