use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use vitalink_codec::{DeviceKind, Measurement};
use vitalink_transport::DeviceAddress;

use crate::slot::SlotStatus;

/// A classified device seen during scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub address: DeviceAddress,
    pub kind: DeviceKind,
    pub rssi: i16,
    pub local_name: Option<String>,
}

/// A slot state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub address: DeviceAddress,
    pub status: SlotStatus,
    pub error: Option<String>,
}

/// A decoded, validated measurement. Invalid measurements are delivered
/// too, flagged on the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementEvent {
    pub measurement: Measurement,
}

/// Engine-level conditions not tied to a single device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineStatus {
    ScannerStopped,
    ScannerRestarting {
        attempt: u32,
    },
    /// A frame could not be decoded; the subscription survives.
    DecoderDropped {
        address: DeviceAddress,
        characteristic: Uuid,
    },
    Fatal {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    Discovery(DiscoveryEvent),
    Status(StatusEvent),
    Measurement(MeasurementEvent),
    Engine(EngineStatus),
}

/// Broadcast fan-out to consumers. Slow subscribers lag and drop rather
/// than backpressure the pipeline.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn publish_status(&self, address: DeviceAddress, status: SlotStatus, error: Option<String>) {
        self.publish(EngineEvent::Status(StatusEvent {
            address,
            status,
            error,
        }));
    }
}
