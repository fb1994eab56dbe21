//! BLE health-device ingestion engine.
//!
//! Discovers blood-pressure monitors and clinical thermometers, pairs and
//! connects, subscribes to their measurement characteristics, decodes and
//! validates the frames, and fans typed events out over a broadcast bus.
//!
//! The engine consumes the abstract transport from `vitalink-transport`
//! and never references a platform BLE stack. Every device gets its own
//! connection slot and supervisor task; all state transitions and
//! measurements for one device are totally ordered, with no ordering
//! guarantees across devices.

pub mod classify;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod events;
pub mod probe;
pub mod scanner;
pub mod slot;
pub mod subscription;

pub use config::EngineConfig;
pub use engine::{EngineState, IngestionEngine};
pub use error::{EngineError, Result};
pub use events::{DiscoveryEvent, EngineEvent, EngineStatus, EventBus, MeasurementEvent, StatusEvent};
pub use slot::SlotStatus;

pub use vitalink_codec::{DeviceKind, Measurement};
pub use vitalink_transport::DeviceAddress;
