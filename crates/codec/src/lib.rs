//! Measurement decoding for BLE health peripherals.
//!
//! Turns raw GATT notification payloads into typed, validated
//! measurements: IEEE 11073 SFLOAT/FLOAT parsing, the Blood Pressure
//! (0x2A35) and Health Thermometer (0x2A1C/0x2A1E) frame layouts, the
//! vendor fallbacks consumer-grade thermometers need, and medical
//! plausibility validation.

pub mod bp;
pub mod demux;
pub mod error;
pub mod measurement;
pub mod sfloat;
pub mod temp;
pub mod uuids;
pub mod validate;

pub use demux::decode_frame;
pub use error::{DecodeError, Result};
pub use measurement::{
    BloodPressureMeasurement, DeviceKind, Measurement, RawFrame, TemperatureMeasurement,
    TemperatureUnit,
};
pub use validate::{NormalRanges, Validator};
