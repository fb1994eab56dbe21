use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vitalink_transport::DeviceAddress;

/// What a classified device is, fixed at discovery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    BloodPressure,
    Thermometer,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::BloodPressure => write!(f, "blood-pressure"),
            DeviceKind::Thermometer => write!(f, "thermometer"),
        }
    }
}

/// A notification payload as it left the transport boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFrame {
    pub address: DeviceAddress,
    pub characteristic: Uuid,
    pub bytes: Vec<u8>,
    /// Arrival timestamp, milliseconds since the Unix epoch.
    pub received_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloodPressureMeasurement {
    pub address: DeviceAddress,
    /// mmHg.
    pub systolic: f64,
    /// mmHg.
    pub diastolic: f64,
    /// Beats per minute, when the frame carried a pulse field.
    pub pulse: Option<f64>,
    /// Milliseconds since the Unix epoch, stamped at arrival.
    pub timestamp: u64,
    pub valid: bool,
    pub in_normal_range: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureMeasurement {
    pub address: DeviceAddress,
    pub value: f64,
    pub unit: TemperatureUnit,
    /// Milliseconds since the Unix epoch, stamped at arrival.
    pub timestamp: u64,
    pub valid: bool,
    pub in_normal_range: bool,
}

/// A decoded measurement, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Measurement {
    BloodPressure(BloodPressureMeasurement),
    Temperature(TemperatureMeasurement),
}

impl Measurement {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Measurement::BloodPressure(_) => DeviceKind::BloodPressure,
            Measurement::Temperature(_) => DeviceKind::Thermometer,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        match self {
            Measurement::BloodPressure(m) => m.address,
            Measurement::Temperature(m) => m.address,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Measurement::BloodPressure(m) => m.valid,
            Measurement::Temperature(m) => m.valid,
        }
    }

    pub fn is_in_normal_range(&self) -> bool {
        match self {
            Measurement::BloodPressure(m) => m.in_normal_range,
            Measurement::Temperature(m) => m.in_normal_range,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Measurement::BloodPressure(m) => m.timestamp,
            Measurement::Temperature(m) => m.timestamp,
        }
    }
}
