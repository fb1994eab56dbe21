//! Medical plausibility validation.
//!
//! Two layers of bounds: the acceptance bounds decide `valid` (readings
//! outside them are physiologically impossible or sensor garbage), and
//! the configurable normal ranges decide `in_normal_range` (readings a
//! consumer may want to surface with a warning). Invalid measurements
//! are still delivered, flagged.

use serde::{Deserialize, Serialize};

use crate::measurement::{
    BloodPressureMeasurement, Measurement, TemperatureMeasurement, TemperatureUnit,
};

// Acceptance bounds.
pub const SYSTOLIC_MIN: f64 = 50.0;
pub const SYSTOLIC_MAX: f64 = 300.0;
pub const DIASTOLIC_MIN: f64 = 30.0;
pub const DIASTOLIC_MAX: f64 = 200.0;
pub const PULSE_MIN: f64 = 30.0;
pub const PULSE_MAX: f64 = 220.0;
pub const CELSIUS_MIN: f64 = 25.0;
pub const CELSIUS_MAX: f64 = 50.0;
pub const FAHRENHEIT_MIN: f64 = 77.0;
pub const FAHRENHEIT_MAX: f64 = 122.0;

fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Non-warning bounds; readings outside them are delivered with
/// `in_normal_range = false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalRanges {
    pub systolic: (f64, f64),
    pub diastolic: (f64, f64),
    pub pulse: (f64, f64),
    /// Celsius; the Fahrenheit window is derived by conversion.
    pub temperature: (f64, f64),
}

impl Default for NormalRanges {
    fn default() -> Self {
        Self {
            systolic: (90.0, 140.0),
            diastolic: (60.0, 90.0),
            pulse: (60.0, 100.0),
            temperature: (36.0, 37.5),
        }
    }
}

fn within(range: (f64, f64), value: f64) -> bool {
    value >= range.0 && value <= range.1
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    normal: NormalRanges,
}

impl Validator {
    pub fn new(normal: NormalRanges) -> Self {
        Self { normal }
    }

    /// Record validity and normal-range flags on the measurement.
    pub fn assess(&self, measurement: &mut Measurement) {
        match measurement {
            Measurement::BloodPressure(m) => self.assess_blood_pressure(m),
            Measurement::Temperature(m) => self.assess_temperature(m),
        }
    }

    fn assess_blood_pressure(&self, m: &mut BloodPressureMeasurement) {
        let pulse_valid = m
            .pulse
            .map_or(true, |p| within((PULSE_MIN, PULSE_MAX), p));
        m.valid = within((SYSTOLIC_MIN, SYSTOLIC_MAX), m.systolic)
            && within((DIASTOLIC_MIN, DIASTOLIC_MAX), m.diastolic)
            && m.systolic > m.diastolic
            && pulse_valid;

        let pulse_normal = m.pulse.map_or(true, |p| within(self.normal.pulse, p));
        m.in_normal_range = m.valid
            && within(self.normal.systolic, m.systolic)
            && within(self.normal.diastolic, m.diastolic)
            && pulse_normal;
    }

    fn assess_temperature(&self, m: &mut TemperatureMeasurement) {
        let (accept, normal) = match m.unit {
            TemperatureUnit::Celsius => ((CELSIUS_MIN, CELSIUS_MAX), self.normal.temperature),
            TemperatureUnit::Fahrenheit => (
                (FAHRENHEIT_MIN, FAHRENHEIT_MAX),
                (
                    celsius_to_fahrenheit(self.normal.temperature.0),
                    celsius_to_fahrenheit(self.normal.temperature.1),
                ),
            ),
        };
        m.valid = within(accept, m.value);
        m.in_normal_range = m.valid && within(normal, m.value);
    }
}
