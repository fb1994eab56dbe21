//! Health Thermometer (0x2A1C / 0x2A1E) frame decoding.
//!
//! Strict IEEE 11073 parsing alone silently drops several consumer-grade
//! thermometers that advertise the standard service but pack the payload
//! as raw centi- or deci-degrees. Parsing therefore walks a strategy
//! ladder and accepts the first plausible reading.

use bitflags::bitflags;

use crate::error::{DecodeError, Result};
use crate::measurement::{RawFrame, TemperatureMeasurement, TemperatureUnit};
use crate::sfloat::{decode_float32, decode_sfloat, float32_at, sfloat_at};

bitflags! {
    /// Flags octet of the Temperature Measurement characteristic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TempFlags: u8 {
        const FAHRENHEIT = 1 << 0;
        const TIMESTAMP_PRESENT = 1 << 1;
        const TEMPERATURE_TYPE_PRESENT = 1 << 2;
    }
}

const MIN_FRAME_LEN: usize = 5;

/// A candidate reading is plausible when it is a finite body-adjacent
/// magnitude; the validator applies the real medical bounds afterwards.
fn plausible(value: f64) -> bool {
    value.is_finite() && value > 0.0 && value <= 100.0
}

fn parse_value(bytes: &[u8]) -> Option<f64> {
    // 1. IEEE 11073 FLOAT at bytes 1-4.
    if let Some(raw) = float32_at(bytes, 1) {
        let value = decode_float32(raw);
        if plausible(value) {
            return Some(value);
        }
        tracing::trace!(value, "float32 strategy rejected");
    }

    // 2. IEEE 11073 SFLOAT at bytes 1-2.
    if let Some(raw) = sfloat_at(bytes, 1) {
        let value = decode_sfloat(raw);
        if plausible(value) {
            return Some(value);
        }
        tracing::trace!(value, "sfloat strategy rejected");
    }

    // 3. Raw little-endian u16: deci-degrees, then centi-degrees.
    if let Some(raw) = sfloat_at(bytes, 1) {
        let deci = f64::from(raw) / 10.0;
        if plausible(deci) {
            return Some(deci);
        }
        let centi = f64::from(raw) / 100.0;
        if plausible(centi) {
            return Some(centi);
        }
    }

    // 4. Integer degrees plus tenths.
    if bytes.len() >= 3 {
        let value = f64::from(bytes[1]) + f64::from(bytes[2]) / 10.0;
        if plausible(value) {
            return Some(value);
        }
    }

    None
}

pub fn decode_temperature(frame: &RawFrame) -> Result<TemperatureMeasurement> {
    let bytes = &frame.bytes;
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort {
            len: bytes.len(),
            min: MIN_FRAME_LEN,
        });
    }

    let flags = TempFlags::from_bits_retain(bytes[0]);
    let unit = if flags.contains(TempFlags::FAHRENHEIT) {
        TemperatureUnit::Fahrenheit
    } else {
        TemperatureUnit::Celsius
    };

    let value = parse_value(bytes).ok_or(DecodeError::NoPlausibleValue)?;

    Ok(TemperatureMeasurement {
        address: frame.address,
        value,
        unit,
        timestamp: frame.received_at,
        valid: true,
        in_normal_range: true,
    })
}
