//! Frame-to-decoder routing.

use crate::bp::decode_blood_pressure;
use crate::error::{DecodeError, Result};
use crate::measurement::{DeviceKind, Measurement, RawFrame};
use crate::temp::decode_temperature;
use crate::uuids::{uuid16_of, CHAR_BLOOD_PRESSURE_MEASUREMENT, TEMPERATURE_CHARACTERISTICS};

/// Dispatch a raw frame to the decoder for its characteristic.
///
/// Routing is by the characteristic's 16-bit alias. Frames from outside
/// the known set are still decoded as temperatures when the originating
/// device was classified as a thermometer: the subscription fallback for
/// vendor firmware subscribes characteristics we cannot enumerate ahead
/// of time. Unknown characteristics on any other device are dropped.
pub fn decode_frame(frame: &RawFrame, kind: DeviceKind) -> Result<Measurement> {
    match uuid16_of(frame.characteristic) {
        Some(CHAR_BLOOD_PRESSURE_MEASUREMENT) => {
            decode_blood_pressure(frame).map(Measurement::BloodPressure)
        }
        Some(short) if TEMPERATURE_CHARACTERISTICS.contains(&short) => {
            decode_temperature(frame).map(Measurement::Temperature)
        }
        _ if kind == DeviceKind::Thermometer => {
            tracing::debug!(
                characteristic = %frame.characteristic,
                "vendor characteristic on thermometer, trying temperature decode"
            );
            decode_temperature(frame).map(Measurement::Temperature)
        }
        _ => Err(DecodeError::UnroutableCharacteristic(frame.characteristic)),
    }
}
