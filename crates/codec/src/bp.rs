//! Blood Pressure Measurement (0x2A35) frame decoding.
//!
//! Layout per IEEE 11073-10407: flags byte, systolic and diastolic as
//! SFLOAT at bytes 1-2 and 3-4. The pulse field position varies across
//! firmware: long frames carry it at bytes 13-14, while a known short
//! variant packs it at bytes 5-6 where a conformant frame would carry
//! MAP. The 5-6 fallback is therefore taken only when the flags byte
//! says a pulse is present and no timestamp shifted the layout.

use bitflags::bitflags;

use crate::error::{DecodeError, Result};
use crate::measurement::{BloodPressureMeasurement, RawFrame};
use crate::sfloat::{decode_sfloat, sfloat_at, sfloat_mantissa};
use crate::validate;

bitflags! {
    /// Flags octet of the Blood Pressure Measurement characteristic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BpFlags: u8 {
        const UNIT_KPA = 1 << 0;
        const TIMESTAMP_PRESENT = 1 << 1;
        const PULSE_RATE_PRESENT = 1 << 2;
        const USER_ID_PRESENT = 1 << 3;
        const MEASUREMENT_STATUS_PRESENT = 1 << 4;
    }
}

const MIN_FRAME_LEN: usize = 7;
/// Frames at least this long carry the pulse at bytes 13-14.
const LONG_FRAME_LEN: usize = 15;

/// Parse a pressure or pulse field, tolerating firmware that stores the
/// integer reading in the mantissa under a garbage exponent nibble: when
/// the strict SFLOAT value falls outside the plausible band but the bare
/// mantissa lies inside it, the mantissa wins.
fn vital_field(bytes: &[u8], offset: usize, lo: f64, hi: f64) -> Result<f64> {
    let raw = sfloat_at(bytes, offset).ok_or(DecodeError::TooShort {
        len: bytes.len(),
        min: offset + 2,
    })?;
    let strict = decode_sfloat(raw);
    if strict.is_finite() && (lo..=hi).contains(&strict) {
        return Ok(strict);
    }
    let mantissa = sfloat_mantissa(raw) as f64;
    if (lo..=hi).contains(&mantissa) {
        tracing::debug!(
            raw = format_args!("{raw:#06x}"),
            strict,
            mantissa,
            "sfloat exponent implausible, using mantissa"
        );
        return Ok(mantissa);
    }
    // Neither reading is plausible; hand the strict value to the
    // validator rather than dropping the frame.
    Ok(strict)
}

pub fn decode_blood_pressure(frame: &RawFrame) -> Result<BloodPressureMeasurement> {
    let bytes = &frame.bytes;
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort {
            len: bytes.len(),
            min: MIN_FRAME_LEN,
        });
    }

    let flags = BpFlags::from_bits_retain(bytes[0]);
    let systolic = vital_field(bytes, 1, validate::SYSTOLIC_MIN, validate::SYSTOLIC_MAX)?;
    let diastolic = vital_field(bytes, 3, validate::DIASTOLIC_MIN, validate::DIASTOLIC_MAX)?;

    let pulse = if bytes.len() >= LONG_FRAME_LEN {
        Some(vital_field(
            bytes,
            13,
            validate::PULSE_MIN,
            validate::PULSE_MAX,
        )?)
    } else if flags.contains(BpFlags::PULSE_RATE_PRESENT)
        && !flags.contains(BpFlags::TIMESTAMP_PRESENT)
    {
        // Short-frame variant: pulse where MAP would normally sit.
        Some(vital_field(
            bytes,
            5,
            validate::PULSE_MIN,
            validate::PULSE_MAX,
        )?)
    } else {
        None
    };

    Ok(BloodPressureMeasurement {
        address: frame.address,
        systolic,
        diastolic,
        pulse,
        timestamp: frame.received_at,
        valid: true,
        in_normal_range: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use vitalink_transport::DeviceAddress;

    fn frame(bytes: Vec<u8>) -> RawFrame {
        RawFrame {
            address: DeviceAddress::from_u64(0xA1B2C3D4E5F6),
            characteristic: Uuid::from_u128(0x2A35),
            bytes,
            received_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_standard_long_frame() {
        // flags 0x1E, sys/dia with mantissa-packed fields, pulse at 13-14.
        let m = decode_blood_pressure(&frame(vec![
            0x1E, 0x78, 0xF0, 0x50, 0xF0, 0x46, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x48,
            0xF0,
        ]))
        .unwrap();
        assert!((m.systolic - 120.0).abs() < 1e-9);
        assert!((m.diastolic - 80.0).abs() < 1e-9);
        assert!((m.pulse.unwrap() - 72.0).abs() < 1e-9);
    }

    #[test]
    fn test_exponent_zero_frame() {
        // sys 120, dia 80 with a proper zero exponent.
        let m = decode_blood_pressure(&frame(vec![0x00, 0x78, 0x00, 0x50, 0x00, 0x00, 0x00]))
            .unwrap();
        assert_eq!(m.systolic, 120.0);
        assert_eq!(m.diastolic, 80.0);
        assert_eq!(m.pulse, None);
    }

    #[test]
    fn test_short_variant_pulse_when_flagged() {
        // Pulse-present, no timestamp: bytes 5-6 are the pulse.
        let m = decode_blood_pressure(&frame(vec![0x04, 0x78, 0x00, 0x50, 0x00, 0x48, 0x00]))
            .unwrap();
        assert_eq!(m.pulse, Some(72.0));
    }

    #[test]
    fn test_short_frame_without_pulse_flag_omits_pulse() {
        // Bytes 5-6 would be MAP on a conformant device; don't misread it.
        let m = decode_blood_pressure(&frame(vec![0x00, 0x78, 0x00, 0x50, 0x00, 0x5D, 0x00]))
            .unwrap();
        assert_eq!(m.pulse, None);
    }

    #[test]
    fn test_timestamp_shifted_short_frame_omits_pulse() {
        // Pulse flag set but a timestamp shifts the layout; bytes 5-6 are
        // not the pulse in that case.
        let m = decode_blood_pressure(&frame(vec![0x06, 0x78, 0x00, 0x50, 0x00, 0xE7, 0x07]))
            .unwrap();
        assert_eq!(m.pulse, None);
    }

    #[test]
    fn test_too_short_frame_rejected() {
        let err = decode_blood_pressure(&frame(vec![0x00, 0x78, 0x00, 0x50])).unwrap_err();
        assert!(matches!(err, DecodeError::TooShort { len: 4, min: 7 }));
    }

    #[test]
    fn test_implausible_field_passed_through_for_validation() {
        // Systolic 2000 with exponent 0: neither strict nor mantissa is
        // plausible, so the strict value survives for the validator to flag.
        let m = decode_blood_pressure(&frame(vec![0x00, 0xD0, 0x07, 0x50, 0x00, 0x00, 0x00]))
            .unwrap();
        assert_eq!(m.systolic, 2000.0);
    }
}
