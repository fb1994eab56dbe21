use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical 48-bit Bluetooth device address.
///
/// Stored as raw bytes in transmission order. Display formatting (colon-hex)
/// happens only at boundaries; everything internal compares and hashes the
/// raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(pub [u8; 6]);

impl DeviceAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Build from the low 48 bits of an integer.
    pub const fn from_u64(value: u64) -> Self {
        let b = value.to_be_bytes();
        Self([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub const fn to_u64(self) -> u64 {
        let b = self.0;
        ((b[0] as u64) << 40)
            | ((b[1] as u64) << 32)
            | ((b[2] as u64) << 24)
            | ((b[3] as u64) << 16)
            | ((b[4] as u64) << 8)
            | (b[5] as u64)
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl From<[u8; 6]> for DeviceAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

/// A single received advertisement packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub services: Vec<Uuid>,
}

/// Outcome classification for GATT-level operations.
///
/// The engine's retry policies key off these, so implementations must map
/// their platform errors as faithfully as possible and reserve `Unknown`
/// for genuinely unclassifiable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    AccessDenied,
    Unreachable,
    ProtocolError,
    Unknown,
}

impl StatusCode {
    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Success => "success",
            StatusCode::AccessDenied => "access denied",
            StatusCode::Unreachable => "unreachable",
            StatusCode::ProtocolError => "protocol error",
            StatusCode::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Client Characteristic Configuration Descriptor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CccdValue {
    #[default]
    None,
    Notify,
    Indicate,
}

impl CccdValue {
    /// Wire representation per the GATT specification.
    pub const fn to_le_bytes(self) -> [u8; 2] {
        match self {
            CccdValue::None => [0x00, 0x00],
            CccdValue::Notify => [0x01, 0x00],
            CccdValue::Indicate => [0x02, 0x00],
        }
    }

    pub fn is_enabled(self) -> bool {
        !matches!(self, CccdValue::None)
    }
}

/// Subset of characteristic properties the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharProperties {
    pub notify: bool,
    pub indicate: bool,
}

impl CharProperties {
    pub fn supports_subscription(self) -> bool {
        self.notify || self.indicate
    }

    /// The descriptor value to request, preferring Indicate where supported:
    /// its link-layer ACK avoids silent losses seen with some firmware.
    pub fn preferred_cccd(self) -> Option<CccdValue> {
        if self.indicate {
            Some(CccdValue::Indicate)
        } else if self.notify {
            Some(CccdValue::Notify)
        } else {
            None
        }
    }
}

/// Link-level connection state as reported by the host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Result of a pairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingOutcome {
    Paired,
    AlreadyPaired,
    Rejected,
    Failed,
}

impl PairingOutcome {
    pub fn is_paired(self) -> bool {
        matches!(self, PairingOutcome::Paired | PairingOutcome::AlreadyPaired)
    }
}
