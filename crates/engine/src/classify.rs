//! Advertisement classification and discovery de-duplication.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use vitalink_codec::uuids::{uuid16_of, SERVICE_BLOOD_PRESSURE, SERVICE_HEALTH_THERMOMETER};
use vitalink_codec::DeviceKind;
use vitalink_transport::{Advertisement, DeviceAddress};

const BP_NAME_HINTS: [&str; 3] = ["blood", "pressure", "bp"];
const THERMOMETER_NAME_HINTS: [&str; 2] = ["therm", "temp"];

/// Classify an advertisement, first match wins: blood-pressure service,
/// thermometer service, then case-folded local-name heuristics.
pub fn classify(advertisement: &Advertisement) -> Option<DeviceKind> {
    let shorts: Vec<u16> = advertisement
        .services
        .iter()
        .filter_map(|u| uuid16_of(*u))
        .collect();

    if shorts.contains(&SERVICE_BLOOD_PRESSURE) {
        return Some(DeviceKind::BloodPressure);
    }
    if shorts.contains(&SERVICE_HEALTH_THERMOMETER) {
        return Some(DeviceKind::Thermometer);
    }

    let name = advertisement.local_name.as_deref()?.to_lowercase();
    if BP_NAME_HINTS.iter().any(|hint| name.contains(hint)) {
        return Some(DeviceKind::BloodPressure);
    }
    if THERMOMETER_NAME_HINTS.iter().any(|hint| name.contains(hint)) {
        return Some(DeviceKind::Thermometer);
    }

    None
}

/// Suppresses duplicate discovery emissions: a candidate is re-emitted
/// only when the previous emission is older than the window or its RSSI
/// moved by at least the configured delta. Keeps the stream reactive to
/// proximity changes without flapping on host-reported duplicates.
pub struct DiscoveryDebouncer {
    window: Duration,
    rssi_delta: i16,
    seen: HashMap<DeviceAddress, (Instant, i16)>,
}

impl DiscoveryDebouncer {
    pub fn new(window: Duration, rssi_delta: i16) -> Self {
        Self {
            window,
            rssi_delta,
            seen: HashMap::new(),
        }
    }

    pub fn should_emit(&mut self, address: DeviceAddress, rssi: i16) -> bool {
        let now = Instant::now();
        match self.seen.get(&address) {
            Some((at, prior_rssi))
                if now.duration_since(*at) < self.window
                    && (rssi - prior_rssi).abs() < self.rssi_delta =>
            {
                false
            }
            _ => {
                self.seen.insert(address, (now, rssi));
                true
            }
        }
    }
}
