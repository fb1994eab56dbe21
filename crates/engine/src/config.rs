use std::time::Duration;

use vitalink_codec::NormalRanges;

/// Tunables for the ingestion engine. The defaults match the behavior the
/// pipeline is specified against; most deployments only ever touch
/// `smart_disconnect` and the normal ranges.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scanner restart attempts before the engine reports fatal.
    pub scan_restart_max: u32,
    /// Pause before each scanner restart.
    pub scan_restart_backoff: Duration,

    /// Deadline for a single connect attempt.
    pub connect_timeout: Duration,
    /// Waits between reconnect attempts, in order. When the list is
    /// exhausted the slot fails.
    pub reconnect_backoff: Vec<Duration>,
    /// Upper bound on connect attempts in flight across all devices.
    pub concurrent_connects: usize,

    /// Silence on a subscribed connection before the health probe fires.
    pub idle_probe_threshold: Duration,
    /// How often each slot checks its liveness.
    pub probe_interval: Duration,
    /// Deadline for the probe's service fetch.
    pub probe_deadline: Duration,

    /// Disconnect-and-rest cycling for hosts whose GATT cache corrupts on
    /// long-held connections. Off by default.
    pub smart_disconnect: bool,
    /// Quiet span after a valid measurement that triggers the cycle.
    pub smart_disconnect_quiet: Duration,
    /// Length of one passive window.
    pub smart_disconnect_window: Duration,
    /// Mandatory rest before the same device may reconnect.
    pub smart_disconnect_cooldown: Duration,

    /// How long a device that refused pairing is ignored before its
    /// advertisements are considered again.
    pub pairing_retry_cooldown: Duration,

    /// A candidate is re-emitted only after this window, unless its RSSI
    /// moved by at least `dedup_rssi_delta`.
    pub dedup_window: Duration,
    pub dedup_rssi_delta: i16,

    /// Broadcast capacity of the event bus.
    pub event_capacity: usize,

    /// Non-warning bounds applied by the validator.
    pub normal_ranges: NormalRanges,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_restart_max: 5,
            scan_restart_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            reconnect_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
            concurrent_connects: 5,
            idle_probe_threshold: Duration::from_secs(30),
            probe_interval: Duration::from_secs(10),
            probe_deadline: Duration::from_secs(2),
            smart_disconnect: false,
            smart_disconnect_quiet: Duration::from_secs(25),
            smart_disconnect_window: Duration::from_secs(30),
            smart_disconnect_cooldown: Duration::from_secs(5),
            pairing_retry_cooldown: Duration::from_secs(30),
            dedup_window: Duration::from_secs(2),
            dedup_rssi_delta: 8,
            event_capacity: 256,
            normal_ranges: NormalRanges::default(),
        }
    }
}
