//! Connection health monitoring.
//!
//! Hosts with slow or unreliable disconnect events leave slots that look
//! `Connected` while delivering nothing. Each slot's supervisor runs
//! [`monitor_connection`] while the link is up: it watches the transport's
//! connection events, actively probes when notifications go silent past
//! the threshold, and (when enabled) drives the smart auto-disconnect
//! cycle for hosts whose GATT caches corrupt on long-held connections.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, warn};

use vitalink_transport::{ConnectionEventStream, ConnectionStatus};

use crate::config::EngineConfig;
use crate::slot::ConnectionSlot;

const SMART_POLL_PERIOD: Duration = Duration::from_secs(1);

pub(crate) enum MonitorOutcome {
    /// The transport reported the link gone.
    LinkLost,
    /// The probe declared the connection dead.
    Unhealthy,
    /// Smart disconnect: quiet for the leading part of the window.
    SmartQuiet,
    /// Smart disconnect: the extended window ran out.
    SmartExpired,
    /// Slot stop was requested.
    Stopped,
}

/// Fetch the service catalogue under a deadline; any non-success result
/// (including the deadline) means unhealthy.
pub(crate) async fn probe_healthy(slot: &Arc<ConnectionSlot>, deadline: Duration) -> bool {
    let Some(session) = slot.session().await else {
        return false;
    };
    matches!(
        tokio::time::timeout(deadline, session.services()).await,
        Ok(Ok(_))
    )
}

pub(crate) async fn monitor_connection(
    slot: &Arc<ConnectionSlot>,
    config: &EngineConfig,
    mut events: ConnectionEventStream,
) -> MonitorOutcome {
    let mut stop = slot.stop_rx();
    if slot.is_stop_requested() {
        return MonitorOutcome::Stopped;
    }
    let mut probe_tick = tokio::time::interval(config.probe_interval);
    probe_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut smart_tick = tokio::time::interval(SMART_POLL_PERIOD);
    smart_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.changed() => return MonitorOutcome::Stopped,

            event = events.next() => match event {
                Some(ConnectionStatus::Connected) => {}
                Some(ConnectionStatus::Disconnected) | None => {
                    debug!(address = %slot.address, "link lost");
                    return MonitorOutcome::LinkLost;
                }
            },

            _ = probe_tick.tick() => {
                let silent = slot
                    .frame_age()
                    .is_some_and(|age| age > config.idle_probe_threshold);
                if slot.subscription_count() >= 1 && silent {
                    debug!(address = %slot.address, "notifications silent, probing");
                    if !probe_healthy(slot, config.probe_deadline).await {
                        warn!(address = %slot.address, "probe failed, declaring unhealthy");
                        return MonitorOutcome::Unhealthy;
                    }
                }
            },

            _ = smart_tick.tick(), if config.smart_disconnect => {
                let Some(anchor) = slot.smart_anchor() else { continue };
                let frames_continued = slot
                    .last_frame_at()
                    .is_some_and(|at| at > anchor);
                if !frames_continued && anchor.elapsed() >= config.smart_disconnect_quiet {
                    debug!(address = %slot.address, "smart disconnect: quiet window");
                    return MonitorOutcome::SmartQuiet;
                }
                if anchor.elapsed() >= config.smart_disconnect_window * 2 {
                    debug!(address = %slot.address, "smart disconnect: window expired");
                    return MonitorOutcome::SmartExpired;
                }
            },
        }
    }
}
