//! Continuous scan supervision.
//!
//! Consumes the transport's advertisement stream, classifies and
//! de-duplicates candidates, and hands them to the engine's intake. A
//! dead scanner is restarted with a fixed backoff up to the configured
//! budget, after which the condition is reported fatal.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use vitalink_codec::DeviceKind;
use vitalink_transport::{BleTransport, DeviceAddress};

use crate::classify::{classify, DiscoveryDebouncer};
use crate::config::EngineConfig;
use crate::events::{DiscoveryEvent, EngineEvent, EngineStatus, EventBus};

/// A classified, de-duplicated discovery handed to the engine.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub address: DeviceAddress,
    pub kind: DeviceKind,
    pub rssi: i16,
    pub local_name: Option<String>,
}

pub(crate) enum ScanMessage {
    Candidate(Candidate),
    Fatal(String),
}

pub(crate) struct ScanTask {
    pub transport: Arc<dyn BleTransport>,
    pub config: Arc<EngineConfig>,
    pub bus: EventBus,
    pub intake: mpsc::UnboundedSender<ScanMessage>,
}

impl ScanTask {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut debouncer =
            DiscoveryDebouncer::new(self.config.dedup_window, self.config.dedup_rssi_delta);
        let mut restarts: u32 = 0;

        loop {
            if let Err(e) = self.transport.start_scan(&[]).await {
                warn!(error = %e, "scan start failed");
                if !self.backoff_or_fail(&mut restarts, &mut shutdown).await {
                    return;
                }
                continue;
            }
            info!("scanning for health peripherals");

            let mut advertisements = self.transport.advertisements();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        let _ = self.transport.stop_scan().await;
                        return;
                    }
                    advertisement = advertisements.next() => match advertisement {
                        Some(advertisement) => {
                            // A flowing stream proves the scanner recovered.
                            restarts = 0;
                            let Some(kind) = classify(&advertisement) else {
                                continue;
                            };
                            if !debouncer.should_emit(advertisement.address, advertisement.rssi) {
                                continue;
                            }
                            self.bus.publish(EngineEvent::Discovery(DiscoveryEvent {
                                address: advertisement.address,
                                kind,
                                rssi: advertisement.rssi,
                                local_name: advertisement.local_name.clone(),
                            }));
                            let candidate = Candidate {
                                address: advertisement.address,
                                kind,
                                rssi: advertisement.rssi,
                                local_name: advertisement.local_name,
                            };
                            if self.intake.send(ScanMessage::Candidate(candidate)).is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
            }

            self.bus
                .publish(EngineEvent::Engine(EngineStatus::ScannerStopped));
            if !self.backoff_or_fail(&mut restarts, &mut shutdown).await {
                return;
            }
        }
    }

    /// Returns false when the restart budget is exhausted or shutdown was
    /// requested during the backoff.
    async fn backoff_or_fail(
        &self,
        restarts: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        *restarts += 1;
        if *restarts > self.config.scan_restart_max {
            warn!(attempts = *restarts - 1, "scanner dead, giving up");
            let _ = self
                .intake
                .send(ScanMessage::Fatal("scanner dead after max restarts".into()));
            return false;
        }

        self.bus
            .publish(EngineEvent::Engine(EngineStatus::ScannerRestarting {
                attempt: *restarts,
            }));
        tokio::select! {
            _ = shutdown.changed() => false,
            _ = tokio::time::sleep(self.config.scan_restart_backoff) => true,
        }
    }
}
