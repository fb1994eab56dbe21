//! Connection lifecycle: retry schedules, health probing, smart
//! disconnect cycling, scanner supervision, and engine start/stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use vitalink_codec::uuids::{ble_uuid16, CHAR_TEMPERATURE_MEASUREMENT, SERVICE_HEALTH_THERMOMETER};
use vitalink_engine::{
    EngineConfig, EngineError, EngineEvent, EngineStatus, IngestionEngine, SlotStatus,
};
use vitalink_transport::mock::{MockCharacteristic, MockDevice, MockTransport};
use vitalink_transport::{
    Advertisement, CharProperties, DeviceAddress, StatusCode, TransportError,
};

const ADDRESS: u64 = 0xA1B2C3D4E5F6;

fn adv(address: DeviceAddress) -> Advertisement {
    Advertisement {
        address,
        local_name: Some("clinical thermometer".into()),
        rssi: -58,
        services: vec![ble_uuid16(SERVICE_HEALTH_THERMOMETER)],
    }
}

fn add_thermometer(
    transport: &MockTransport,
    address: DeviceAddress,
) -> (Arc<MockDevice>, Arc<MockCharacteristic>) {
    let device = transport.add_device(address);
    let service = device.add_service(ble_uuid16(SERVICE_HEALTH_THERMOMETER));
    let characteristic = service.add_characteristic(
        ble_uuid16(CHAR_TEMPERATURE_MEASUREMENT),
        CharProperties {
            notify: true,
            indicate: true,
        },
    );
    (device, characteristic)
}

async fn next_event(rx: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(180), rx.recv())
        .await
        .expect("timed out waiting for engine event")
        .expect("event bus closed")
}

async fn drive_discovery(
    transport: &MockTransport,
    rx: &mut broadcast::Receiver<EngineEvent>,
    advertisement: Advertisement,
) {
    for _ in 0..100 {
        transport.inject_advertisement(advertisement.clone());
        if let Ok(Ok(EngineEvent::Discovery(_))) =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        {
            return;
        }
    }
    panic!("device never discovered");
}

async fn next_status(
    rx: &mut broadcast::Receiver<EngineEvent>,
    address: DeviceAddress,
) -> SlotStatus {
    loop {
        if let EngineEvent::Status(status) = next_event(rx).await {
            if status.address == address {
                return status.status;
            }
        }
    }
}

async fn wait_until_subscribed(characteristic: &MockCharacteristic) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !characteristic.cccd().is_enabled() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscription never enabled");
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_device_walks_backoff_then_fails_once() {
    let transport = Arc::new(MockTransport::new());
    let address = DeviceAddress::from_u64(ADDRESS);
    let (device, _characteristic) = add_thermometer(&transport, address);
    // Immediate attempt plus the 1 s / 2 s / 4 s schedule, all refused.
    for _ in 0..4 {
        device.fail_next_open(TransportError::Gatt(StatusCode::Unreachable));
    }

    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());
    let mut rx = engine.subscribe();
    engine.start().await.unwrap();

    drive_discovery(&transport, &mut rx, adv(address)).await;
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Failed);
    assert_eq!(engine.device_status(address), Some(SlotStatus::Failed));

    // Exactly one Failed event; the slot is terminal without a reset.
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
        assert!(
            !matches!(event, EngineEvent::Status(ref s) if s.address == address),
            "unexpected status after Failed: {event:?}"
        );
    }

    engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reset_revives_failed_slot() {
    let transport = Arc::new(MockTransport::new());
    let address = DeviceAddress::from_u64(ADDRESS);
    let (device, _characteristic) = add_thermometer(&transport, address);
    for _ in 0..4 {
        device.fail_next_open(TransportError::Gatt(StatusCode::Unreachable));
    }

    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());
    let mut rx = engine.subscribe();
    engine.start().await.unwrap();

    drive_discovery(&transport, &mut rx, adv(address)).await;
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Failed);

    engine.reset(address).unwrap();
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Disconnected);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connected);

    engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_connection_probed_and_recovered() {
    let transport = Arc::new(MockTransport::new());
    let address = DeviceAddress::from_u64(ADDRESS);
    let (device, characteristic) = add_thermometer(&transport, address);

    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());
    let mut rx = engine.subscribe();
    engine.start().await.unwrap();

    drive_discovery(&transport, &mut rx, adv(address)).await;
    let mut observed = vec![
        next_status(&mut rx, address).await,
        next_status(&mut rx, address).await,
    ];
    assert_eq!(observed, [SlotStatus::Connecting, SlotStatus::Connected]);
    wait_until_subscribed(&characteristic).await;

    // Starve the connection: the probe's fetch fails, and the teardown's
    // three cache-evicting refetches fail too. Reconnection then succeeds.
    for _ in 0..4 {
        device.fail_next_services(StatusCode::Unreachable);
    }

    observed.push(next_status(&mut rx, address).await);
    observed.push(next_status(&mut rx, address).await);
    assert_eq!(
        &observed[2..],
        [SlotStatus::Reconnecting, SlotStatus::Connected]
    );

    // The whole observed sequence walks legal automaton edges only.
    for pair in observed.windows(2) {
        assert!(
            pair[0].can_transition(pair[1]),
            "forbidden edge {:?} -> {:?}",
            pair[0],
            pair[1]
        );
    }

    engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lost_link_reconnects_with_backoff() {
    let transport = Arc::new(MockTransport::new());
    let address = DeviceAddress::from_u64(ADDRESS);
    let (device, characteristic) = add_thermometer(&transport, address);

    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());
    let mut rx = engine.subscribe();
    engine.start().await.unwrap();

    drive_discovery(&transport, &mut rx, adv(address)).await;
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connected);
    wait_until_subscribed(&characteristic).await;

    device.emit_connection_status(vitalink_transport::ConnectionStatus::Disconnected);

    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Reconnecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connected);
    // Reconnect re-opened the device and re-enabled the subscription.
    wait_until_subscribed(&characteristic).await;
    assert_eq!(device.open_count(), 2);

    engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_smart_disconnect_cycles_after_quiet_window() {
    let transport = Arc::new(MockTransport::new());
    let address = DeviceAddress::from_u64(ADDRESS);
    let (_device, characteristic) = add_thermometer(&transport, address);

    let config = EngineConfig {
        smart_disconnect: true,
        ..EngineConfig::default()
    };
    let engine = IngestionEngine::new(transport.clone(), config);
    let mut rx = engine.subscribe();
    engine.start().await.unwrap();

    drive_discovery(&transport, &mut rx, adv(address)).await;
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connected);
    wait_until_subscribed(&characteristic).await;

    // One valid measurement arms the window; nothing follows it.
    characteristic.notify(vec![0x00, 0x68, 0x01, 0x00, 0xFF]);

    // Quiet for the leading 25 s: clean disconnect, 5 s rest, reconnect.
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Disconnected);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connected);

    engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scanner_restarts_after_death() {
    let transport = Arc::new(MockTransport::new());
    let address = DeviceAddress::from_u64(ADDRESS);
    let (_device, _characteristic) = add_thermometer(&transport, address);

    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());
    let mut rx = engine.subscribe();
    engine.start().await.unwrap();

    // Let the scanner come up before killing it.
    tokio::time::timeout(Duration::from_secs(10), async {
        while !transport.is_scanning() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    transport.kill_scanner();

    let mut saw_stopped = false;
    let mut saw_restarting = false;
    loop {
        match next_event(&mut rx).await {
            EngineEvent::Engine(EngineStatus::ScannerStopped) => saw_stopped = true,
            EngineEvent::Engine(EngineStatus::ScannerRestarting { attempt }) => {
                assert_eq!(attempt, 1);
                saw_restarting = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_stopped && saw_restarting);

    // After the backoff the scanner is live again and discovery works.
    drive_discovery(&transport, &mut rx, adv(address)).await;

    engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scanner_gives_up_and_reports_fatal() {
    let transport = Arc::new(MockTransport::new());

    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());
    let mut rx = engine.subscribe();
    engine.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while !transport.is_scanning() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Every restart attempt fails to bring the scanner back.
    for _ in 0..5 {
        transport.fail_next_scan_start(TransportError::AdapterNotAvailable);
    }
    transport.kill_scanner();

    let mut restarts = 0;
    loop {
        match next_event(&mut rx).await {
            EngineEvent::Engine(EngineStatus::ScannerRestarting { .. }) => restarts += 1,
            EngineEvent::Engine(EngineStatus::Fatal { .. }) => break,
            _ => {}
        }
    }
    assert_eq!(restarts, 5);

    engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent_and_disconnect_is_idempotent() {
    let transport = Arc::new(MockTransport::new());
    let address = DeviceAddress::from_u64(ADDRESS);
    let (_device, characteristic) = add_thermometer(&transport, address);

    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());
    let mut rx = engine.subscribe();
    engine.start().await.unwrap();

    drive_discovery(&transport, &mut rx, adv(address)).await;
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connected);
    wait_until_subscribed(&characteristic).await;

    // connect on a connected slot: immediate success, no transitions.
    engine.connect(address).await.unwrap();
    assert_eq!(engine.device_status(address), Some(SlotStatus::Connected));
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        assert!(
            !matches!(event, EngineEvent::Status(ref s) if s.address == address),
            "idempotent connect produced {event:?}"
        );
    }

    engine.disconnect(address).await.unwrap();
    assert_eq!(
        engine.device_status(address),
        Some(SlotStatus::Disconnected)
    );
    // Subscriptions do not survive the disconnect.
    assert!(!characteristic.cccd().is_enabled());

    // Second disconnect: nothing left to do, still succeeds.
    engine.disconnect(address).await.unwrap();
    assert_eq!(
        engine.device_status(address),
        Some(SlotStatus::Disconnected)
    );

    // An explicit connect brings it back.
    engine.connect(address).await.unwrap();
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Disconnected);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connected);

    engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_start_stop_linearization() {
    let transport = Arc::new(MockTransport::new());
    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());

    assert!(matches!(
        engine.stop().await,
        Err(EngineError::NotRunning)
    ));

    engine.start().await.unwrap();
    assert!(matches!(
        engine.start().await,
        Err(EngineError::AlreadyRunning)
    ));

    engine.stop().await.unwrap();
    engine.start().await.unwrap();
    engine.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_runs_disconnect_contract_on_all_slots() {
    let transport = Arc::new(MockTransport::new());
    let address = DeviceAddress::from_u64(ADDRESS);
    let (device, characteristic) = add_thermometer(&transport, address);

    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());
    let mut rx = engine.subscribe();
    engine.start().await.unwrap();

    drive_discovery(&transport, &mut rx, adv(address)).await;
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connected);
    wait_until_subscribed(&characteristic).await;
    let fetches_before = device.service_fetch_count();

    engine.stop().await.unwrap();

    // Slots are destroyed on shutdown, after the disconnect contract ran:
    // CCCD cleared, redundant cache-evicting refetches, device released.
    assert_eq!(engine.device_status(address), None);
    assert!(!characteristic.cccd().is_enabled());
    assert!(device.service_fetch_count() >= fetches_before + 3);
    assert_eq!(device.release_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pairing_rejection_suppresses_device_for_cooldown() {
    let transport = Arc::new(MockTransport::new());
    let address = DeviceAddress::from_u64(ADDRESS);
    let (device, _characteristic) = add_thermometer(&transport, address);
    device.script_pair_outcome(vitalink_transport::PairingOutcome::Rejected);

    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());
    let mut rx = engine.subscribe();
    engine.start().await.unwrap();

    drive_discovery(&transport, &mut rx, adv(address)).await;
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Disconnected);

    // The slot is gone and new advertisements are ignored for the cooldown.
    assert_eq!(engine.device_status(address), None);
    assert_eq!(device.pair_attempt_count(), 1);

    transport.inject_advertisement(adv(address));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(engine.device_status(address), None);

    // After the cooldown the device is re-evaluated and pairs normally.
    tokio::time::sleep(Duration::from_secs(30)).await;
    drive_discovery(&transport, &mut rx, adv(address)).await;
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connecting);
    assert_eq!(next_status(&mut rx, address).await, SlotStatus::Connected);
    assert_eq!(device.pair_attempt_count(), 2);

    engine.stop().await.unwrap();
}
