//! Runs the ingestion engine against two simulated devices: a clinical
//! thermometer and a blood-pressure monitor, each feeding plausible
//! frames on a timer. Ctrl-C stops the engine cleanly.
//!
//! ```sh
//! cargo run -p mock-ingest
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::info;

use vitalink_codec::uuids::{
    ble_uuid16, CHAR_BLOOD_PRESSURE_MEASUREMENT, CHAR_TEMPERATURE_MEASUREMENT,
    SERVICE_BLOOD_PRESSURE, SERVICE_HEALTH_THERMOMETER,
};
use vitalink_engine::{EngineConfig, EngineEvent, IngestionEngine};
use vitalink_transport::mock::MockTransport;
use vitalink_transport::{Advertisement, CharProperties, DeviceAddress};

/// SFLOAT with exponent -1 and the value in deci-units.
fn sfloat_deci(value: f64) -> [u8; 2] {
    let mantissa = (value * 10.0).round() as i32;
    let word = 0xF000u16 | (mantissa as u16 & 0x0FFF);
    word.to_le_bytes()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vitalink_engine=debug".into()),
        )
        .init();

    let transport = Arc::new(MockTransport::new());

    let thermometer_addr = DeviceAddress::from_u64(0xA1B2C3D4E5F6);
    let thermometer = transport.add_device(thermometer_addr);
    let thermo_char = thermometer
        .add_service(ble_uuid16(SERVICE_HEALTH_THERMOMETER))
        .add_characteristic(
            ble_uuid16(CHAR_TEMPERATURE_MEASUREMENT),
            CharProperties {
                notify: true,
                indicate: true,
            },
        );

    let bp_addr = DeviceAddress::from_u64(0x112233445566);
    let bp_monitor = transport.add_device(bp_addr);
    let bp_char = bp_monitor
        .add_service(ble_uuid16(SERVICE_BLOOD_PRESSURE))
        .add_characteristic(
            ble_uuid16(CHAR_BLOOD_PRESSURE_MEASUREMENT),
            CharProperties {
                notify: false,
                indicate: true,
            },
        );

    let engine = IngestionEngine::new(transport.clone(), EngineConfig::default());
    let mut events = engine.subscribe();
    engine.start().await?;

    // Advertise both devices periodically.
    {
        let transport = transport.clone();
        tokio::spawn(async move {
            loop {
                transport.inject_advertisement(Advertisement {
                    address: thermometer_addr,
                    local_name: Some("KD ThermoBeacon".into()),
                    rssi: -55,
                    services: vec![ble_uuid16(SERVICE_HEALTH_THERMOMETER)],
                });
                transport.inject_advertisement(Advertisement {
                    address: bp_addr,
                    local_name: Some("BP Monitor".into()),
                    rssi: -61,
                    services: vec![ble_uuid16(SERVICE_BLOOD_PRESSURE)],
                });
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        });
    }

    // Feed measurements.
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let temperature = rand::thread_rng().gen_range(35.5..38.5);
            let mut frame = vec![0x00];
            frame.extend_from_slice(&sfloat_deci(temperature));
            frame.extend_from_slice(&[0x00, 0x00]);
            thermo_char.notify(frame);

            let systolic = rand::thread_rng().gen_range(100.0..160.0);
            let diastolic = rand::thread_rng().gen_range(60.0..95.0);
            let pulse = rand::thread_rng().gen_range(55.0..95.0);
            let mut frame = vec![0x1E];
            frame.extend_from_slice(&sfloat_deci(systolic));
            frame.extend_from_slice(&sfloat_deci(diastolic));
            frame.extend_from_slice(&[0x00; 8]);
            frame.extend_from_slice(&sfloat_deci(pulse));
            bp_char.notify(frame);
        }
    });

    info!("engine running, ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(EngineEvent::Measurement(m)) => info!(measurement = ?m.measurement, "measurement"),
                Ok(EngineEvent::Status(s)) => {
                    info!(address = %s.address, status = ?s.status, "status");
                }
                Ok(EngineEvent::Discovery(d)) => {
                    info!(address = %d.address, kind = %d.kind, rssi = d.rssi, "discovered");
                }
                Ok(EngineEvent::Engine(e)) => info!(engine = ?e, "engine status"),
                Err(_) => break,
            }
        }
    }

    engine.stop().await?;
    Ok(())
}
