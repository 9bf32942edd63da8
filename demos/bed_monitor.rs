//! Bed occupancy monitor example
//!
//! Scans for nearby sensors, connects to one and prints every reading
//! together with its occupancy classification.
//!
//! Run with: cargo run --example bed_monitor
//!
//! To connect to a specific sensor:
//!   cargo run --example bed_monitor -- --address AA:BB:CC:DD:EE:FF

use bedsense_ble::{
    BleScanner, BrokerConfig, BrokerService, BtleplugTransport, ClientEvent, Error, Result,
    Scanner,
};
use bedsense_ble::ble::DEFAULT_SCAN_DURATION;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,bedsense_ble=info")
        .init();

    println!("Bed Occupancy Monitor");
    println!("=====================\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let target = args
        .iter()
        .position(|arg| arg == "--address")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let address = match target {
        Some(address) => address,
        None => {
            println!("Scanning for {:?}...\n", DEFAULT_SCAN_DURATION);
            let scanner = BleScanner::new().await?;
            let devices = scanner.scan(DEFAULT_SCAN_DURATION).await?;

            for device in &devices {
                println!(
                    "  {} {:<24} {:>5} dBm{}",
                    device.address,
                    device.display_name(),
                    device.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".into()),
                    if device.advertises_sensor_service { "  [sensor]" } else { "" }
                );
            }
            println!();

            devices
                .iter()
                .find(|d| d.advertises_sensor_service)
                .or_else(|| devices.first())
                .map(|d| d.address.to_string())
                .ok_or_else(|| Error::DeviceNotFound {
                    address: "any".to_string(),
                })?
        }
    };

    let (transport, events) = BtleplugTransport::new().await?;
    let broker = BrokerService::spawn(Arc::new(transport), events, BrokerConfig::default());
    let mut client = broker.bind();

    println!("Connecting to {}...\n", address);
    client.connect(address.as_str())?;

    loop {
        tokio::select! {
            event = client.next_event() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::DeviceConnected => println!("Connected"),
                    ClientEvent::CalibrationCommitted { on_bed, not_on_bed } => {
                        println!("Calibration: on bed {:.3}, not on bed {:.3}", on_bed, not_on_bed);
                    }
                    ClientEvent::SensorValue { raw, status } => {
                        println!("{:>10.3}  {}", raw, status);
                    }
                    ClientEvent::ProtocolStalled => {
                        println!("Sensor stopped answering calibration requests");
                    }
                    ClientEvent::DeviceNotSupported => {
                        println!("{} is not a bed sensor", address);
                        break;
                    }
                    ClientEvent::ConnectionTimeout => {
                        println!("Timed out connecting to {}", address);
                        break;
                    }
                    ClientEvent::DeviceDisconnected => {
                        println!("Disconnected");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping...");
                break;
            }
        }
    }

    drop(client);
    broker.shutdown().await?;

    Ok(())
}
