//! Calibration example
//!
//! Walks through capturing a new calibration pair: one reading with the bed
//! empty, one with somebody lying on it. The pair is then written to the
//! sensor and read back.
//!
//! Run with: cargo run --example calibrate -- --address AA:BB:CC:DD:EE:FF

use bedsense_ble::{
    BrokerConfig, BrokerService, BtleplugTransport, CalibrationCapture, CaptureStep, ClientEvent,
    Error, Result,
};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,bedsense_ble=debug")
        .init();

    println!("Sensor Calibration");
    println!("==================\n");

    let args: Vec<String> = std::env::args().collect();
    let address = args
        .iter()
        .position(|arg| arg == "--address")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .ok_or_else(|| Error::DeviceNotFound {
            address: "pass --address".to_string(),
        })?;

    let (transport, events) = BtleplugTransport::new().await?;
    let broker = BrokerService::spawn(Arc::new(transport), events, BrokerConfig::default());
    let mut client = broker.bind();
    client.connect(address.as_str())?;

    let mut capture = CalibrationCapture::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut prompted = None;

    loop {
        if capture.step() != CaptureStep::WaitingForReading && prompted != Some(capture.step()) {
            prompted = Some(capture.step());
            match capture.step() {
                CaptureStep::NotOnBed => print!("Leave the bed empty and press Enter... "),
                CaptureStep::OnBed => print!("Lie on the bed and press Enter... "),
                CaptureStep::Complete | CaptureStep::WaitingForReading => {}
            }
            let _ = std::io::stdout().flush();
        }

        tokio::select! {
            event = client.next_event() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::DeviceConnected => println!("Connected to {}\n", address),
                    ClientEvent::SensorValue { raw, .. } => capture.observe(raw),
                    ClientEvent::CalibrationCommitted { on_bed, not_on_bed } => {
                        if capture.step() == CaptureStep::Complete {
                            println!("Sensor stored on bed {:.3}, not on bed {:.3}", on_bed, not_on_bed);
                            break;
                        }
                        println!("Current calibration: on bed {:.3}, not on bed {:.3}", on_bed, not_on_bed);
                    }
                    ClientEvent::ProtocolStalled => {
                        println!("Sensor did not accept the calibration");
                        break;
                    }
                    event if event.is_terminal() => {
                        println!("Connection ended: {:?}", event);
                        break;
                    }
                    _ => {}
                }
            }
            line = stdin.next_line(), if capture.step() != CaptureStep::WaitingForReading => {
                if line.ok().flatten().is_none() {
                    break;
                }
                if let Some(pair) = capture.confirm() {
                    if let Some((on_bed, not_on_bed)) = pair.values() {
                        println!("Writing on bed {:.3}, not on bed {:.3}...", on_bed, not_on_bed);
                        client.set_calibration(on_bed, not_on_bed)?;
                    }
                }
            }
        }
    }

    drop(client);
    broker.shutdown().await?;

    Ok(())
}
