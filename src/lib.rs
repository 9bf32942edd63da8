// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # bedsense-ble
//!
//! A cross-platform Rust library for talking to bed occupancy sensors over
//! Bluetooth Low Energy.
//!
//! A sensor streams a raw reading and stores two reference values, one taken
//! with somebody on the bed and one with the bed empty. Each reading is
//! classified by whichever reference it lies closer to.
//!
//! ## Features
//!
//! - **Device Controller**: Connection lifecycle, service validation and a
//!   retrying read/write protocol for the calibration pair
//! - **Occupancy**: Every reading tagged on bed, not on bed, or not initialized
//! - **Notification Broker**: Many subscribers share one connection per sensor;
//!   the link closes when the last one leaves
//! - **Calibration Capture**: Guided two-step capture of a new reference pair
//! - **Scanning**: List nearby peripherals to pick a sensor from
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bedsense_ble::{BrokerConfig, BrokerService, BtleplugTransport, ClientEvent, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (transport, events) = BtleplugTransport::new().await?;
//!     let broker = BrokerService::spawn(Arc::new(transport), events, BrokerConfig::default());
//!
//!     let mut client = broker.bind();
//!     client.connect("AA:BB:CC:DD:EE:FF")?;
//!
//!     while let Some(event) = client.next_event().await {
//!         match event {
//!             ClientEvent::SensorValue { raw, status } => println!("{raw:.2} {status}"),
//!             event if event.is_terminal() => break,
//!             event => println!("{event:?}"),
//!         }
//!     }
//!
//!     broker.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Peripherals are addressed by the
//! identifier CoreBluetooth assigns, not by MAC address.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod broker;
pub mod client;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod protocol;
pub mod service;

// Re-exports for convenience
pub use broker::{
    ClientEvent, Interest, InterestSet, Notification, NotificationBroker, SubscriberHandle,
    SubscriberId,
};
pub use client::ClientBinding;
pub use config::{BrokerConfig, ControllerConfig};
pub use controller::{ControllerEvent, DeviceController};
pub use error::{Error, Result};
pub use service::{BrokerHandle, BrokerService};

// Re-export commonly used types from submodules
pub use ble::{
    BleScanner, BtleplugTransport, ConnectionState, DeviceAddress, DiscoveredDevice, LinkId,
    Scanner, Transport, TransportEvent,
};
pub use data::{
    CalibrationCapture, CalibrationField, CalibrationPair, CaptureStep, OccupancyStatus,
    SensorReading,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<BrokerHandle>();
        let _ = std::any::TypeId::of::<ClientBinding>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<CalibrationPair>();
        let _ = std::any::TypeId::of::<ClientEvent>();
        let _ = std::any::TypeId::of::<LinkId>();
        let _ = std::any::TypeId::of::<DeviceController<BtleplugTransport>>();
    }

    #[test]
    fn test_occupancy_round_trip_through_exports() {
        let pair = CalibrationPair::new(20.0, 30.0);
        assert_eq!(pair.classify(21.0), OccupancyStatus::OnBed);
        assert_eq!(OccupancyStatus::from_raw(pair.classify(29.0).to_raw()), OccupancyStatus::NotOnBed);
    }
}
