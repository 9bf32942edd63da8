//! BLE communication module.
//!
//! This module provides the transport seam the controller drives, the
//! btleplug implementation of it, and scanning for nearby sensors.

pub mod btleplug_transport;
pub mod connection;
pub mod scanner;
pub mod transport;
pub mod uuids;

#[cfg(test)]
pub(crate) mod testing;

pub use btleplug_transport::BtleplugTransport;
pub use connection::ConnectionState;
pub use scanner::{BleScanner, DiscoveredDevice, Scanner, DEFAULT_SCAN_DURATION};
pub use transport::{
    DeviceAddress, LinkId, ServiceInfo, Transport, TransportEvent, TransportFailure,
};
pub use uuids::*;
