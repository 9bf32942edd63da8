//! Error types for the bedsense-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No peripheral with the given address is known to the adapter.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// A characteristic payload had the wrong shape.
    #[error("Invalid payload: expected {expected} bytes, got {actual}")]
    InvalidPayload {
        /// The expected payload length.
        expected: usize,
        /// The length that was received.
        actual: usize,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The transport refused or failed a command.
    #[error("Transport error: {reason}")]
    Transport {
        /// Description of the failure.
        reason: String,
    },

    /// The broker service is no longer running.
    #[error("Broker channel closed")]
    ChannelClosed,
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_payload_message() {
        let err = Error::InvalidPayload {
            expected: 4,
            actual: 3,
        };
        assert_eq!(err.to_string(), "Invalid payload: expected 4 bytes, got 3");
    }

    #[test]
    fn test_device_not_found_message() {
        let err = Error::DeviceNotFound {
            address: "AA:BB".to_string(),
        };
        assert_eq!(err.to_string(), "Device not found: AA:BB");
    }
}
