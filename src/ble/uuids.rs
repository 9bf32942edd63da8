//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for bed sensor communication.

use uuid::Uuid;

// Bed Sensor Service (Nordic UART base)
/// Bed sensor primary service UUID.
pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// Sensor value characteristic UUID (Notify).
pub const SENSOR_VALUE_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);
/// On-bed calibration characteristic UUID (Read, Write).
pub const ON_BED_CALIBRATION_UUID: Uuid =
    Uuid::from_u128(0x6e40_0004_b5a3_f393_e0a9_e50e24dcca9e);
/// Not-on-bed calibration characteristic UUID (Read, Write).
pub const NOT_ON_BED_CALIBRATION_UUID: Uuid =
    Uuid::from_u128(0x6e40_0005_b5a3_f393_e0a9_e50e24dcca9e);

// Standard descriptors
/// Client Characteristic Configuration descriptor UUID.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Characteristics the sensor service must expose for the device to be usable.
pub const REQUIRED_CHARACTERISTICS: [Uuid; 3] = [
    SENSOR_VALUE_UUID,
    ON_BED_CALIBRATION_UUID,
    NOT_ON_BED_CALIBRATION_UUID,
];
