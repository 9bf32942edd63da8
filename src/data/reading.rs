//! Sensor reading data structures.

use crate::data::calibration::OccupancyStatus;

/// One value notification from the sensor, already classified.
///
/// Readings are dispatched as they arrive and never buffered; delivery
/// order is the only timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorReading {
    /// The raw value decoded from the characteristic.
    pub raw: f32,
    /// Occupancy derived from the calibration pair at the time of arrival.
    pub status: OccupancyStatus,
}

impl SensorReading {
    /// Create a new reading.
    pub fn new(raw: f32, status: OccupancyStatus) -> Self {
        Self { raw, status }
    }
}
