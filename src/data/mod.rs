//! Data structures for sensor data.
//!
//! This module contains the calibration pair, occupancy classification,
//! per-notification readings, and the interactive calibration capture.

pub mod calibration;
pub mod capture;
pub mod reading;

pub use calibration::{CalibrationField, CalibrationPair, OccupancyStatus};
pub use capture::{CalibrationCapture, CaptureStep};
pub use reading::SensorReading;
