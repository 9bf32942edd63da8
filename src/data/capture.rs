//! Interactive calibration capture.
//!
//! The user first gets off the bed and confirms, then lies down and
//! confirms. Each confirmation
//! records the most recent raw reading.

use crate::data::calibration::CalibrationPair;

/// Which reference the capture is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureStep {
    /// No reading seen yet; nothing can be confirmed.
    WaitingForReading,
    /// Waiting for the user to confirm the bed is empty.
    NotOnBed,
    /// Waiting for the user to confirm they are lying on the bed.
    OnBed,
    /// Both references captured.
    Complete,
}

/// Collects a calibration pair from live readings.
#[derive(Debug, Clone, Default)]
pub struct CalibrationCapture {
    current: Option<f32>,
    not_on_bed: Option<f32>,
    on_bed: Option<f32>,
}

impl CalibrationCapture {
    /// Start a new capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the latest raw reading.
    pub fn observe(&mut self, raw: f32) {
        self.current = Some(raw);
    }

    /// The step the capture is at.
    pub fn step(&self) -> CaptureStep {
        match (self.current, self.not_on_bed, self.on_bed) {
            (_, Some(_), Some(_)) => CaptureStep::Complete,
            (None, _, _) => CaptureStep::WaitingForReading,
            (Some(_), None, _) => CaptureStep::NotOnBed,
            (Some(_), Some(_), None) => CaptureStep::OnBed,
        }
    }

    /// Record the latest reading for the current step.
    ///
    /// Returns the finished pair once both references are captured.
    pub fn confirm(&mut self) -> Option<CalibrationPair> {
        match self.step() {
            CaptureStep::WaitingForReading => None,
            CaptureStep::NotOnBed => {
                self.not_on_bed = self.current;
                None
            }
            CaptureStep::OnBed => {
                self.on_bed = self.current;
                self.pair()
            }
            CaptureStep::Complete => self.pair(),
        }
    }

    /// The captured pair, if complete.
    pub fn pair(&self) -> Option<CalibrationPair> {
        Some(CalibrationPair::new(self.on_bed?, self.not_on_bed?))
    }
}
