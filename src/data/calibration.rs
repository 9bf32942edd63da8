//! Calibration data structures.
//!
//! The sensor stores two reference readings: the raw value it reports while
//! somebody is lying on the bed, and the raw value it reports while the bed
//! is empty. Occupancy is decided by which reference a reading is closer to.

/// One calibration reference as read from the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CalibrationField {
    /// The characteristic has not been read yet, or read back as zeros.
    #[default]
    Uninitialized,
    /// A calibrated reference value.
    Value(f32),
}

impl CalibrationField {
    /// Get the value if initialized.
    pub fn value(&self) -> Option<f32> {
        match self {
            Self::Uninitialized => None,
            Self::Value(v) => Some(*v),
        }
    }

    /// Check if a value is present.
    pub fn is_initialized(&self) -> bool {
        matches!(self, Self::Value(_))
    }
}

impl From<Option<f32>> for CalibrationField {
    fn from(value: Option<f32>) -> Self {
        value.map_or(Self::Uninitialized, Self::Value)
    }
}

/// The pair of calibration references for one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationPair {
    /// Raw value reported while the bed is occupied.
    pub on_bed: CalibrationField,
    /// Raw value reported while the bed is empty.
    pub not_on_bed: CalibrationField,
}

impl CalibrationPair {
    /// Create a fully initialized pair.
    pub fn new(on_bed: f32, not_on_bed: f32) -> Self {
        Self {
            on_bed: CalibrationField::Value(on_bed),
            not_on_bed: CalibrationField::Value(not_on_bed),
        }
    }

    /// Create a pair with both fields uninitialized.
    pub fn uninitialized() -> Self {
        Self::default()
    }

    /// Both references as plain values, if both are known.
    pub fn values(&self) -> Option<(f32, f32)> {
        Some((self.on_bed.value()?, self.not_on_bed.value()?))
    }

    /// Check if both fields have been initialized.
    pub fn is_initialized(&self) -> bool {
        self.on_bed.is_initialized() && self.not_on_bed.is_initialized()
    }

    /// Classify a raw reading against this pair.
    ///
    /// A reading is on-bed when it is strictly closer to the on-bed
    /// reference than to the not-on-bed reference. Until both references
    /// are known the result is [`OccupancyStatus::NotInitialized`].
    pub fn classify(&self, raw: f32) -> OccupancyStatus {
        match self.values() {
            None => OccupancyStatus::NotInitialized,
            Some((on_bed, not_on_bed)) => {
                if (on_bed - raw).abs() < (not_on_bed - raw).abs() {
                    OccupancyStatus::OnBed
                } else {
                    OccupancyStatus::NotOnBed
                }
            }
        }
    }
}

/// Bed occupancy derived from a reading and the calibration pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum OccupancyStatus {
    /// Calibration is incomplete, so no decision can be made.
    #[default]
    NotInitialized = 0,
    /// The reading is closer to the on-bed reference.
    OnBed = 1,
    /// The reading is closer to the not-on-bed reference.
    NotOnBed = 2,
}

impl OccupancyStatus {
    /// Create from the integer wire code.
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::OnBed,
            2 => Self::NotOnBed,
            _ => Self::NotInitialized,
        }
    }

    /// Convert to the integer wire code.
    pub fn to_raw(&self) -> u8 {
        *self as u8
    }

    /// Check if the status carries an occupancy decision.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::NotInitialized)
    }
}

impl std::fmt::Display for OccupancyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "Not initialized"),
            Self::OnBed => write!(f, "On bed"),
            Self::NotOnBed => write!(f, "Not on bed"),
        }
    }
}
