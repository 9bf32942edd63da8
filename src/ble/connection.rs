//! Connection state for a bed sensor.

/// Connection state of a device controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the sensor.
    #[default]
    Disconnected,
    /// Waiting for the link to come up.
    Connecting,
    /// Link is up, waiting for service discovery.
    DiscoveringServices,
    /// Enabling notifications and reading the calibration pair.
    ReadingCalibration,
    /// Connected, discovered, and calibration read at least once.
    Ready,
    /// Currently disconnecting.
    Disconnecting,
    /// The peripheral lacks the sensor service or one of its characteristics.
    NotSupported,
}

impl ConnectionState {
    /// Check if the link to the peripheral is up.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::DiscoveringServices | Self::ReadingCalibration | Self::Ready
        )
    }

    /// Check if the controller has finished its setup sequence.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::DiscoveringServices
                | Self::ReadingCalibration
                | Self::Disconnecting
        )
    }

    /// Check if no connection exists or is being set up.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Disconnected | Self::NotSupported)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::ReadingCalibration => write!(f, "Reading calibration"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::NotSupported => write!(f, "Not supported"),
        }
    }
}
