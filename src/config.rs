//! Tunable parameters for controllers and the broker.

use std::time::Duration;

/// Settings for a single device controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControllerConfig {
    /// How long to wait for the link to come up after `connect()`.
    pub connect_timeout: Duration,
    /// Attempts per protocol step before the sequence is reported stalled.
    pub max_attempts: u32,
}

impl ControllerConfig {
    /// Default connection deadline (10 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default attempts per protocol step.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Set the connection deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the attempts per protocol step. Values below one are raised to one.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Settings for the broker service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BrokerConfig {
    /// Settings applied to every controller the broker creates.
    pub controller: ControllerConfig,
    /// How often the service checks connection deadlines.
    pub tick_interval: TickInterval,
}

impl BrokerConfig {
    /// Set the controller settings.
    pub fn with_controller(mut self, controller: ControllerConfig) -> Self {
        self.controller = controller;
        self
    }

    /// Set the deadline polling interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = TickInterval(interval);
        self
    }
}

/// Deadline polling interval (250 ms by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TickInterval(pub Duration);

impl Default for TickInterval {
    fn default() -> Self {
        Self(Duration::from_millis(250))
    }
}

impl From<TickInterval> for Duration {
    fn from(value: TickInterval) -> Self {
        value.0
    }
}
