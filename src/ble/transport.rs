//! Transport capability consumed by the device controller.
//!
//! The controller never talks to a radio directly. It issues non-blocking
//! commands through [`Transport`] and receives completions as
//! [`TransportEvent`]s, one closed enum fed to a single transition function.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque, stable identifier of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Create an address from its platform representation.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Get the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One connection attempt to a peripheral.
///
/// Every command carries the link it belongs to and the transport tags every
/// event with it, so events from a torn-down link can be told apart from
/// those of a newer link to the same address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkId {
    address: DeviceAddress,
    generation: u64,
}

impl LinkId {
    /// Create a link identifier.
    pub fn new(address: DeviceAddress, generation: u64) -> Self {
        Self {
            address,
            generation,
        }
    }

    /// The peripheral this link goes to.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Distinguishes links to the same address.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.address, self.generation)
    }
}

/// A GATT service and the characteristics found in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristic UUIDs exposed by the service.
    pub characteristics: Vec<Uuid>,
}

impl ServiceInfo {
    /// Create a new service description.
    pub fn new(uuid: Uuid, characteristics: Vec<Uuid>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    /// Check if the service exposes a characteristic.
    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.contains(uuid)
    }
}

/// Failure reported by the transport for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    /// Description of the failure.
    pub reason: String,
}

impl TransportFailure {
    /// Create a failure with a description.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl From<TransportFailure> for Error {
    fn from(value: TransportFailure) -> Self {
        Error::Transport {
            reason: value.reason,
        }
    }
}

impl From<Error> for TransportFailure {
    fn from(value: Error) -> Self {
        Self::new(value.to_string())
    }
}

/// Asynchronous completion or notification from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The link to the peripheral is up.
    Connected,
    /// The link is down, whether requested or not.
    Disconnected,
    /// Service discovery finished.
    ServicesDiscovered(std::result::Result<Vec<ServiceInfo>, TransportFailure>),
    /// Notifications were enabled on a characteristic.
    NotificationsEnabled {
        /// The characteristic notifications were requested for.
        characteristic: Uuid,
        /// Outcome of the configuration descriptor write.
        result: std::result::Result<(), TransportFailure>,
    },
    /// A notified characteristic changed value.
    CharacteristicChanged {
        /// The characteristic that changed.
        characteristic: Uuid,
        /// The new value.
        value: Bytes,
    },
    /// A characteristic read finished.
    CharacteristicRead {
        /// The characteristic that was read.
        characteristic: Uuid,
        /// The value, or the failure.
        result: std::result::Result<Bytes, TransportFailure>,
    },
    /// A characteristic write finished.
    CharacteristicWrite {
        /// The characteristic that was written.
        characteristic: Uuid,
        /// Outcome of the write.
        result: std::result::Result<(), TransportFailure>,
    },
}

impl TransportEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::ServicesDiscovered(_) => "ServicesDiscovered",
            Self::NotificationsEnabled { .. } => "NotificationsEnabled",
            Self::CharacteristicChanged { .. } => "CharacteristicChanged",
            Self::CharacteristicRead { .. } => "CharacteristicRead",
            Self::CharacteristicWrite { .. } => "CharacteristicWrite",
        }
    }
}

/// Commands a BLE stack must accept on behalf of a device controller.
///
/// Every method returns as soon as the command is issued. An `Err` means the
/// command was refused outright; otherwise the outcome arrives later as a
/// [`TransportEvent`] tagged with the same link.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Open a connection to a peripheral.
    fn connect(&self, link: &LinkId) -> Result<()>;

    /// Discover the peripheral's services and characteristics.
    fn discover_services(&self, link: &LinkId) -> Result<()>;

    /// Enable notifications on a characteristic.
    fn enable_notifications(&self, link: &LinkId, characteristic: Uuid) -> Result<()>;

    /// Read a characteristic value.
    fn read_characteristic(&self, link: &LinkId, characteristic: Uuid) -> Result<()>;

    /// Write a characteristic value, with response.
    fn write_characteristic(
        &self,
        link: &LinkId,
        characteristic: Uuid,
        value: Bytes,
    ) -> Result<()>;

    /// Close the connection.
    fn disconnect(&self, link: &LinkId) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn connect(&self, link: &LinkId) -> Result<()> {
        (**self).connect(link)
    }

    fn discover_services(&self, link: &LinkId) -> Result<()> {
        (**self).discover_services(link)
    }

    fn enable_notifications(&self, link: &LinkId, characteristic: Uuid) -> Result<()> {
        (**self).enable_notifications(link, characteristic)
    }

    fn read_characteristic(&self, link: &LinkId, characteristic: Uuid) -> Result<()> {
        (**self).read_characteristic(link, characteristic)
    }

    fn write_characteristic(
        &self,
        link: &LinkId,
        characteristic: Uuid,
        value: Bytes,
    ) -> Result<()> {
        (**self).write_characteristic(link, characteristic, value)
    }

    fn disconnect(&self, link: &LinkId) -> Result<()> {
        (**self).disconnect(link)
    }
}
