//! In-memory transport used by unit tests.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

use crate::ble::transport::{DeviceAddress, LinkId, ServiceInfo, Transport};
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// A command issued to the transport.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    Connect(DeviceAddress),
    DiscoverServices(DeviceAddress),
    EnableNotifications(DeviceAddress, Uuid),
    Read(DeviceAddress, Uuid),
    Write(DeviceAddress, Uuid, Bytes),
    Disconnect(DeviceAddress),
}

/// Records every command and optionally refuses some kinds.
#[derive(Debug, Default)]
pub(crate) struct RecordingTransport {
    commands: Mutex<Vec<Command>>,
    refused: Mutex<HashSet<&'static str>>,
    last_link: Mutex<Option<LinkId>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Refuse every future command of a kind ("connect", "read", ...).
    pub(crate) fn refuse(&self, kind: &'static str) {
        self.refused.lock().insert(kind);
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    /// The link of the most recent connect command.
    pub(crate) fn last_link(&self) -> Option<LinkId> {
        self.last_link.lock().clone()
    }

    pub(crate) fn take(&self) -> Vec<Command> {
        std::mem::take(&mut *self.commands.lock())
    }

    pub(crate) fn count(&self, pred: impl Fn(&Command) -> bool) -> usize {
        self.commands.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, kind: &'static str, command: Command) -> Result<()> {
        self.commands.lock().push(command);
        if self.refused.lock().contains(kind) {
            return Err(Error::Transport {
                reason: format!("{kind} refused"),
            });
        }
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn connect(&self, link: &LinkId) -> Result<()> {
        *self.last_link.lock() = Some(link.clone());
        self.record("connect", Command::Connect(link.address().clone()))
    }

    fn discover_services(&self, link: &LinkId) -> Result<()> {
        self.record("discover", Command::DiscoverServices(link.address().clone()))
    }

    fn enable_notifications(&self, link: &LinkId, characteristic: Uuid) -> Result<()> {
        self.record(
            "notify",
            Command::EnableNotifications(link.address().clone(), characteristic),
        )
    }

    fn read_characteristic(&self, link: &LinkId, characteristic: Uuid) -> Result<()> {
        self.record("read", Command::Read(link.address().clone(), characteristic))
    }

    fn write_characteristic(
        &self,
        link: &LinkId,
        characteristic: Uuid,
        value: Bytes,
    ) -> Result<()> {
        self.record("write", Command::Write(link.address().clone(), characteristic, value))
    }

    fn disconnect(&self, link: &LinkId) -> Result<()> {
        self.record("disconnect", Command::Disconnect(link.address().clone()))
    }
}

/// Services of a fully supported bed sensor.
pub(crate) fn sensor_services() -> Vec<ServiceInfo> {
    vec![
        ServiceInfo::new(
            Uuid::from_u128(0x0000_180a_0000_1000_8000_00805f9b34fb),
            vec![],
        ),
        ServiceInfo::new(SENSOR_SERVICE_UUID, REQUIRED_CHARACTERISTICS.to_vec()),
    ]
}

pub(crate) fn le(value: f32) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}
