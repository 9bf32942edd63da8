//! Notification broker.
//!
//! Lets any number of subscribers observe the same sensor without each owning
//! a connection. The broker owns one [`DeviceController`] per address, creates
//! it on first interest and tears it down when the last subscriber leaves or
//! the connection ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::ble::connection::ConnectionState;
use crate::ble::transport::{DeviceAddress, LinkId, Transport, TransportEvent};
use crate::config::ControllerConfig;
use crate::controller::{ControllerEvent, DeviceController};
use crate::data::{CalibrationPair, OccupancyStatus};

/// Opaque identity of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Create an identifier from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subscriber#{}", self.0)
    }
}

/// A stream a subscriber can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Sensor readings.
    Values,
    /// Committed calibration pairs.
    Calibration,
}

/// The set of streams a subscriber receives.
///
/// Connection lifecycle events are delivered regardless of interests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterestSet {
    values: bool,
    calibration: bool,
}

impl InterestSet {
    /// Every stream.
    pub fn all() -> Self {
        Self {
            values: true,
            calibration: true,
        }
    }

    /// A single stream.
    pub fn only(interest: Interest) -> Self {
        Self::none().with(interest)
    }

    /// No optional streams, lifecycle events only.
    pub fn none() -> Self {
        Self {
            values: false,
            calibration: false,
        }
    }

    /// Add a stream.
    pub fn with(mut self, interest: Interest) -> Self {
        match interest {
            Interest::Values => self.values = true,
            Interest::Calibration => self.calibration = true,
        }
        self
    }

    /// Check if a stream is included.
    pub fn contains(&self, interest: Interest) -> bool {
        match interest {
            Interest::Values => self.values,
            Interest::Calibration => self.calibration,
        }
    }
}

impl Default for InterestSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Event delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClientEvent {
    /// The sensor finished setup and is streaming.
    DeviceConnected,
    /// The connection closed.
    DeviceDisconnected,
    /// The peripheral is not a bed sensor.
    DeviceNotSupported,
    /// The peripheral could not be reached in time.
    ConnectionTimeout,
    /// A classified reading.
    SensorValue {
        /// Raw sensor value.
        raw: f32,
        /// Occupancy derived from the calibration pair.
        status: OccupancyStatus,
    },
    /// The calibration pair stored on the sensor.
    CalibrationCommitted {
        /// On-bed reference.
        on_bed: f32,
        /// Not-on-bed reference.
        not_on_bed: f32,
    },
    /// The sensor stopped answering protocol requests.
    ProtocolStalled,
}

impl ClientEvent {
    /// Check if this event ends the subscription to its device.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DeviceDisconnected | Self::DeviceNotSupported | Self::ConnectionTimeout
        )
    }

    /// The optional stream this event belongs to, if any.
    pub fn interest(&self) -> Option<Interest> {
        match self {
            Self::SensorValue { .. } => Some(Interest::Values),
            Self::CalibrationCommitted { .. } => Some(Interest::Calibration),
            _ => None,
        }
    }

    fn from_controller(event: ControllerEvent) -> Option<Self> {
        Some(match event {
            ControllerEvent::Connected => Self::DeviceConnected,
            ControllerEvent::Disconnected => Self::DeviceDisconnected,
            ControllerEvent::DeviceNotSupported => Self::DeviceNotSupported,
            ControllerEvent::ConnectionTimeout => Self::ConnectionTimeout,
            ControllerEvent::ProtocolStalled => Self::ProtocolStalled,
            ControllerEvent::ValueChanged(reading) => Self::SensorValue {
                raw: reading.raw,
                status: reading.status,
            },
            ControllerEvent::CalibrationUpdated(pair) => {
                let (on_bed, not_on_bed) = pair.values()?;
                Self::CalibrationCommitted { on_bed, not_on_bed }
            }
        })
    }
}

/// A client event tagged with the device it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// The device the event concerns.
    pub address: DeviceAddress,
    /// The event.
    pub event: ClientEvent,
}

/// Sending half of a subscriber's notification queue.
pub type NotificationSink = mpsc::UnboundedSender<Notification>;

/// A subscriber identity together with where its events go.
///
/// Two handles are equal when their identities are equal.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: SubscriberId,
    sink: NotificationSink,
}

impl SubscriberHandle {
    /// Create a handle.
    pub fn new(id: SubscriberId, sink: NotificationSink) -> Self {
        Self { id, sink }
    }

    /// Get the subscriber identity.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    fn deliver(&self, address: &DeviceAddress, event: ClientEvent) -> bool {
        self.sink
            .send(Notification {
                address: address.clone(),
                event,
            })
            .is_ok()
    }
}

impl PartialEq for SubscriberHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubscriberHandle {}

struct Registration {
    handle: SubscriberHandle,
    interests: InterestSet,
}

struct DeviceEntry<T: Transport> {
    controller: DeviceController<Arc<T>>,
    subscribers: Vec<Registration>,
}

/// Multiplexes device controllers to subscribers.
pub struct NotificationBroker<T: Transport> {
    /// Transport shared by every controller.
    transport: Arc<T>,
    /// Settings for new controllers.
    config: ControllerConfig,
    /// Live controllers by address.
    devices: HashMap<DeviceAddress, DeviceEntry<T>>,
    /// Generation of the most recently created link.
    last_generation: u64,
}

impl<T: Transport> NotificationBroker<T> {
    /// Create an empty broker.
    pub fn new(transport: Arc<T>, config: ControllerConfig) -> Self {
        Self {
            transport,
            config,
            devices: HashMap::new(),
            last_generation: 0,
        }
    }

    // === Queries ===

    /// Number of devices with a live controller.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Check if a controller exists for an address.
    pub fn has_device(&self, address: &DeviceAddress) -> bool {
        self.devices.contains_key(address)
    }

    /// Connection state of the controller for an address.
    pub fn connection_state(&self, address: &DeviceAddress) -> Option<ConnectionState> {
        self.devices.get(address).map(|e| e.controller.state())
    }

    /// The link of the controller for an address.
    pub fn link(&self, address: &DeviceAddress) -> Option<LinkId> {
        self.devices.get(address).map(|e| e.controller.link().clone())
    }

    /// Last calibration read for an address.
    pub fn calibration(&self, address: &DeviceAddress) -> Option<CalibrationPair> {
        self.devices.get(address).map(|e| e.controller.calibration())
    }

    /// Number of subscribers registered for an address.
    pub fn subscriber_count(&self, address: &DeviceAddress) -> usize {
        self.devices
            .get(address)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    /// Earliest pending connection deadline across all controllers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.devices
            .values()
            .filter_map(|e| e.controller.connect_deadline())
            .min()
    }

    // === Requests ===

    /// Register a subscriber for an address, connecting if needed.
    ///
    /// Subscribing again with the same identity only updates its interests.
    pub fn subscribe(
        &mut self,
        handle: SubscriberHandle,
        address: DeviceAddress,
        interests: InterestSet,
    ) {
        let created = !self.devices.contains_key(&address);
        if created {
            self.last_generation += 1;
            let link = LinkId::new(address.clone(), self.last_generation);
            info!("Creating controller for {}", link);
            self.devices.insert(
                address.clone(),
                DeviceEntry {
                    controller: DeviceController::new(link, self.transport.clone(), self.config),
                    subscribers: Vec::new(),
                },
            );
        }
        let Some(entry) = self.devices.get_mut(&address) else {
            return;
        };

        if let Some(existing) = entry
            .subscribers
            .iter_mut()
            .find(|r| r.handle == handle)
        {
            debug!("{} already subscribed to {}", handle.id, address);
            existing.interests = interests;
            return;
        }

        debug!("{} subscribed to {}", handle.id, address);

        // Late subscribers learn the current state before anything else.
        if entry.controller.is_ready() {
            let mut delivered = handle.deliver(&address, ClientEvent::DeviceConnected);
            if interests.contains(Interest::Calibration) {
                if let Some((on_bed, not_on_bed)) = entry.controller.calibration().values() {
                    delivered &= handle.deliver(
                        &address,
                        ClientEvent::CalibrationCommitted { on_bed, not_on_bed },
                    );
                }
            }
            if !delivered {
                warn!("{} went away while subscribing", handle.id);
                if created {
                    self.devices.remove(&address);
                }
                return;
            }
        }

        entry.subscribers.push(Registration { handle, interests });

        if created {
            let events = entry.controller.connect();
            self.dispatch(&address, events);
        }
    }

    /// Remove a subscriber from an address.
    ///
    /// Unknown subscribers are ignored. The controller is torn down when its
    /// last subscriber leaves.
    pub fn unsubscribe(&mut self, id: SubscriberId, address: &DeviceAddress) {
        let Some(entry) = self.devices.get_mut(address) else {
            trace!("{} unsubscribed from unknown {}", id, address);
            return;
        };

        let before = entry.subscribers.len();
        entry.subscribers.retain(|r| r.handle.id != id);
        if entry.subscribers.len() != before {
            debug!("{} unsubscribed from {}", id, address);
        }

        if entry.subscribers.is_empty() {
            self.teardown(address);
        }
    }

    /// Remove a subscriber from every address.
    pub fn unsubscribe_all(&mut self, id: SubscriberId) {
        let addresses: Vec<_> = self
            .devices
            .iter()
            .filter(|(_, e)| e.subscribers.iter().any(|r| r.handle.id == id))
            .map(|(a, _)| a.clone())
            .collect();

        for address in addresses {
            self.unsubscribe(id, &address);
        }
    }

    /// Store a calibration pair on a ready sensor.
    ///
    /// Dropped when the device is unknown, not ready, or the pair incomplete.
    pub fn set_calibration(&mut self, address: &DeviceAddress, pair: CalibrationPair) {
        let Some((on_bed, not_on_bed)) = pair.values() else {
            debug!("Ignoring incomplete calibration for {}", address);
            return;
        };

        let events = match self.devices.get_mut(address) {
            Some(entry) if entry.controller.is_ready() => {
                entry.controller.set_calibration(on_bed, not_on_bed)
            }
            Some(entry) => {
                debug!(
                    "Dropping calibration for {} while {}",
                    address,
                    entry.controller.state()
                );
                return;
            }
            None => {
                debug!("Dropping calibration for unknown {}", address);
                return;
            }
        };

        self.dispatch(address, events);
    }

    /// Read the calibration pair of a ready sensor again.
    pub fn refresh_calibration(&mut self, address: &DeviceAddress) {
        let Some(entry) = self.devices.get_mut(address) else {
            return;
        };
        let events = entry.controller.refresh_calibration();
        self.dispatch(address, events);
    }

    /// Route a transport event to its controller.
    ///
    /// Events from any link other than the controller's current one are
    /// dropped.
    pub fn handle_transport_event(&mut self, link: &LinkId, event: TransportEvent) {
        let address = link.address();
        let Some(entry) = self.devices.get_mut(address) else {
            trace!("Dropping {} for unknown {}", event.kind(), link);
            return;
        };
        if entry.controller.link() != link {
            debug!(
                "Dropping {} from stale link {}, current is {}",
                event.kind(),
                link,
                entry.controller.link()
            );
            return;
        }

        let events = entry.controller.handle_event(event);
        self.dispatch(address, events);
    }

    /// Expire connection attempts past their deadline.
    pub fn poll_timeouts(&mut self, now: Instant) {
        let expired: Vec<_> = self
            .devices
            .iter()
            .filter(|(_, e)| e.controller.connect_deadline().is_some_and(|d| now >= d))
            .map(|(a, _)| a.clone())
            .collect();

        for address in expired {
            if let Some(entry) = self.devices.get_mut(&address) {
                let events = entry.controller.poll_timeout(now);
                self.dispatch(&address, events);
            }
        }
    }

    /// Disconnect every controller and tell every subscriber.
    pub fn shutdown(&mut self) {
        info!("Shutting down broker with {} devices", self.devices.len());

        for (address, mut entry) in self.devices.drain() {
            entry.controller.disconnect();
            for registration in &entry.subscribers {
                registration
                    .handle
                    .deliver(&address, ClientEvent::DeviceDisconnected);
            }
        }
    }

    // === Internal ===

    /// Deliver controller events to the subscribers of an address.
    fn dispatch(&mut self, address: &DeviceAddress, events: Vec<ControllerEvent>) {
        for event in events {
            let Some(entry) = self.devices.get_mut(address) else {
                return;
            };
            let Some(client_event) = ClientEvent::from_controller(event) else {
                continue;
            };

            entry.subscribers.retain(|registration| {
                let wanted = client_event
                    .interest()
                    .map_or(true, |i| registration.interests.contains(i));
                if !wanted || registration.handle.deliver(address, client_event) {
                    return true;
                }
                warn!(
                    "Pruning {} from {}: receiver closed",
                    registration.handle.id, address
                );
                false
            });

            if client_event.is_terminal() {
                info!("{} ended with {:?}", address, client_event);
                self.devices.remove(address);
                return;
            }

            if entry.subscribers.is_empty() {
                self.teardown(address);
                return;
            }
        }
    }

    fn teardown(&mut self, address: &DeviceAddress) {
        if let Some(mut entry) = self.devices.remove(address) {
            info!("No subscribers left for {}, disconnecting", address);
            // Nobody is left to hear about the disconnect.
            entry.controller.disconnect();
        }
    }
}

impl<T: Transport> std::fmt::Debug for NotificationBroker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBroker")
            .field("devices", &self.devices.len())
            .finish()
    }
}
