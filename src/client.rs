//! Client binding.
//!
//! The consumer-facing side of the broker: one binding follows one sensor at
//! a time and turns the broker's notifications into an ordered event stream.

use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::ble::transport::DeviceAddress;
use crate::broker::{ClientEvent, InterestSet, Notification, SubscriberHandle, SubscriberId};
use crate::data::CalibrationPair;
use crate::error::{Error, Result};
use crate::service::{BrokerHandle, Request};

/// A subscriber bound to a running broker service.
///
/// Dropping the binding unsubscribes it from every device.
pub struct ClientBinding {
    id: SubscriberId,
    broker: BrokerHandle,
    sink: mpsc::UnboundedSender<Notification>,
    notifications: mpsc::UnboundedReceiver<Notification>,
    device: Option<DeviceAddress>,
    interests: InterestSet,
    /// Whether `DeviceConnected` was seen for the current device.
    announced: bool,
    pending: VecDeque<ClientEvent>,
}

impl ClientBinding {
    pub(crate) fn new(id: SubscriberId, broker: BrokerHandle) -> Self {
        let (sink, notifications) = mpsc::unbounded_channel();
        Self {
            id,
            broker,
            sink,
            notifications,
            device: None,
            interests: InterestSet::all(),
            announced: false,
            pending: VecDeque::new(),
        }
    }

    /// Get the subscriber identity.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The device this binding currently follows.
    pub fn device(&self) -> Option<&DeviceAddress> {
        self.device.as_ref()
    }

    /// Restrict the optional streams for future `connect` calls.
    pub fn with_interests(mut self, interests: InterestSet) -> Self {
        self.interests = interests;
        self
    }

    /// Follow a sensor, leaving the previous one if it differs.
    pub fn connect(&mut self, address: impl Into<DeviceAddress>) -> Result<()> {
        let address = address.into();

        match self.device.take() {
            Some(previous) if previous == address => {}
            Some(previous) => {
                debug!("{} switching from {} to {}", self.id, previous, address);
                self.broker.send(Request::Unsubscribe {
                    id: self.id,
                    address: previous,
                })?;
                self.reset_session();
            }
            None => self.reset_session(),
        }

        self.device = Some(address.clone());
        self.broker.send(Request::Subscribe {
            handle: SubscriberHandle::new(self.id, self.sink.clone()),
            address,
            interests: self.interests,
        })
    }

    /// Store a calibration pair on the current sensor.
    ///
    /// The broker drops the request unless the sensor is ready.
    pub fn set_calibration(&self, on_bed: f32, not_on_bed: f32) -> Result<()> {
        let address = self.device.clone().ok_or(Error::NotConnected)?;
        self.broker.send(Request::SetCalibration {
            address,
            pair: CalibrationPair::new(on_bed, not_on_bed),
        })
    }

    /// Read the calibration pair of the current sensor again.
    pub fn refresh_calibration(&self) -> Result<()> {
        let address = self.device.clone().ok_or(Error::NotConnected)?;
        self.broker.send(Request::RefreshCalibration { address })
    }

    /// Stop following the current sensor.
    pub fn disconnect(&mut self) -> Result<()> {
        self.reset_session();
        match self.device.take() {
            Some(address) => self.broker.send(Request::Unsubscribe { id: self.id, address }),
            None => Ok(()),
        }
    }

    /// Start over with an empty channel so nothing from an earlier session
    /// is delivered after the next `connect`.
    fn reset_session(&mut self) {
        let (sink, notifications) = mpsc::unbounded_channel();
        self.sink = sink;
        self.notifications = notifications;
        self.announced = false;
        self.pending.clear();
    }

    /// Wait for the next event of the current sensor.
    ///
    /// Returns `None` once the broker service has stopped and every queued
    /// event was delivered.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let notification = self.notifications.recv().await?;
            if let Some(event) = self.accept(notification) {
                return Some(event);
            }
        }
    }

    /// Apply ordering rules to a notification.
    fn accept(&mut self, notification: Notification) -> Option<ClientEvent> {
        if self.device.as_ref() != Some(&notification.address) {
            trace!("{} dropping event for {}", self.id, notification.address);
            return None;
        }

        let event = notification.event;
        match event {
            ClientEvent::DeviceConnected => {
                if self.announced {
                    return None;
                }
                self.announced = true;
            }
            ClientEvent::SensorValue { .. } if !self.announced => {
                // A value proves the link is up.
                self.announced = true;
                self.pending.push_back(event);
                return Some(ClientEvent::DeviceConnected);
            }
            _ if event.is_terminal() => {
                debug!("{} lost {}: {:?}", self.id, notification.address, event);
                self.device = None;
                self.announced = false;
            }
            _ => {}
        }

        Some(event)
    }
}

impl Drop for ClientBinding {
    fn drop(&mut self) {
        // The service may already be gone.
        let _ = self.broker.send(Request::UnsubscribeAll { id: self.id });
    }
}

impl std::fmt::Debug for ClientBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBinding")
            .field("id", &self.id)
            .field("device", &self.device)
            .finish()
    }
}
