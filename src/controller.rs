//! Device controller.
//!
//! Owns the connection to one bed sensor: connection lifecycle, service
//! resolution, calibration read/write sequencing and classification of raw
//! readings. The controller is a plain state machine. Every entry point takes
//! `&mut self`, issues any transport commands it needs, and returns the
//! [`ControllerEvent`]s the caller should publish.

use bytes::Bytes;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::ble::transport::{
    DeviceAddress, LinkId, ServiceInfo, Transport, TransportEvent, TransportFailure,
};
use crate::ble::uuids::*;
use crate::config::ControllerConfig;
use crate::data::{CalibrationField, CalibrationPair, SensorReading};
use crate::protocol::{decode_f32, encode_f32, is_uncalibrated};

/// Notification emitted by a controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControllerEvent {
    /// Setup finished; the sensor is ready.
    Connected,
    /// The connection closed.
    Disconnected,
    /// A new reading arrived.
    ValueChanged(SensorReading),
    /// The calibration pair was read back from the sensor.
    CalibrationUpdated(CalibrationPair),
    /// The sensor lacks the expected service or characteristics.
    DeviceNotSupported,
    /// The link did not come up within the connection deadline.
    ConnectionTimeout,
    /// A protocol step kept failing and was abandoned.
    ProtocolStalled,
}

impl ControllerEvent {
    /// Check if this event ends the connection attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::DeviceNotSupported | Self::ConnectionTimeout
        )
    }
}

/// Which calibration reference a step works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    OnBed,
    NotOnBed,
}

impl Step {
    fn characteristic(self) -> Uuid {
        match self {
            Self::OnBed => ON_BED_CALIBRATION_UUID,
            Self::NotOnBed => NOT_ON_BED_CALIBRATION_UUID,
        }
    }
}

/// The multi-step operation currently in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Sequence {
    Idle,
    EnablingNotifications,
    Reading {
        step: Step,
        /// Held back until the not-on-bed read completes.
        on_bed: CalibrationField,
    },
    Writing {
        step: Step,
        on_bed: f32,
        not_on_bed: f32,
    },
}

impl Sequence {
    /// A read sequence from its first step.
    fn read() -> Self {
        Self::Reading {
            step: Step::OnBed,
            on_bed: CalibrationField::Uninitialized,
        }
    }
}

/// Work requested while another sequence was running.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Queued {
    Read,
    Write { on_bed: f32, not_on_bed: f32 },
}

/// Connection and calibration state machine for one bed sensor.
pub struct DeviceController<T: Transport> {
    /// The link this controller drives.
    link: LinkId,
    /// Command sink.
    transport: T,
    /// Timeouts and retry limits.
    config: ControllerConfig,
    /// Current connection state.
    state: ConnectionState,
    /// Last calibration read from the sensor.
    calibration: CalibrationPair,
    /// Running read/write sequence.
    sequence: Sequence,
    /// Request waiting for the running sequence to finish.
    queued: Option<Queued>,
    /// Failed attempts at the current step.
    attempts: u32,
    /// When the pending connection attempt expires.
    connect_deadline: Option<Instant>,
}

impl<T: Transport> DeviceController<T> {
    /// Create a controller for a peripheral. No connection is made yet.
    pub fn new(link: LinkId, transport: T, config: ControllerConfig) -> Self {
        Self {
            link,
            transport,
            config,
            state: ConnectionState::Disconnected,
            calibration: CalibrationPair::uninitialized(),
            sequence: Sequence::Idle,
            queued: None,
            attempts: 0,
            connect_deadline: None,
        }
    }

    // === Accessors ===

    /// Get the peripheral address.
    pub fn address(&self) -> &DeviceAddress {
        self.link.address()
    }

    /// Get the link this controller drives.
    pub fn link(&self) -> &LinkId {
        &self.link
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if setup has finished.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Get the last calibration pair read from the sensor.
    pub fn calibration(&self) -> CalibrationPair {
        self.calibration
    }

    /// Check if a calibration read or write sequence is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.sequence,
            Sequence::Reading { .. } | Sequence::Writing { .. }
        )
    }

    /// When the pending connection attempt expires, if one is pending.
    pub fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    // === Requests ===

    /// Start connecting.
    ///
    /// Calling this while a connection exists or is being set up does nothing.
    pub fn connect(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();

        if !self.state.is_idle() {
            debug!(
                "Connect requested for {} while {}, ignoring",
                self.link, self.state
            );
            return events;
        }

        info!("Connecting to {}", self.link);

        self.reset();
        self.calibration = CalibrationPair::uninitialized();
        self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.transport.connect(&self.link) {
            error!("Connect to {} refused: {}", self.link, e);
            self.reset();
            self.set_state(ConnectionState::Disconnected);
            events.push(ControllerEvent::Disconnected);
        }

        events
    }

    /// Close the connection.
    pub fn disconnect(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();

        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return events;
        }

        if self.state == ConnectionState::NotSupported {
            // The link was already torn down when the device was rejected.
            self.set_state(ConnectionState::Disconnected);
            return events;
        }

        info!("Disconnecting from {}", self.link);

        self.reset();
        self.set_state(ConnectionState::Disconnecting);

        if let Err(e) = self.transport.disconnect(&self.link) {
            warn!("Disconnect from {} failed: {}", self.link, e);
            self.set_state(ConnectionState::Disconnected);
            events.push(ControllerEvent::Disconnected);
        }

        events
    }

    /// Write a new calibration pair and read it back.
    ///
    /// Dropped unless the controller is ready. While another sequence is
    /// running the write is queued; a newer write replaces a queued one.
    pub fn set_calibration(&mut self, on_bed: f32, not_on_bed: f32) -> Vec<ControllerEvent> {
        let mut events = Vec::new();

        if !self.state.is_ready() {
            debug!(
                "Dropping calibration for {} while {}",
                self.link, self.state
            );
            return events;
        }

        if self.sequence != Sequence::Idle {
            debug!("Calibration sequence busy on {}, queueing write", self.link);
            self.queued = Some(Queued::Write { on_bed, not_on_bed });
            return events;
        }

        self.begin(
            Sequence::Writing {
                step: Step::OnBed,
                on_bed,
                not_on_bed,
            },
            &mut events,
        );
        events
    }

    /// Read the calibration pair again.
    pub fn refresh_calibration(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();

        if !self.state.is_ready() {
            return events;
        }

        if self.sequence != Sequence::Idle {
            // Every sequence ends with a read, so a queued write already covers this.
            if self.queued.is_none() {
                self.queued = Some(Queued::Read);
            }
            return events;
        }

        self.begin(Sequence::read(), &mut events);
        events
    }

    /// Give up on a connection attempt that has passed its deadline.
    pub fn poll_timeout(&mut self, now: Instant) -> Vec<ControllerEvent> {
        let mut events = Vec::new();

        let expired = self.state == ConnectionState::Connecting
            && self.connect_deadline.is_some_and(|deadline| now >= deadline);
        if !expired {
            return events;
        }

        warn!(
            "Connection to {} timed out after {:?}",
            self.link, self.config.connect_timeout
        );

        if let Err(e) = self.transport.disconnect(&self.link) {
            debug!("Cancelling connection to {} failed: {}", self.link, e);
        }
        self.reset();
        self.set_state(ConnectionState::Disconnected);
        events.push(ControllerEvent::ConnectionTimeout);

        events
    }

    // === Transport events ===

    /// Apply a transport event.
    pub fn handle_event(&mut self, event: TransportEvent) -> Vec<ControllerEvent> {
        let mut events = Vec::new();

        trace!(
            "{} received {} while {}",
            self.link,
            event.kind(),
            self.state
        );

        match event {
            TransportEvent::Connected => self.on_connected(&mut events),
            TransportEvent::Disconnected => self.on_disconnected(&mut events),
            TransportEvent::ServicesDiscovered(result) => match result {
                Ok(services) => self.on_services_discovered(&services, &mut events),
                Err(e) => {
                    if self.state == ConnectionState::DiscoveringServices {
                        warn!("Service discovery on {} failed: {}", self.link, e);
                        self.not_supported(&mut events);
                    }
                }
            },
            TransportEvent::NotificationsEnabled {
                characteristic,
                result,
            } => {
                if self.sequence != Sequence::EnablingNotifications
                    || characteristic != SENSOR_VALUE_UUID
                {
                    trace!("Ignoring notification setup for {}", characteristic);
                } else if let Err(e) = result {
                    warn!("Enabling notifications on {} failed: {}", self.link, e);
                    self.retry(&mut events);
                } else {
                    debug!("Notifications enabled on {}", self.link);
                    self.begin(Sequence::read(), &mut events);
                }
            }
            TransportEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.on_value(characteristic, &value, &mut events),
            TransportEvent::CharacteristicRead {
                characteristic,
                result,
            } => self.on_read(characteristic, result, &mut events),
            TransportEvent::CharacteristicWrite {
                characteristic,
                result,
            } => self.on_write(characteristic, result, &mut events),
        }

        events
    }

    fn on_connected(&mut self, events: &mut Vec<ControllerEvent>) {
        if self.state != ConnectionState::Connecting {
            trace!("Ignoring link up on {} while {}", self.link, self.state);
            return;
        }

        info!("Connected to {}", self.link);

        self.connect_deadline = None;
        self.set_state(ConnectionState::DiscoveringServices);

        if let Err(e) = self.transport.discover_services(&self.link) {
            error!("Service discovery on {} refused: {}", self.link, e);
            self.abort(events);
        }
    }

    fn on_disconnected(&mut self, events: &mut Vec<ControllerEvent>) {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::NotSupported => {
                // Already reported; keep the terminal condition.
                self.reset();
            }
            _ => {
                info!("Disconnected from {}", self.link);
                self.reset();
                self.set_state(ConnectionState::Disconnected);
                events.push(ControllerEvent::Disconnected);
            }
        }
    }

    fn on_services_discovered(
        &mut self,
        services: &[ServiceInfo],
        events: &mut Vec<ControllerEvent>,
    ) {
        if self.state != ConnectionState::DiscoveringServices {
            trace!("Ignoring service list on {} while {}", self.link, self.state);
            return;
        }

        let Some(service) = services.iter().find(|s| s.uuid == SENSOR_SERVICE_UUID) else {
            warn!("{} has no sensor service", self.link);
            self.not_supported(events);
            return;
        };

        if let Some(missing) = REQUIRED_CHARACTERISTICS
            .iter()
            .find(|uuid| !service.has_characteristic(uuid))
        {
            warn!("{} is missing characteristic {}", self.link, missing);
            self.not_supported(events);
            return;
        }

        debug!("Sensor service resolved on {}", self.link);
        self.set_state(ConnectionState::ReadingCalibration);
        self.begin(Sequence::EnablingNotifications, events);
    }

    fn on_value(&mut self, characteristic: Uuid, value: &[u8], events: &mut Vec<ControllerEvent>) {
        if characteristic != SENSOR_VALUE_UUID || !self.state.is_connected() {
            trace!("Ignoring change of {} on {}", characteristic, self.link);
            return;
        }

        match decode_f32(value) {
            Ok(raw) => {
                let reading = SensorReading::new(raw, self.calibration.classify(raw));
                trace!("{} reading {} ({})", self.link, raw, reading.status);
                events.push(ControllerEvent::ValueChanged(reading));
            }
            Err(e) => {
                warn!("Rejecting sensor frame from {}: {}", self.link, e);
            }
        }
    }

    fn on_read(
        &mut self,
        characteristic: Uuid,
        result: std::result::Result<Bytes, TransportFailure>,
        events: &mut Vec<ControllerEvent>,
    ) {
        let Sequence::Reading { step, on_bed } = self.sequence else {
            trace!("Unexpected read completion for {}", characteristic);
            return;
        };
        if characteristic != step.characteristic() {
            trace!("Unexpected read completion for {}", characteristic);
            return;
        }

        let data = match result {
            Ok(data) => data,
            Err(e) => {
                warn!("Reading {} on {} failed: {}", characteristic, self.link, e);
                self.retry(events);
                return;
            }
        };

        let field = match decode_f32(&data) {
            Ok(_) if is_uncalibrated(&data) => CalibrationField::Uninitialized,
            Ok(value) => CalibrationField::Value(value),
            Err(e) => {
                warn!("Rejecting calibration frame from {}: {}", self.link, e);
                self.retry(events);
                return;
            }
        };

        debug!("{} calibration {:?} = {:?}", self.link, step, field);

        match step {
            Step::OnBed => self.begin(
                Sequence::Reading {
                    step: Step::NotOnBed,
                    on_bed: field,
                },
                events,
            ),
            // Both fields change together or not at all.
            Step::NotOnBed => self.finish_read(
                CalibrationPair {
                    on_bed,
                    not_on_bed: field,
                },
                events,
            ),
        }
    }

    fn on_write(
        &mut self,
        characteristic: Uuid,
        result: std::result::Result<(), TransportFailure>,
        events: &mut Vec<ControllerEvent>,
    ) {
        let Sequence::Writing {
            step,
            on_bed,
            not_on_bed,
        } = self.sequence
        else {
            trace!("Unexpected write completion for {}", characteristic);
            return;
        };
        if characteristic != step.characteristic() {
            trace!("Unexpected write completion for {}", characteristic);
            return;
        }

        if let Err(e) = result {
            warn!("Writing {} on {} failed: {}", characteristic, self.link, e);
            self.retry(events);
            return;
        }

        match step {
            Step::OnBed => self.begin(
                Sequence::Writing {
                    step: Step::NotOnBed,
                    on_bed,
                    not_on_bed,
                },
                events,
            ),
            // Read back what the sensor committed.
            Step::NotOnBed => self.begin(Sequence::read(), events),
        }
    }

    // === Sequencing ===

    /// Enter a sequence step and issue its command.
    fn begin(&mut self, sequence: Sequence, events: &mut Vec<ControllerEvent>) {
        self.sequence = sequence;
        self.attempts = 0;
        self.issue(events);
    }

    /// Issue the command for the current step.
    fn issue(&mut self, events: &mut Vec<ControllerEvent>) {
        let result = match self.sequence {
            Sequence::Idle => return,
            Sequence::EnablingNotifications => self
                .transport
                .enable_notifications(&self.link, SENSOR_VALUE_UUID),
            Sequence::Reading { step, .. } => self
                .transport
                .read_characteristic(&self.link, step.characteristic()),
            Sequence::Writing {
                step,
                on_bed,
                not_on_bed,
            } => {
                let value = match step {
                    Step::OnBed => on_bed,
                    Step::NotOnBed => not_on_bed,
                };
                self.transport.write_characteristic(
                    &self.link,
                    step.characteristic(),
                    encode_f32(value),
                )
            }
        };

        if let Err(e) = result {
            warn!("Command on {} refused: {}", self.link, e);
            self.retry(events);
        }
    }

    /// Count a failed attempt and either repeat the step or give up.
    fn retry(&mut self, events: &mut Vec<ControllerEvent>) {
        self.attempts += 1;

        if self.attempts < self.config.max_attempts {
            debug!(
                "Retrying {:?} on {} (attempt {} of {})",
                self.sequence,
                self.link,
                self.attempts + 1,
                self.config.max_attempts
            );
            self.issue(events);
            return;
        }

        error!(
            "{:?} on {} failed {} times, giving up",
            self.sequence, self.link, self.attempts
        );
        events.push(ControllerEvent::ProtocolStalled);

        if self.state.is_ready() {
            self.sequence = Sequence::Idle;
            self.attempts = 0;
            self.run_queued(events);
        } else {
            // Setup cannot finish without this step.
            self.abort(events);
        }
    }

    fn finish_read(&mut self, pair: CalibrationPair, events: &mut Vec<ControllerEvent>) {
        self.sequence = Sequence::Idle;
        self.attempts = 0;
        self.calibration = pair;

        if self.state == ConnectionState::ReadingCalibration {
            info!("{} is ready", self.link);
            self.set_state(ConnectionState::Ready);
            events.push(ControllerEvent::Connected);
        }

        if self.calibration.is_initialized() {
            events.push(ControllerEvent::CalibrationUpdated(self.calibration));
        } else {
            debug!("{} is not calibrated yet", self.link);
        }

        self.run_queued(events);
    }

    fn run_queued(&mut self, events: &mut Vec<ControllerEvent>) {
        match self.queued.take() {
            None => {}
            Some(Queued::Read) => self.begin(Sequence::read(), events),
            Some(Queued::Write { on_bed, not_on_bed }) => self.begin(
                Sequence::Writing {
                    step: Step::OnBed,
                    on_bed,
                    not_on_bed,
                },
                events,
            ),
        }
    }

    // === Teardown ===

    fn not_supported(&mut self, events: &mut Vec<ControllerEvent>) {
        if let Err(e) = self.transport.disconnect(&self.link) {
            debug!("Disconnect of unsupported {} failed: {}", self.link, e);
        }
        self.reset();
        self.set_state(ConnectionState::NotSupported);
        events.push(ControllerEvent::DeviceNotSupported);
    }

    fn abort(&mut self, events: &mut Vec<ControllerEvent>) {
        if let Err(e) = self.transport.disconnect(&self.link) {
            debug!("Disconnect of {} failed: {}", self.link, e);
        }
        self.reset();
        self.set_state(ConnectionState::Disconnected);
        events.push(ControllerEvent::Disconnected);
    }

    fn reset(&mut self) {
        self.sequence = Sequence::Idle;
        self.queued = None;
        self.attempts = 0;
        self.connect_deadline = None;
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if old_state != new_state {
            debug!(
                "{} state changed: {} -> {}",
                self.link, old_state, new_state
            );
        }
    }
}

impl<T: Transport> std::fmt::Debug for DeviceController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("link", &self.link)
            .field("state", &self.state)
            .field("calibration", &self.calibration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::testing::{le, sensor_services, Command, RecordingTransport};
    use crate::data::OccupancyStatus;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    type Controller = DeviceController<Arc<RecordingTransport>>;

    fn addr() -> DeviceAddress {
        DeviceAddress::new("AA:BB:CC:DD:EE:FF")
    }

    fn link() -> LinkId {
        LinkId::new(addr(), 1)
    }

    fn controller() -> (Controller, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let controller = DeviceController::new(link(), transport.clone(), ControllerConfig::default());
        (controller, transport)
    }

    fn read_ok(characteristic: Uuid, value: Bytes) -> TransportEvent {
        TransportEvent::CharacteristicRead {
            characteristic,
            result: Ok(value),
        }
    }

    fn write_ok(characteristic: Uuid) -> TransportEvent {
        TransportEvent::CharacteristicWrite {
            characteristic,
            result: Ok(()),
        }
    }

    fn notify_ok() -> TransportEvent {
        TransportEvent::NotificationsEnabled {
            characteristic: SENSOR_VALUE_UUID,
            result: Ok(()),
        }
    }

    fn value(raw: f32) -> TransportEvent {
        TransportEvent::CharacteristicChanged {
            characteristic: SENSOR_VALUE_UUID,
            value: le(raw),
        }
    }

    /// Drive a controller up to the point where calibration reads start.
    fn to_calibration_read(c: &mut Controller) {
        assert!(c.connect().is_empty());
        assert!(c.handle_event(TransportEvent::Connected).is_empty());
        assert!(c
            .handle_event(TransportEvent::ServicesDiscovered(Ok(sensor_services())))
            .is_empty());
        assert!(c.handle_event(notify_ok()).is_empty());
    }

    /// Drive a controller to Ready with the given calibration bytes.
    fn to_ready(c: &mut Controller, on_bed: Bytes, not_on_bed: Bytes) -> Vec<ControllerEvent> {
        to_calibration_read(c);
        assert!(c.handle_event(read_ok(ON_BED_CALIBRATION_UUID, on_bed)).is_empty());
        c.handle_event(read_ok(NOT_ON_BED_CALIBRATION_UUID, not_on_bed))
    }

    #[test]
    fn test_full_setup_sequence() {
        let (mut c, transport) = controller();

        let events = to_ready(&mut c, le(20.0), le(30.0));

        assert_eq!(
            events,
            vec![
                ControllerEvent::Connected,
                ControllerEvent::CalibrationUpdated(CalibrationPair::new(20.0, 30.0)),
            ]
        );
        assert_eq!(c.state(), ConnectionState::Ready);
        assert_eq!(
            transport.commands(),
            vec![
                Command::Connect(addr()),
                Command::DiscoverServices(addr()),
                Command::EnableNotifications(addr(), SENSOR_VALUE_UUID),
                Command::Read(addr(), ON_BED_CALIBRATION_UUID),
                Command::Read(addr(), NOT_ON_BED_CALIBRATION_UUID),
            ]
        );
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (mut c, transport) = controller();
        c.connect();
        assert!(c.connect().is_empty());
        assert_eq!(c.state(), ConnectionState::Connecting);
        assert_eq!(transport.count(|c| matches!(c, Command::Connect(_))), 1);
    }

    #[test]
    fn test_zero_on_bed_read_leaves_field_uninitialized() {
        let (mut c, _) = controller();

        let events = to_ready(&mut c, le(0.0), le(30.0));

        // Ready, but no calibration event since the pair is incomplete.
        assert_eq!(events, vec![ControllerEvent::Connected]);
        assert_eq!(
            c.calibration(),
            CalibrationPair {
                on_bed: CalibrationField::Uninitialized,
                not_on_bed: CalibrationField::Value(30.0),
            }
        );
        assert_eq!(
            c.handle_event(value(25.0)),
            vec![ControllerEvent::ValueChanged(SensorReading::new(
                25.0,
                OccupancyStatus::NotInitialized
            ))]
        );
    }

    #[test]
    fn test_readings_before_ready_are_forwarded() {
        let (mut c, _) = controller();
        to_calibration_read(&mut c);

        assert_eq!(
            c.handle_event(value(21.0)),
            vec![ControllerEvent::ValueChanged(SensorReading::new(
                21.0,
                OccupancyStatus::NotInitialized
            ))]
        );
    }

    #[test]
    fn test_classification_after_ready() {
        let (mut c, _) = controller();
        to_ready(&mut c, le(20.0), le(30.0));

        assert_eq!(
            c.handle_event(value(22.0)),
            vec![ControllerEvent::ValueChanged(SensorReading::new(
                22.0,
                OccupancyStatus::OnBed
            ))]
        );
        assert_eq!(
            c.handle_event(value(28.0)),
            vec![ControllerEvent::ValueChanged(SensorReading::new(
                28.0,
                OccupancyStatus::NotOnBed
            ))]
        );
    }

    #[test]
    fn test_malformed_value_frame_is_rejected() {
        let (mut c, _) = controller();
        to_ready(&mut c, le(20.0), le(30.0));

        let events = c.handle_event(TransportEvent::CharacteristicChanged {
            characteristic: SENSOR_VALUE_UUID,
            value: Bytes::from_static(&[1, 2, 3]),
        });
        assert!(events.is_empty());
        assert_eq!(c.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_missing_service_is_not_supported() {
        let (mut c, transport) = controller();
        c.connect();
        c.handle_event(TransportEvent::Connected);

        let events = c.handle_event(TransportEvent::ServicesDiscovered(Ok(vec![
            ServiceInfo::new(Uuid::from_u128(0x1234), vec![SENSOR_VALUE_UUID]),
        ])));

        assert_eq!(events, vec![ControllerEvent::DeviceNotSupported]);
        assert_eq!(c.state(), ConnectionState::NotSupported);
        assert_eq!(transport.commands().last(), Some(&Command::Disconnect(addr())));

        // The link dropping afterwards is not reported a second time.
        assert!(c.handle_event(TransportEvent::Disconnected).is_empty());
        assert_eq!(c.state(), ConnectionState::NotSupported);
    }

    #[test]
    fn test_missing_characteristic_is_not_supported() {
        let (mut c, _) = controller();
        c.connect();
        c.handle_event(TransportEvent::Connected);

        let events = c.handle_event(TransportEvent::ServicesDiscovered(Ok(vec![
            ServiceInfo::new(
                SENSOR_SERVICE_UUID,
                vec![SENSOR_VALUE_UUID, ON_BED_CALIBRATION_UUID],
            ),
        ])));

        assert_eq!(events, vec![ControllerEvent::DeviceNotSupported]);
        assert!(!c.is_ready());
    }

    #[test]
    fn test_connection_timeout() {
        let (mut c, transport) = controller();
        c.connect();
        let deadline = c.connect_deadline().unwrap();

        assert!(c.poll_timeout(deadline - Duration::from_millis(1)).is_empty());
        assert_eq!(
            c.poll_timeout(deadline),
            vec![ControllerEvent::ConnectionTimeout]
        );
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert_eq!(transport.commands().last(), Some(&Command::Disconnect(addr())));

        // Late link-up after the timeout is ignored.
        assert!(c.handle_event(TransportEvent::Connected).is_empty());
        assert!(c.poll_timeout(deadline + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_no_timeout_once_connected() {
        let (mut c, _) = controller();
        c.connect();
        c.handle_event(TransportEvent::Connected);
        assert_eq!(c.connect_deadline(), None);
        assert!(c
            .poll_timeout(Instant::now() + Duration::from_secs(3600))
            .is_empty());
    }

    #[test]
    fn test_set_calibration_round_trip() {
        let (mut c, transport) = controller();
        to_ready(&mut c, le(1.0), le(2.0));
        transport.take();

        assert!(c.set_calibration(20.0, 30.0).is_empty());
        assert!(c.is_busy());
        assert!(c.handle_event(write_ok(ON_BED_CALIBRATION_UUID)).is_empty());
        assert!(c.handle_event(write_ok(NOT_ON_BED_CALIBRATION_UUID)).is_empty());
        assert!(c
            .handle_event(read_ok(ON_BED_CALIBRATION_UUID, encode_f32(20.0)))
            .is_empty());
        let events = c.handle_event(read_ok(NOT_ON_BED_CALIBRATION_UUID, encode_f32(30.0)));

        assert_eq!(
            events,
            vec![ControllerEvent::CalibrationUpdated(CalibrationPair::new(
                20.0, 30.0
            ))]
        );
        assert!(!c.is_busy());
        assert_eq!(
            transport.commands(),
            vec![
                Command::Write(addr(), ON_BED_CALIBRATION_UUID, le(20.0)),
                Command::Write(addr(), NOT_ON_BED_CALIBRATION_UUID, le(30.0)),
                Command::Read(addr(), ON_BED_CALIBRATION_UUID),
                Command::Read(addr(), NOT_ON_BED_CALIBRATION_UUID),
            ]
        );
    }

    #[test]
    fn test_set_calibration_dropped_when_not_ready() {
        let (mut c, transport) = controller();
        to_calibration_read(&mut c);
        transport.take();

        assert!(c.set_calibration(20.0, 30.0).is_empty());
        assert!(transport.commands().is_empty());

        // Finishing setup does not replay the dropped write.
        c.handle_event(read_ok(ON_BED_CALIBRATION_UUID, le(1.0)));
        c.handle_event(read_ok(NOT_ON_BED_CALIBRATION_UUID, le(2.0)));
        assert_eq!(
            transport.count(|c| matches!(c, Command::Write(..))),
            0
        );
    }

    #[test]
    fn test_write_during_write_is_queued_not_interleaved() {
        let (mut c, transport) = controller();
        to_ready(&mut c, le(1.0), le(2.0));
        transport.take();

        c.set_calibration(10.0, 11.0);
        // Two more requests while busy: only the newest survives.
        c.set_calibration(12.0, 13.0);
        c.set_calibration(20.0, 30.0);
        assert_eq!(transport.commands().len(), 1);

        c.handle_event(write_ok(ON_BED_CALIBRATION_UUID));
        c.handle_event(write_ok(NOT_ON_BED_CALIBRATION_UUID));
        c.handle_event(read_ok(ON_BED_CALIBRATION_UUID, le(10.0)));
        let events = c.handle_event(read_ok(NOT_ON_BED_CALIBRATION_UUID, le(11.0)));
        assert_eq!(
            events,
            vec![ControllerEvent::CalibrationUpdated(CalibrationPair::new(
                10.0, 11.0
            ))]
        );

        // The queued write starts right after the first sequence finished.
        assert_eq!(
            transport.commands().last(),
            Some(&Command::Write(addr(), ON_BED_CALIBRATION_UUID, le(20.0)))
        );
        assert_eq!(transport.count(|c| matches!(c, Command::Write(..))), 3);
    }

    #[test]
    fn test_failed_read_back_keeps_previous_pair() {
        let (mut c, _) = controller();
        to_ready(&mut c, le(1.0), le(2.0));

        c.set_calibration(20.0, 30.0);
        c.handle_event(write_ok(ON_BED_CALIBRATION_UUID));
        c.handle_event(write_ok(NOT_ON_BED_CALIBRATION_UUID));
        assert!(c
            .handle_event(read_ok(ON_BED_CALIBRATION_UUID, le(20.0)))
            .is_empty());

        // The on-bed value is not visible until the pair is complete.
        assert_eq!(c.calibration(), CalibrationPair::new(1.0, 2.0));

        let mut events = Vec::new();
        for _ in 0..ControllerConfig::DEFAULT_MAX_ATTEMPTS {
            events.extend(c.handle_event(TransportEvent::CharacteristicRead {
                characteristic: NOT_ON_BED_CALIBRATION_UUID,
                result: Err(TransportFailure::new("GATT 133")),
            }));
        }

        assert_eq!(events, vec![ControllerEvent::ProtocolStalled]);
        assert_eq!(c.state(), ConnectionState::Ready);
        assert_eq!(c.calibration(), CalibrationPair::new(1.0, 2.0));
        assert_eq!(c.calibration().classify(1.2), OccupancyStatus::OnBed);
    }

    #[test]
    fn test_refresh_during_write_is_absorbed() {
        let (mut c, transport) = controller();
        to_ready(&mut c, le(1.0), le(2.0));
        transport.take();

        c.set_calibration(20.0, 30.0);
        c.refresh_calibration();
        c.handle_event(write_ok(ON_BED_CALIBRATION_UUID));
        c.handle_event(write_ok(NOT_ON_BED_CALIBRATION_UUID));
        c.handle_event(read_ok(ON_BED_CALIBRATION_UUID, le(20.0)));
        c.handle_event(read_ok(NOT_ON_BED_CALIBRATION_UUID, le(30.0)));

        // The queued read runs once more after the write sequence.
        assert_eq!(transport.count(|c| matches!(c, Command::Read(..))), 3);
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let (mut c, _) = controller();
        to_calibration_read(&mut c);

        // Not-on-bed completion arriving while on-bed is pending.
        assert!(c
            .handle_event(read_ok(NOT_ON_BED_CALIBRATION_UUID, le(30.0)))
            .is_empty());
        assert_eq!(c.calibration(), CalibrationPair::uninitialized());
        assert!(c.handle_event(write_ok(ON_BED_CALIBRATION_UUID)).is_empty());
    }

    #[test]
    fn test_read_failure_is_retried() {
        let (mut c, transport) = controller();
        to_calibration_read(&mut c);

        let failed = TransportEvent::CharacteristicRead {
            characteristic: ON_BED_CALIBRATION_UUID,
            result: Err(TransportFailure::new("GATT error")),
        };
        assert!(c.handle_event(failed).is_empty());
        assert_eq!(
            transport.count(|cmd| *cmd == Command::Read(addr(), ON_BED_CALIBRATION_UUID)),
            2
        );

        c.handle_event(read_ok(ON_BED_CALIBRATION_UUID, le(20.0)));
        let events = c.handle_event(read_ok(NOT_ON_BED_CALIBRATION_UUID, le(30.0)));
        assert_eq!(events.first(), Some(&ControllerEvent::Connected));
    }

    #[test]
    fn test_malformed_calibration_counts_as_failure() {
        let (mut c, transport) = controller();
        to_calibration_read(&mut c);

        c.handle_event(read_ok(
            ON_BED_CALIBRATION_UUID,
            Bytes::from_static(&[0, 0, 0xA0, 0x41, 0]),
        ));
        assert_eq!(c.calibration(), CalibrationPair::uninitialized());
        assert_eq!(
            transport.count(|cmd| *cmd == Command::Read(addr(), ON_BED_CALIBRATION_UUID)),
            2
        );
    }

    #[test]
    fn test_setup_stall_aborts_connection() {
        let (mut c, _) = controller();
        to_calibration_read(&mut c);

        let failed = || TransportEvent::CharacteristicRead {
            characteristic: ON_BED_CALIBRATION_UUID,
            result: Err(TransportFailure::new("GATT error")),
        };
        assert!(c.handle_event(failed()).is_empty());
        assert!(c.handle_event(failed()).is_empty());
        assert_eq!(
            c.handle_event(failed()),
            vec![
                ControllerEvent::ProtocolStalled,
                ControllerEvent::Disconnected
            ]
        );
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_write_stall_keeps_connection() {
        let (mut c, transport) = controller();
        to_ready(&mut c, le(1.0), le(2.0));
        transport.refuse("write");

        let events = c.set_calibration(20.0, 30.0);

        assert_eq!(events, vec![ControllerEvent::ProtocolStalled]);
        assert_eq!(c.state(), ConnectionState::Ready);
        assert!(!c.is_busy());
        assert_eq!(transport.count(|c| matches!(c, Command::Write(..))), 3);
    }

    #[test]
    fn test_unexpected_disconnect_from_ready() {
        let (mut c, _) = controller();
        to_ready(&mut c, le(20.0), le(30.0));
        c.set_calibration(1.0, 2.0);

        assert_eq!(
            c.handle_event(TransportEvent::Disconnected),
            vec![ControllerEvent::Disconnected]
        );
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert!(!c.is_busy());
        assert!(c.handle_event(TransportEvent::Disconnected).is_empty());
    }

    #[test]
    fn test_explicit_disconnect() {
        let (mut c, transport) = controller();
        to_ready(&mut c, le(20.0), le(30.0));

        assert!(c.disconnect().is_empty());
        assert_eq!(c.state(), ConnectionState::Disconnecting);
        assert_eq!(transport.commands().last(), Some(&Command::Disconnect(addr())));
        assert!(c.disconnect().is_empty());

        assert_eq!(
            c.handle_event(TransportEvent::Disconnected),
            vec![ControllerEvent::Disconnected]
        );
    }

    #[test]
    fn test_connected_emitted_once_per_connection() {
        let (mut c, _) = controller();
        let mut connected = 0;

        for _ in 0..2 {
            connected += to_ready(&mut c, le(20.0), le(30.0))
                .iter()
                .filter(|e| **e == ControllerEvent::Connected)
                .count();
            // Refreshing calibration on a ready device doesn't re-announce it.
            c.refresh_calibration();
            let events = [
                c.handle_event(read_ok(ON_BED_CALIBRATION_UUID, le(20.0))),
                c.handle_event(read_ok(NOT_ON_BED_CALIBRATION_UUID, le(30.0))),
            ]
            .concat();
            assert!(!events.contains(&ControllerEvent::Connected));
            c.handle_event(TransportEvent::Disconnected);
        }

        assert_eq!(connected, 2);
    }

    #[test]
    fn test_refused_connect_is_terminal() {
        let (mut c, transport) = controller();
        transport.refuse("connect");

        assert_eq!(c.connect(), vec![ControllerEvent::Disconnected]);
        assert_eq!(c.state(), ConnectionState::Disconnected);
        assert_eq!(c.connect_deadline(), None);
    }

    #[test]
    fn test_mock_transport_sees_disconnect_on_unsupported() {
        use crate::ble::transport::MockTransport;

        let mut mock = MockTransport::new();
        mock.expect_connect().times(1).returning(|_| Ok(()));
        mock.expect_discover_services()
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_disconnect().times(1).returning(|_| Ok(()));

        let mut c = DeviceController::new(link(), mock, ControllerConfig::default());
        c.connect();
        c.handle_event(TransportEvent::Connected);
        let events = c.handle_event(TransportEvent::ServicesDiscovered(Err(
            TransportFailure::new("discovery failed"),
        )));
        assert_eq!(events, vec![ControllerEvent::DeviceNotSupported]);
    }
}
