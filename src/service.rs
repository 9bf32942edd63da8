//! Broker service task.
//!
//! Runs a [`NotificationBroker`] on its own tokio task so that subscriber
//! requests, transport completions and deadline checks are applied one at a
//! time in arrival order.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::ble::transport::{DeviceAddress, LinkId, Transport, TransportEvent};
use crate::broker::{InterestSet, NotificationBroker, SubscriberHandle, SubscriberId};
use crate::client::ClientBinding;
use crate::config::BrokerConfig;
use crate::data::CalibrationPair;
use crate::error::{Error, Result};

/// Receiving half of the transport completion stream.
pub type TransportEvents = mpsc::UnboundedReceiver<(LinkId, TransportEvent)>;

/// A request sent to the service task.
#[derive(Debug)]
pub(crate) enum Request {
    Subscribe {
        handle: SubscriberHandle,
        address: DeviceAddress,
        interests: InterestSet,
    },
    Unsubscribe {
        id: SubscriberId,
        address: DeviceAddress,
    },
    UnsubscribeAll {
        id: SubscriberId,
    },
    SetCalibration {
        address: DeviceAddress,
        pair: CalibrationPair,
    },
    RefreshCalibration {
        address: DeviceAddress,
    },
    Shutdown,
}

/// Spawns the broker task.
pub struct BrokerService;

impl BrokerService {
    /// Start the broker on the current tokio runtime.
    ///
    /// `events` must carry every completion produced by `transport`.
    pub fn spawn<T>(transport: Arc<T>, events: TransportEvents, config: BrokerConfig) -> BrokerHandle
    where
        T: Transport + 'static,
    {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let broker = NotificationBroker::new(transport, config.controller);

        let task = tokio::spawn(run(broker, requests_rx, events, config.tick_interval.into()));

        BrokerHandle {
            requests: requests_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

async fn run<T: Transport>(
    mut broker: NotificationBroker<T>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut events: TransportEvents,
    tick_interval: Duration,
) {
    info!("Broker service started");

    let mut tick = tokio::time::interval(tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            request = requests.recv() => {
                match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => apply(&mut broker, request),
                }
            }
            Some((link, event)) = events.recv() => {
                broker.handle_transport_event(&link, event);
            }
            _ = tick.tick() => {
                broker.poll_timeouts(Instant::now());
            }
        }
    }

    broker.shutdown();
    info!("Broker service stopped");
}

fn apply<T: Transport>(broker: &mut NotificationBroker<T>, request: Request) {
    match request {
        Request::Subscribe {
            handle,
            address,
            interests,
        } => broker.subscribe(handle, address, interests),
        Request::Unsubscribe { id, address } => broker.unsubscribe(id, &address),
        Request::UnsubscribeAll { id } => broker.unsubscribe_all(id),
        Request::SetCalibration { address, pair } => broker.set_calibration(&address, pair),
        Request::RefreshCalibration { address } => broker.refresh_calibration(&address),
        Request::Shutdown => {}
    }
}

/// Cloneable handle to a running broker service.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    requests: mpsc::UnboundedSender<Request>,
    next_id: Arc<AtomicU64>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BrokerHandle {
    /// Create a client binding with a fresh subscriber identity.
    pub fn bind(&self) -> ClientBinding {
        let id = SubscriberId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("Binding {}", id);
        ClientBinding::new(id, self.clone())
    }

    /// Check if the service task is still accepting requests.
    pub fn is_running(&self) -> bool {
        !self.requests.is_closed()
    }

    /// Stop the service, disconnecting every device.
    pub async fn shutdown(&self) -> Result<()> {
        // The task may already be gone; shutting down twice is fine.
        let _ = self.requests.send(Request::Shutdown);

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.map_err(|e| Error::Transport {
                reason: format!("broker task failed: {e}"),
            })?;
        }
        Ok(())
    }

    pub(crate) fn send(&self, request: Request) -> Result<()> {
        self.requests.send(request).map_err(|_| Error::ChannelClosed)
    }
}
