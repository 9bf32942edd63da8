//! Transport backed by the system Bluetooth stack.
//!
//! Each command is run on its own tokio task. Completions, value
//! notifications and link drops are sent back as `(LinkId, TransportEvent)`
//! pairs on the channel returned by [`BtleplugTransport::new`].
//!
//! A peripheral stays attributed to the [`LinkId`] that last asked to connect
//! its address. Teardown of an older link never disconnects a peripheral a
//! newer link has claimed, and adapter drops are reported only for the link
//! that actually connected.

use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{DeviceAddress, LinkId, ServiceInfo, Transport, TransportEvent};
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use crate::error::{Error, Result};
use crate::service::TransportEvents;

type EventSender = mpsc::UnboundedSender<(LinkId, TransportEvent)>;

struct Shared {
    adapter: Adapter,
    /// Peripherals resolved so far.
    peripherals: RwLock<HashMap<DeviceAddress, Peripheral>>,
    /// Newest link that asked to connect each address.
    claims: RwLock<HashMap<DeviceAddress, LinkId>>,
    /// Links whose connect succeeded, for adapter events.
    connected: RwLock<HashMap<PeripheralId, LinkId>>,
    /// Notification forwarding tasks.
    listeners: RwLock<HashMap<DeviceAddress, (LinkId, JoinHandle<()>)>>,
    events: EventSender,
}

impl Shared {
    fn emit(&self, link: &LinkId, event: TransportEvent) {
        trace!("{} -> {}", link, event.kind());
        if self.events.send((link.clone(), event)).is_err() {
            debug!("Transport event for {} dropped, receiver closed", link);
        }
    }

    fn is_claimed_by(&self, link: &LinkId) -> bool {
        self.claims.read().get(link.address()) == Some(link)
    }

    async fn peripheral(&self, address: &DeviceAddress) -> Result<Peripheral> {
        let cached = self.peripherals.read().get(address).cloned();
        if let Some(peripheral) = cached {
            return Ok(peripheral);
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .find(|p| {
                p.id().to_string() == address.as_str()
                    || p.address().to_string().eq_ignore_ascii_case(address.as_str())
            })
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.to_string(),
            })?;

        self.peripherals
            .write()
            .insert(address.clone(), peripheral.clone());
        Ok(peripheral)
    }

    async fn characteristic(
        &self,
        address: &DeviceAddress,
        uuid: Uuid,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(address).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })?;
        Ok((peripheral, characteristic))
    }

    /// Forward value notifications of a peripheral until the stream ends.
    async fn start_listener(self: &Arc<Self>, link: &LinkId, peripheral: Peripheral) {
        if self
            .listeners
            .read()
            .get(link.address())
            .is_some_and(|(owner, h)| owner == link && !h.is_finished())
        {
            return;
        }

        let mut notifications = match peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                error!("Failed to get notifications stream for {}: {}", link, e);
                return;
            }
        };

        let shared = Arc::clone(self);
        let owner = link.clone();
        let handle = tokio::spawn(async move {
            debug!("Notification listener for {} starting", owner);
            while let Some(notification) = notifications.next().await {
                shared.emit(
                    &owner,
                    TransportEvent::CharacteristicChanged {
                        characteristic: notification.uuid,
                        value: Bytes::from(notification.value),
                    },
                );
            }
            debug!("Notification listener for {} ended", owner);
        });

        let previous = self
            .listeners
            .write()
            .insert(link.address().clone(), (link.clone(), handle));
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    /// Stop the listener of `link`, leaving a newer link's listener alone.
    fn stop_listener(&self, link: &LinkId) {
        let mut listeners = self.listeners.write();
        if listeners.get(link.address()).is_some_and(|(owner, _)| owner == link) {
            if let Some((_, handle)) = listeners.remove(link.address()) {
                handle.abort();
            }
        }
    }
}

/// [`Transport`] implementation over btleplug.
#[derive(Clone)]
pub struct BtleplugTransport {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<(Self, TransportEvents)> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<(Self, TransportEvents)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut central_events = adapter.events().await.map_err(Error::Bluetooth)?;

        let shared = Arc::new(Shared {
            adapter,
            peripherals: RwLock::new(HashMap::new()),
            claims: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            events: events_tx,
        });

        // Link drops the stack reports on its own.
        let watcher = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                let CentralEvent::DeviceDisconnected(id) = event else {
                    continue;
                };
                let Some(shared) = watcher.upgrade() else {
                    break;
                };
                let link = shared.connected.read().get(&id).cloned();
                let Some(link) = link else {
                    continue;
                };
                // A late report for a peripheral that is connected again.
                if let Ok(peripheral) = shared.peripheral(link.address()).await {
                    if peripheral.is_connected().await.unwrap_or(false) {
                        debug!("Ignoring stale drop report for {}", link);
                        continue;
                    }
                }
                info!("{} dropped the link", link);
                shared.connected.write().remove(&id);
                shared.stop_listener(&link);
                shared.emit(&link, TransportEvent::Disconnected);
            }
            debug!("Adapter event loop ended");
        });

        let transport = Self {
            shared,
            runtime: Handle::current(),
        };
        Ok((transport, events_rx))
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.shared.adapter
    }

    fn spawn<F, Fut>(&self, link: &LinkId, command: F) -> Result<()>
    where
        F: FnOnce(Arc<Shared>, LinkId) -> Fut,
        Fut: Future<Output = TransportEvent> + Send + 'static,
    {
        if self.shared.events.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let shared = Arc::clone(&self.shared);
        let owner = link.clone();
        let fut = command(Arc::clone(&shared), link.clone());
        self.runtime.spawn(async move {
            let event = fut.await;
            shared.emit(&owner, event);
        });
        Ok(())
    }
}

impl Transport for BtleplugTransport {
    fn connect(&self, link: &LinkId) -> Result<()> {
        self.shared
            .claims
            .write()
            .insert(link.address().clone(), link.clone());
        self.spawn(link, |shared, link| async move {
            let result = async {
                let peripheral = shared.peripheral(link.address()).await?;
                peripheral.connect().await.map_err(Error::Bluetooth)?;
                Ok::<_, Error>(peripheral)
            }
            .await;

            match result {
                Ok(peripheral) => {
                    if shared.is_claimed_by(&link) {
                        shared.connected.write().insert(peripheral.id(), link);
                    }
                    TransportEvent::Connected
                }
                Err(e) => {
                    warn!("Connecting {} failed: {}", link, e);
                    TransportEvent::Disconnected
                }
            }
        })
    }

    fn discover_services(&self, link: &LinkId) -> Result<()> {
        self.spawn(link, |shared, link| async move {
            let result = async {
                let peripheral = shared.peripheral(link.address()).await?;
                peripheral.discover_services().await.map_err(Error::Bluetooth)?;
                Ok::<Vec<ServiceInfo>, Error>(
                    peripheral
                        .services()
                        .into_iter()
                        .map(|s| {
                            ServiceInfo::new(
                                s.uuid,
                                s.characteristics.iter().map(|c| c.uuid).collect(),
                            )
                        })
                        .collect(),
                )
            }
            .await;

            TransportEvent::ServicesDiscovered(result.map_err(Into::into))
        })
    }

    fn enable_notifications(&self, link: &LinkId, characteristic: Uuid) -> Result<()> {
        self.spawn(link, move |shared, link| async move {
            let result = async {
                let (peripheral, c) =
                    shared.characteristic(link.address(), characteristic).await?;
                if !c
                    .descriptors
                    .iter()
                    .any(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID)
                {
                    debug!(
                        "Characteristic {} of {} lists no client configuration descriptor",
                        characteristic, link
                    );
                }
                // btleplug writes the client configuration descriptor itself.
                peripheral.subscribe(&c).await.map_err(Error::Bluetooth)?;
                shared.start_listener(&link, peripheral).await;
                Ok::<_, Error>(())
            }
            .await;

            TransportEvent::NotificationsEnabled {
                characteristic,
                result: result.map_err(Into::into),
            }
        })
    }

    fn read_characteristic(&self, link: &LinkId, characteristic: Uuid) -> Result<()> {
        self.spawn(link, move |shared, link| async move {
            let result = async {
                let (peripheral, c) =
                    shared.characteristic(link.address(), characteristic).await?;
                let data = peripheral.read(&c).await.map_err(Error::Bluetooth)?;
                trace!("Read {} bytes from characteristic {}", data.len(), characteristic);
                Ok::<_, Error>(Bytes::from(data))
            }
            .await;

            TransportEvent::CharacteristicRead {
                characteristic,
                result: result.map_err(Into::into),
            }
        })
    }

    fn write_characteristic(&self, link: &LinkId, characteristic: Uuid, value: Bytes) -> Result<()> {
        self.spawn(link, move |shared, link| async move {
            let result = async {
                let (peripheral, c) =
                    shared.characteristic(link.address(), characteristic).await?;
                peripheral
                    .write(&c, &value, WriteType::WithResponse)
                    .await
                    .map_err(Error::Bluetooth)?;
                trace!("Wrote {} bytes to characteristic {}", value.len(), characteristic);
                Ok::<_, Error>(())
            }
            .await;

            TransportEvent::CharacteristicWrite {
                characteristic,
                result: result.map_err(Into::into),
            }
        })
    }

    fn disconnect(&self, link: &LinkId) -> Result<()> {
        self.shared.stop_listener(link);
        self.spawn(link, |shared, link| async move {
            shared.connected.write().retain(|_, owner| *owner != link);

            if !shared.is_claimed_by(&link) {
                debug!("{} was superseded, leaving the peripheral connected", link);
                return TransportEvent::Disconnected;
            }
            shared.claims.write().remove(link.address());

            match shared.peripheral(link.address()).await {
                Ok(peripheral) => {
                    if let Err(e) = peripheral.disconnect().await {
                        warn!("Disconnecting {} failed: {}", link, e);
                    }
                }
                Err(e) => debug!("Nothing to disconnect for {}: {}", link, e),
            }
            TransportEvent::Disconnected
        })
    }
}

impl std::fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugTransport")
            .field("peripherals", &self.shared.peripherals.read().len())
            .finish()
    }
}
