//! BLE scanning functionality.
//!
//! Lists nearby peripherals so a user can pick the sensor to connect to.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

use crate::ble::transport::DeviceAddress;
use crate::ble::uuids::SENSOR_SERVICE_UUID;
use crate::error::{Error, Result};

/// Default scan window (10 seconds).
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Address to pass to `connect`.
    pub address: DeviceAddress,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Whether the advertisement lists the sensor service.
    pub advertises_sensor_service: bool,
}

impl DiscoveredDevice {
    /// Name to show in a device list.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown device")
    }
}

/// Something that can list nearby peripherals.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scan for `duration` and return every device seen, strongest first.
    ///
    /// Each address appears once.
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>>;
}

/// Marks a scan as running until dropped.
struct ScanGuard(Arc<RwLock<bool>>);

impl ScanGuard {
    /// Claim the flag, or `None` if a scan already holds it.
    fn try_begin(flag: &Arc<RwLock<bool>>) -> Option<Self> {
        let mut scanning = flag.write();
        if *scanning {
            return None;
        }
        *scanning = true;
        Some(Self(Arc::clone(flag)))
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        *self.0.write() = false;
    }
}

/// Scanner backed by the first system Bluetooth adapter.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Whether a scan is in progress.
    is_scanning: Arc<RwLock<bool>>,
}

impl BleScanner {
    /// Create a new BLE scanner.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a new BLE scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            is_scanning: Arc::new(RwLock::new(false)),
        }
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn collect(
        adapter: &Adapter,
        duration: Duration,
    ) -> Result<HashMap<DeviceAddress, DiscoveredDevice>> {
        let mut discovered = HashMap::new();
        let mut events = adapter.events().await.map_err(Error::Bluetooth)?;
        let window = tokio::time::sleep(duration);
        tokio::pin!(window);

        loop {
            tokio::select! {
                Some(event) = events.next() => {
                    let id = match event {
                        CentralEvent::DeviceDiscovered(id)
                        | CentralEvent::DeviceUpdated(id)
                        | CentralEvent::ServicesAdvertisement { id, .. } => id,
                        _ => continue,
                    };
                    if let Some(device) = Self::describe(adapter, &id).await {
                        trace!("Seen {} ({})", device.address, device.display_name());
                        discovered.insert(device.address.clone(), device);
                    }
                }
                _ = &mut window => break,
            }
        }

        // Peripherals the adapter already knew about produce no discovery event.
        for peripheral in adapter.peripherals().await.map_err(Error::Bluetooth)? {
            let id = peripheral.id();
            let address = DeviceAddress::new(id.to_string());
            if !discovered.contains_key(&address) {
                if let Some(device) = Self::describe(adapter, &id).await {
                    discovered.insert(address, device);
                }
            }
        }

        Ok(discovered)
    }

    async fn describe(adapter: &Adapter, id: &PeripheralId) -> Option<DiscoveredDevice> {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = peripheral.properties().await.ok()??;

        Some(DiscoveredDevice {
            address: DeviceAddress::new(id.to_string()),
            name: properties.local_name,
            rssi: properties.rssi,
            advertises_sensor_service: properties.services.contains(&SENSOR_SERVICE_UUID),
        })
    }
}

#[async_trait]
impl Scanner for BleScanner {
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        let Some(guard) = ScanGuard::try_begin(&self.is_scanning) else {
            return Err(Error::Transport {
                reason: "scan already in progress".to_string(),
            });
        };

        info!("Scanning for {:?}", duration);

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        let result = Self::collect(&self.adapter, duration).await;

        drop(guard);
        if let Err(e) = self.adapter.stop_scan().await {
            error!("Failed to stop scan: {}", e);
        }

        let devices = sort_by_signal(result?.into_values().collect());
        debug!("Scan found {} devices", devices.len());
        Ok(devices)
    }
}

/// Order devices by signal strength, strongest first; unknown strength last.
pub(crate) fn sort_by_signal(mut devices: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.address.cmp(&b.address)));
    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn device(address: &str, rssi: Option<i16>) -> DiscoveredDevice {
        DiscoveredDevice {
            address: DeviceAddress::new(address),
            name: None,
            rssi,
            advertises_sensor_service: false,
        }
    }

    #[test]
    fn test_sort_by_signal() {
        let sorted = sort_by_signal(vec![
            device("a", Some(-80)),
            device("b", None),
            device("c", Some(-40)),
        ]);
        let order: Vec<_> = sorted.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_display_name() {
        let mut d = device("a", None);
        assert_eq!(d.display_name(), "Unknown device");
        d.name = Some("BedSense".to_string());
        assert_eq!(d.display_name(), "BedSense");
    }

    #[test]
    fn test_only_one_scan_at_a_time() {
        let flag = Arc::new(RwLock::new(false));
        let first = ScanGuard::try_begin(&flag).unwrap();
        assert!(*flag.read());
        assert!(ScanGuard::try_begin(&flag).is_none());

        drop(first);
        assert!(!*flag.read());
        assert!(ScanGuard::try_begin(&flag).is_some());
    }

    struct FixedScanner(Vec<DiscoveredDevice>);

    #[async_trait]
    impl Scanner for FixedScanner {
        async fn scan(&self, _duration: Duration) -> Result<Vec<DiscoveredDevice>> {
            Ok(sort_by_signal(self.0.clone()))
        }
    }

    #[test]
    fn test_scanner_trait_object() {
        let scanner: Box<dyn Scanner> = Box::new(FixedScanner(vec![
            device("a", Some(-90)),
            device("b", Some(-30)),
        ]));
        let devices = tokio_test::block_on(scanner.scan(DEFAULT_SCAN_DURATION)).unwrap();
        assert_eq!(devices[0].address.as_str(), "b");
    }
}
