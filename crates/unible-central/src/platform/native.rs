//! Platform adapter over btleplug
//!
//! btleplug exposes an async API; each submission spawns a task that awaits
//! the btleplug call and posts the matching [`PlatformEvent`]. Discovery
//! always reports the complete GATT tree in one event, and subscriptions
//! write the CCCD inside btleplug.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use btleplug::api::{
    BDAddr, Central, CentralEvent as BtleplugEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as BtleplugScanFilter, WriteType as BtleplugWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use dashmap::DashMap;
use futures::stream::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use unible_core::{
    AvailabilityState, BleError, CharacteristicProperties, DeviceId, DiscoveredCharacteristic,
    DiscoveredService, GattStatus, ManufacturerData, NativeScanFilter, Result, WriteType,
};

use super::{
    PlatformAdapter, PlatformCapabilities, PlatformEvent, PlatformEventSender, PlatformScanResult,
    SystemDevice,
};

const DEFAULT_ATT_MTU: usize = 23;
const ATT_HEADER_LEN: usize = 3;
const MAX_ATTRIBUTE_LEN: usize = 512;
const LOCAL_HOST_TERMINATED: u8 = 0x16;

/// Shared between the adapter and its background tasks
struct Shared {
    events: PlatformEventSender,
    peripherals: DashMap<DeviceId, Peripheral>,
    /// Devices the stack reports connected, with their names
    connected: DashMap<DeviceId, Option<String>>,
    notification_tasks: DashMap<DeviceId, JoinHandle<()>>,
    scanning: AtomicBool,
}

impl Shared {
    fn post(&self, event: PlatformEvent) {
        if self.events.send(event).is_err() {
            debug!("btleplug event dropped: dispatcher gone");
        }
    }
}

pub struct BtleplugPlatform {
    adapter: Adapter,
    runtime: Handle,
    shared: Arc<Shared>,
    event_pump: JoinHandle<()>,
}

impl Drop for BtleplugPlatform {
    fn drop(&mut self) {
        self.event_pump.abort();
        for task in self.shared.notification_tasks.iter() {
            task.value().abort();
        }
    }
}

impl BtleplugPlatform {
    /// Open the first Bluetooth adapter and start forwarding its events
    pub async fn new(events: PlatformEventSender) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::Unknown(format!("Failed to create BLE manager: {e}")))?;

        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::Unknown(format!("Failed to get BLE adapters: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::not_supported("no Bluetooth adapter available"))?;

        let shared = Arc::new(Shared {
            events,
            peripherals: DashMap::new(),
            connected: DashMap::new(),
            notification_tasks: DashMap::new(),
            scanning: AtomicBool::new(false),
        });

        let mut stream = adapter.events().await.map_err(btleplug_error)?;
        let pump_adapter = adapter.clone();
        let pump_shared = Arc::clone(&shared);
        let event_pump = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                handle_adapter_event(&pump_adapter, &pump_shared, event).await;
            }
            debug!("btleplug event stream ended");
        });

        info!("btleplug adapter initialized");
        Ok(Self {
            adapter,
            runtime: Handle::current(),
            shared,
            event_pump,
        })
    }

    fn peripheral(&self, device_id: &DeviceId) -> Result<Peripheral> {
        self.shared
            .peripherals
            .get(device_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| BleError::device_not_found(device_id.as_str()))
    }

    fn characteristic(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(device_id)?;
        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or_else(|| BleError::characteristic_not_found(characteristic))?;
        Ok((peripheral, found))
    }

    fn report_tree(&self, device_id: &DeviceId, peripheral: &Peripheral) {
        self.shared.post(PlatformEvent::ServicesDiscovered {
            device_id: device_id.clone(),
            status: GattStatus::SUCCESS,
            services: discovered_tree(peripheral),
        });
    }
}

impl PlatformAdapter for BtleplugPlatform {
    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            mtu_negotiation: false,
            subscription_descriptor_write: false,
            pairing: false,
            adapter_toggle: false,
            rssi: true,
            reports_scan_throttling: false,
        }
    }

    fn availability(&self) -> AvailabilityState {
        // btleplug 0.11 does not report the adapter power state
        AvailabilityState::PoweredOn
    }

    fn start_scan(&self, filter: &NativeScanFilter) -> Result<()> {
        let adapter = self.adapter.clone();
        let shared = Arc::clone(&self.shared);
        let scan_filter = BtleplugScanFilter {
            services: filter.services.clone(),
        };
        self.runtime.spawn(async move {
            match adapter.start_scan(scan_filter).await {
                Ok(()) => {
                    shared.scanning.store(true, Ordering::SeqCst);
                    info!("Started BLE scanning");
                }
                Err(e) => {
                    error!("Failed to start BLE scan: {}", e);
                    shared.post(PlatformEvent::ScanFailed { code: 3 });
                }
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        let adapter = self.adapter.clone();
        let shared = Arc::clone(&self.shared);
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
            shared.scanning.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    fn is_scanning(&self) -> Option<bool> {
        Some(self.shared.scanning.load(Ordering::SeqCst))
    }

    fn connect(&self, device_id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device_id)?;
        let shared = Arc::clone(&self.shared);
        let device_id = device_id.clone();
        self.runtime.spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    start_notifications(&shared, &device_id, &peripheral).await;
                    shared.post(PlatformEvent::ConnectionChanged {
                        device_id,
                        connected: true,
                        reason: None,
                    });
                }
                Err(e) => {
                    error!("Failed to connect to {}: {}", device_id, e);
                    shared.post(PlatformEvent::ConnectionChanged {
                        device_id,
                        connected: false,
                        reason: None,
                    });
                }
            }
        });
        Ok(())
    }

    fn disconnect(&self, device_id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device_id)?;
        if let Some((_, task)) = self.shared.notification_tasks.remove(device_id) {
            task.abort();
        }
        let shared = Arc::clone(&self.shared);
        let device_id = device_id.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect {}: {}", device_id, e);
            }
            shared.post(PlatformEvent::ConnectionChanged {
                device_id,
                connected: false,
                reason: Some(LOCAL_HOST_TERMINATED),
            });
        });
        Ok(())
    }

    fn discover_services(&self, device_id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device_id)?;
        let shared = Arc::clone(&self.shared);
        let device_id = device_id.clone();
        self.runtime.spawn(async move {
            let (status, services) = match peripheral.discover_services().await {
                Ok(()) => (GattStatus::SUCCESS, discovered_tree(&peripheral)),
                Err(e) => {
                    error!("Failed to discover services for {}: {}", device_id, e);
                    (GattStatus::FAILURE, Vec::new())
                }
            };
            shared.post(PlatformEvent::ServicesDiscovered {
                device_id,
                status,
                services,
            });
        });
        Ok(())
    }

    fn discover_characteristics(&self, device_id: &DeviceId, _service: Uuid) -> Result<()> {
        // The tree is always reported whole; report it again
        let peripheral = self.peripheral(device_id)?;
        self.report_tree(device_id, &peripheral);
        Ok(())
    }

    fn discover_descriptors(
        &self,
        device_id: &DeviceId,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<()> {
        let peripheral = self.peripheral(device_id)?;
        self.report_tree(device_id, &peripheral);
        Ok(())
    }

    fn read_characteristic(&self, device_id: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<()> {
        let (peripheral, found) = self.characteristic(device_id, service, characteristic)?;
        let shared = Arc::clone(&self.shared);
        let device_id = device_id.clone();
        self.runtime.spawn(async move {
            let (status, value) = match peripheral.read(&found).await {
                Ok(value) => (GattStatus::SUCCESS, value),
                Err(e) => {
                    error!("Read of {} on {} failed: {}", characteristic, device_id, e);
                    (GattStatus::FAILURE, Vec::new())
                }
            };
            shared.post(PlatformEvent::CharacteristicRead {
                device_id,
                service,
                characteristic,
                status,
                value,
            });
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let (peripheral, found) = self.characteristic(device_id, service, characteristic)?;
        let shared = Arc::clone(&self.shared);
        let device_id = device_id.clone();
        let value = value.to_vec();
        self.runtime.spawn(async move {
            let btleplug_type = match write_type {
                WriteType::WithResponse => BtleplugWriteType::WithResponse,
                WriteType::WithoutResponse => BtleplugWriteType::WithoutResponse,
            };
            let status = match peripheral.write(&found, &value, btleplug_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    error!("Write of {} on {} failed: {}", characteristic, device_id, e);
                    GattStatus::FAILURE
                }
            };
            if write_type == WriteType::WithResponse {
                shared.post(PlatformEvent::CharacteristicWritten {
                    device_id,
                    service,
                    characteristic,
                    status,
                });
            }
        });
        Ok(())
    }

    fn set_notify(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        let (peripheral, found) = self.characteristic(device_id, service, characteristic)?;
        let shared = Arc::clone(&self.shared);
        let device_id = device_id.clone();
        self.runtime.spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&found).await
            } else {
                peripheral.unsubscribe(&found).await
            };
            let status = match result {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    error!("Subscription change of {} on {} failed: {}", characteristic, device_id, e);
                    GattStatus::FAILURE
                }
            };
            shared.post(PlatformEvent::NotificationStateChanged {
                device_id,
                service,
                characteristic,
                status,
            });
        });
        Ok(())
    }

    fn maximum_write_length(&self, device_id: &DeviceId, write_type: WriteType) -> Result<usize> {
        self.peripheral(device_id)?;
        Ok(match write_type {
            WriteType::WithResponse => MAX_ATTRIBUTE_LEN,
            WriteType::WithoutResponse => DEFAULT_ATT_MTU - ATT_HEADER_LEN,
        })
    }

    fn read_rssi(&self, device_id: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device_id)?;
        let shared = Arc::clone(&self.shared);
        let device_id = device_id.clone();
        self.runtime.spawn(async move {
            let rssi = match peripheral.properties().await {
                Ok(Some(properties)) => properties.rssi,
                Ok(None) => None,
                Err(e) => {
                    warn!("Failed to read properties of {}: {}", device_id, e);
                    None
                }
            };
            let (status, rssi) = match rssi {
                Some(rssi) => (GattStatus::SUCCESS, rssi),
                None => (GattStatus::FAILURE, 0),
            };
            shared.post(PlatformEvent::RssiRead {
                device_id,
                rssi,
                status,
            });
        });
        Ok(())
    }

    fn connected_system_devices(&self) -> Result<Vec<SystemDevice>> {
        Ok(self
            .shared
            .connected
            .iter()
            .map(|entry| SystemDevice {
                device_id: entry.key().clone(),
                name: entry.value().clone(),
                is_paired: None,
            })
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Background Tasks
// ----------------------------------------------------------------------------

/// Stable identifier: the Bluetooth address, or the platform id where the
/// address is hidden (macOS)
fn device_id_of(peripheral: &Peripheral) -> DeviceId {
    let address = peripheral.address();
    if address == BDAddr::default() {
        DeviceId::new(format!("{:?}", peripheral.id()))
    } else {
        DeviceId::new(address.to_string())
    }
}

async fn handle_adapter_event(adapter: &Adapter, shared: &Arc<Shared>, event: BtleplugEvent) {
    let id = match &event {
        BtleplugEvent::DeviceDiscovered(id)
        | BtleplugEvent::DeviceUpdated(id)
        | BtleplugEvent::DeviceConnected(id)
        | BtleplugEvent::DeviceDisconnected(id) => id.clone(),
        BtleplugEvent::ManufacturerDataAdvertisement { id, .. }
        | BtleplugEvent::ServiceDataAdvertisement { id, .. }
        | BtleplugEvent::ServicesAdvertisement { id, .. } => id.clone(),
        #[allow(unreachable_patterns)]
        _ => return,
    };

    let peripheral = match adapter.peripheral(&id).await {
        Ok(peripheral) => peripheral,
        Err(e) => {
            debug!("Event for unknown peripheral {:?}: {}", id, e);
            return;
        }
    };
    let device_id = device_id_of(&peripheral);
    shared
        .peripherals
        .insert(device_id.clone(), peripheral.clone());

    match event {
        BtleplugEvent::DeviceConnected(_) => {
            let name = match peripheral.properties().await {
                Ok(Some(properties)) => properties.local_name,
                _ => None,
            };
            shared.connected.insert(device_id, name);
        }
        BtleplugEvent::DeviceDisconnected(_) => {
            shared.connected.remove(&device_id);
            if let Some((_, task)) = shared.notification_tasks.remove(&device_id) {
                task.abort();
            }
            shared.post(PlatformEvent::ConnectionChanged {
                device_id,
                connected: false,
                reason: None,
            });
        }
        _ => {
            if !shared.scanning.load(Ordering::SeqCst) {
                return;
            }
            if let Ok(Some(properties)) = peripheral.properties().await {
                shared.post(PlatformEvent::ScanResult(PlatformScanResult {
                    device_id,
                    name: properties.local_name,
                    rssi: properties.rssi,
                    is_paired: None,
                    advertisement: None,
                    manufacturer_data: manufacturer_data(properties.manufacturer_data),
                    services: properties.services,
                }));
            }
        }
    }
}

fn manufacturer_data(data: HashMap<u16, Vec<u8>>) -> Vec<ManufacturerData> {
    let mut entries: Vec<ManufacturerData> = data
        .into_iter()
        .map(|(company, payload)| ManufacturerData::new(company, payload))
        .collect();
    entries.sort_by_key(|entry| entry.company_identifier);
    entries
}

/// Forward notifications of a connected peripheral as `ValueChanged`
async fn start_notifications(shared: &Arc<Shared>, device_id: &DeviceId, peripheral: &Peripheral) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("No notification stream for {}: {}", device_id, e);
            return;
        }
    };

    let task_shared = Arc::clone(shared);
    let task_device = device_id.clone();
    let task_peripheral = peripheral.clone();
    let task = tokio::spawn(async move {
        while let Some(notification) = notifications.next().await {
            let service = task_peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == notification.uuid)
                .map(|c| c.service_uuid);
            let Some(service) = service else {
                debug!("Notification for unknown characteristic {}", notification.uuid);
                continue;
            };
            task_shared.post(PlatformEvent::ValueChanged {
                device_id: task_device.clone(),
                service,
                characteristic: notification.uuid,
                value: notification.value,
            });
        }
        debug!("Notification stream for {} ended", task_device);
    });

    if let Some(previous) = shared.notification_tasks.insert(device_id.clone(), task) {
        previous.abort();
    }
}

fn discovered_tree(peripheral: &Peripheral) -> Vec<DiscoveredService> {
    peripheral
        .services()
        .into_iter()
        .map(|service| DiscoveredService {
            uuid: service.uuid,
            characteristics: Some(
                service
                    .characteristics
                    .into_iter()
                    .map(|c| DiscoveredCharacteristic {
                        uuid: c.uuid,
                        // CharPropFlags uses the GATT property-byte layout
                        properties: CharacteristicProperties::from_bits(c.properties.bits()),
                        descriptors: Some(c.descriptors.into_iter().map(|d| d.uuid).collect()),
                    })
                    .collect(),
            ),
        })
        .collect()
}

fn btleplug_error(err: btleplug::Error) -> BleError {
    match err {
        btleplug::Error::DeviceNotFound => BleError::device_not_found("unknown"),
        btleplug::Error::NotConnected => BleError::DeviceDisconnected,
        btleplug::Error::NotSupported(what) => BleError::NotSupported(what),
        btleplug::Error::NoSuchCharacteristic => BleError::characteristic_not_found("unknown"),
        other => BleError::Unknown(other.to_string()),
    }
}
