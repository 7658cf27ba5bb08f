//! Deterministic in-memory platform
//!
//! [`FakePlatform`] stands in for a native stack: peripherals are scripted up
//! front, every submission is recorded in a call log, and completions are
//! posted to the event channel synchronously from the submitting call. In
//! silent mode nothing is posted and the test injects events itself.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

use unible_core::advertisement::{
    AD_TYPE_COMPLETE_LOCAL_NAME, AD_TYPE_COMPLETE_SERVICES_16, AD_TYPE_FLAGS,
    AD_TYPE_MANUFACTURER_DATA,
};
use unible_core::{
    short_uuid, AvailabilityState, BleError, BleService, BondState, DeviceId,
    DiscoveredCharacteristic, DiscoveredService, GattStatus, ManufacturerData, NativeScanFilter,
    Result, WriteType, CCCD_UUID,
};

use super::{
    PlatformAdapter, PlatformCapabilities, PlatformEvent, PlatformEventSender, PlatformScanResult,
    SystemDevice,
};

const DEFAULT_MTU: u16 = 185;
const MAX_MTU: u16 = 517;
const ATT_HEADER_LEN: usize = 3;
const LOCAL_HOST_TERMINATED: u8 = 0x16;
const CONNECTION_FAILED_TO_ESTABLISH: u8 = 0x3E;

// ----------------------------------------------------------------------------
// Scripted Peripherals
// ----------------------------------------------------------------------------

/// A remote device known to the fake stack
#[derive(Debug, Clone)]
pub struct FakePeripheral {
    id: DeviceId,
    name: Option<String>,
    rssi: i16,
    manufacturer_data: Vec<ManufacturerData>,
    services: Vec<BleService>,
    values: HashMap<(Uuid, Uuid), Vec<u8>>,
    /// Report the GATT tree level by level instead of in one callback
    progressive: bool,
    advertising: bool,
    /// Held connected by the OS (another application)
    system_connected: bool,
    paired: bool,
    mtu: u16,
}

impl FakePeripheral {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: -60,
            manufacturer_data: Vec::new(),
            services: Vec::new(),
            values: HashMap::new(),
            progressive: false,
            advertising: true,
            system_connected: false,
            paired: false,
            mtu: DEFAULT_MTU,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_manufacturer_data(mut self, data: ManufacturerData) -> Self {
        self.manufacturer_data.push(data);
        self
    }

    pub fn with_service(mut self, service: BleService) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_value(mut self, service: Uuid, characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        self.values.insert((service, characteristic), value.into());
        self
    }

    pub fn progressive(mut self) -> Self {
        self.progressive = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.advertising = false;
        self
    }

    pub fn system_connected(mut self) -> Self {
        self.system_connected = true;
        self
    }

    pub fn paired(mut self) -> Self {
        self.paired = true;
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Raw advertising bytes: flags, complete name, 16-bit services, manufacturer data
    pub fn advertisement_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        push_section(&mut bytes, AD_TYPE_FLAGS, &[0x06]);

        if let Some(name) = &self.name {
            push_section(&mut bytes, AD_TYPE_COMPLETE_LOCAL_NAME, name.as_bytes());
        }

        let short_services: Vec<u8> = self
            .services
            .iter()
            .filter_map(|s| short_uuid(&s.uuid))
            .flat_map(u16::to_le_bytes)
            .collect();
        if !short_services.is_empty() {
            push_section(&mut bytes, AD_TYPE_COMPLETE_SERVICES_16, &short_services);
        }

        for data in &self.manufacturer_data {
            let mut payload = data.company_identifier.to_le_bytes().to_vec();
            payload.extend_from_slice(&data.data);
            push_section(&mut bytes, AD_TYPE_MANUFACTURER_DATA, &payload);
        }
        bytes
    }

    fn scan_result(&self) -> PlatformScanResult {
        PlatformScanResult {
            device_id: self.id.clone(),
            rssi: Some(self.rssi),
            is_paired: Some(self.paired),
            advertisement: Some(self.advertisement_bytes()),
            ..PlatformScanResult::default()
        }
    }

    fn service(&self, uuid: &Uuid) -> Option<&BleService> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    fn has_characteristic(&self, service: &Uuid, characteristic: &Uuid) -> bool {
        self.service(service)
            .is_some_and(|s| s.characteristic(characteristic).is_some())
    }
}

fn push_section(bytes: &mut Vec<u8>, ad_type: u8, payload: &[u8]) {
    let Ok(len) = u8::try_from(payload.len() + 1) else {
        return;
    };
    bytes.push(len);
    bytes.push(ad_type);
    bytes.extend_from_slice(payload);
}

// ----------------------------------------------------------------------------
// Call Log
// ----------------------------------------------------------------------------

/// A request submitted to the fake stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    SetAdapterEnabled(bool),
    StartScan(NativeScanFilter),
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics {
        device_id: DeviceId,
        service: Uuid,
    },
    DiscoverDescriptors {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    },
    Read {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    },
    WriteDescriptor {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    RequestMtu {
        device_id: DeviceId,
        mtu: u16,
    },
    ReadRssi(DeviceId),
    Pair(DeviceId),
    Unpair(DeviceId),
}

impl PlatformCall {
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            PlatformCall::SetAdapterEnabled(_) | PlatformCall::StartScan(_) | PlatformCall::StopScan => {
                None
            }
            PlatformCall::Connect(id)
            | PlatformCall::Disconnect(id)
            | PlatformCall::DiscoverServices(id)
            | PlatformCall::ReadRssi(id)
            | PlatformCall::Pair(id)
            | PlatformCall::Unpair(id) => Some(id),
            PlatformCall::DiscoverCharacteristics { device_id, .. }
            | PlatformCall::DiscoverDescriptors { device_id, .. }
            | PlatformCall::Read { device_id, .. }
            | PlatformCall::Write { device_id, .. }
            | PlatformCall::SetNotify { device_id, .. }
            | PlatformCall::WriteDescriptor { device_id, .. }
            | PlatformCall::RequestMtu { device_id, .. } => Some(device_id),
        }
    }
}

// ----------------------------------------------------------------------------
// Fake Platform
// ----------------------------------------------------------------------------

struct FakeState {
    capabilities: PlatformCapabilities,
    availability: AvailabilityState,
    peripherals: HashMap<DeviceId, FakePeripheral>,
    links: HashSet<DeviceId>,
    subscriptions: HashSet<(DeviceId, Uuid, Uuid)>,
    calls: Vec<PlatformCall>,
    scanning: bool,
    silent: bool,
    bond_outcome: BondState,
}

pub struct FakePlatform {
    events: PlatformEventSender,
    state: Mutex<FakeState>,
    calls_changed: Notify,
}

impl FakePlatform {
    /// A powered-on stack posting completions to `events`
    pub fn new(events: PlatformEventSender) -> Self {
        Self {
            events,
            state: Mutex::new(FakeState {
                capabilities: PlatformCapabilities::default(),
                availability: AvailabilityState::PoweredOn,
                peripherals: HashMap::new(),
                links: HashSet::new(),
                subscriptions: HashSet::new(),
                calls: Vec::new(),
                scanning: false,
                silent: false,
                bond_outcome: BondState::Bonded,
            }),
            calls_changed: Notify::new(),
        }
    }

    pub fn with_capabilities(self, capabilities: PlatformCapabilities) -> Self {
        self.state.lock().capabilities = capabilities;
        self
    }

    pub fn with_availability(self, availability: AvailabilityState) -> Self {
        self.state.lock().availability = availability;
        self
    }

    pub fn with_peripheral(self, peripheral: FakePeripheral) -> Self {
        self.add_peripheral(peripheral);
        self
    }

    pub fn add_peripheral(&self, peripheral: FakePeripheral) {
        self.state
            .lock()
            .peripherals
            .insert(peripheral.id.clone(), peripheral);
    }

    /// Stop posting completions; submissions are still recorded
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Terminal bond state reported after `pair`
    pub fn set_bond_outcome(&self, outcome: BondState) {
        self.state.lock().bond_outcome = outcome;
    }

    /// Change the adapter state and report it
    pub fn set_availability(&self, availability: AvailabilityState) {
        self.state.lock().availability = availability;
        self.emit(PlatformEvent::AvailabilityChanged(availability));
    }

    /// Post an arbitrary event
    pub fn emit(&self, event: PlatformEvent) {
        trace!("Fake platform event: {:?}", event);
        if self.events.send(event).is_err() {
            debug!("Fake platform event dropped: dispatcher gone");
        }
    }

    /// Report one advertisement of `device_id`
    pub fn advertise(&self, device_id: &DeviceId) -> bool {
        let result = self
            .state
            .lock()
            .peripherals
            .get(device_id)
            .map(FakePeripheral::scan_result);
        match result {
            Some(result) => {
                self.emit(PlatformEvent::ScanResult(result));
                true
            }
            None => false,
        }
    }

    /// Push a notification if the characteristic is subscribed
    pub fn notify_value(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> bool {
        let value = value.into();
        {
            let mut state = self.state.lock();
            if !state
                .subscriptions
                .contains(&(device_id.clone(), service, characteristic))
            {
                return false;
            }
            if let Some(peripheral) = state.peripherals.get_mut(device_id) {
                peripheral.values.insert((service, characteristic), value.clone());
            }
        }
        self.emit(PlatformEvent::ValueChanged {
            device_id: device_id.clone(),
            service,
            characteristic,
            value,
        });
        true
    }

    /// Drop the link from the remote side
    pub fn drop_link(&self, device_id: &DeviceId, reason: u8) {
        self.state.lock().links.remove(device_id);
        self.emit(PlatformEvent::ConnectionChanged {
            device_id: device_id.clone(),
            connected: false,
            reason: Some(reason),
        });
    }

    pub fn is_linked(&self, device_id: &DeviceId) -> bool {
        self.state.lock().links.contains(device_id)
    }

    pub fn is_subscribed(&self, device_id: &DeviceId, service: Uuid, characteristic: Uuid) -> bool {
        self.state
            .lock()
            .subscriptions
            .contains(&(device_id.clone(), service, characteristic))
    }

    pub fn value(&self, device_id: &DeviceId, service: Uuid, characteristic: Uuid) -> Option<Vec<u8>> {
        self.state
            .lock()
            .peripherals
            .get(device_id)?
            .values
            .get(&(service, characteristic))
            .cloned()
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&PlatformCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Wait until a recorded call satisfies `predicate`
    pub async fn wait_for_call(&self, predicate: impl Fn(&PlatformCall) -> bool) -> PlatformCall {
        loop {
            let notified = self.calls_changed.notified();
            if let Some(call) = self.state.lock().calls.iter().find(|c| predicate(c)) {
                return call.clone();
            }
            notified.await;
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Record `call` and return whether completions should be posted
    fn record(&self, call: PlatformCall) -> bool {
        let silent = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.silent
        };
        self.calls_changed.notify_waiters();
        !silent
    }

    fn peripheral(&self, device_id: &DeviceId) -> Result<FakePeripheral> {
        self.state
            .lock()
            .peripherals
            .get(device_id)
            .cloned()
            .ok_or_else(|| BleError::device_not_found(device_id.as_str()))
    }

    fn require_link(&self, device_id: &DeviceId) -> Result<FakePeripheral> {
        if !self.is_linked(device_id) {
            return Err(BleError::DeviceDisconnected);
        }
        self.peripheral(device_id)
    }
}

impl PlatformAdapter for FakePlatform {
    fn capabilities(&self) -> PlatformCapabilities {
        self.state.lock().capabilities
    }

    fn availability(&self) -> AvailabilityState {
        self.state.lock().availability
    }

    fn set_adapter_enabled(&self, enabled: bool) -> Result<bool> {
        if !self.capabilities().adapter_toggle {
            return Err(BleError::not_supported("adapter toggle"));
        }
        let respond = self.record(PlatformCall::SetAdapterEnabled(enabled));
        let availability = if enabled {
            AvailabilityState::PoweredOn
        } else {
            AvailabilityState::PoweredOff
        };
        self.state.lock().availability = availability;
        if respond {
            self.emit(PlatformEvent::AvailabilityChanged(availability));
        }
        Ok(true)
    }

    fn start_scan(&self, filter: &NativeScanFilter) -> Result<()> {
        let respond = self.record(PlatformCall::StartScan(filter.clone()));
        let results: Vec<PlatformScanResult> = {
            let mut state = self.state.lock();
            state.scanning = true;
            state
                .peripherals
                .values()
                .filter(|p| p.advertising)
                .map(FakePeripheral::scan_result)
                .collect()
        };
        if respond {
            for result in results {
                self.emit(PlatformEvent::ScanResult(result));
            }
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        self.record(PlatformCall::StopScan);
        self.state.lock().scanning = false;
        Ok(())
    }

    fn is_scanning(&self) -> Option<bool> {
        Some(self.state.lock().scanning)
    }

    fn connect(&self, device_id: &DeviceId) -> Result<()> {
        let respond = self.record(PlatformCall::Connect(device_id.clone()));
        let known = self.state.lock().peripherals.contains_key(device_id);
        if known {
            self.state.lock().links.insert(device_id.clone());
        }
        if respond {
            self.emit(PlatformEvent::ConnectionChanged {
                device_id: device_id.clone(),
                connected: known,
                reason: (!known).then_some(CONNECTION_FAILED_TO_ESTABLISH),
            });
        }
        Ok(())
    }

    fn disconnect(&self, device_id: &DeviceId) -> Result<()> {
        let respond = self.record(PlatformCall::Disconnect(device_id.clone()));
        {
            let mut state = self.state.lock();
            state.links.remove(device_id);
            state.subscriptions.retain(|(id, _, _)| id != device_id);
        }
        if respond {
            self.emit(PlatformEvent::ConnectionChanged {
                device_id: device_id.clone(),
                connected: false,
                reason: Some(LOCAL_HOST_TERMINATED),
            });
        }
        Ok(())
    }

    fn discover_services(&self, device_id: &DeviceId) -> Result<()> {
        let peripheral = self.require_link(device_id)?;
        if !self.record(PlatformCall::DiscoverServices(device_id.clone())) {
            return Ok(());
        }

        let services = if peripheral.progressive {
            peripheral
                .services
                .iter()
                .map(|s| DiscoveredService::pending(s.uuid))
                .collect()
        } else {
            peripheral.services.iter().map(DiscoveredService::from).collect()
        };
        self.emit(PlatformEvent::ServicesDiscovered {
            device_id: device_id.clone(),
            status: GattStatus::SUCCESS,
            services,
        });
        Ok(())
    }

    fn discover_characteristics(&self, device_id: &DeviceId, service: Uuid) -> Result<()> {
        let peripheral = self.require_link(device_id)?;
        if !self.record(PlatformCall::DiscoverCharacteristics {
            device_id: device_id.clone(),
            service,
        }) {
            return Ok(());
        }

        let characteristics = peripheral
            .service(&service)
            .map(|s| {
                s.characteristics
                    .iter()
                    .map(|c| DiscoveredCharacteristic {
                        uuid: c.uuid,
                        properties: c.properties,
                        descriptors: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.emit(PlatformEvent::CharacteristicsDiscovered {
            device_id: device_id.clone(),
            service,
            status: GattStatus::SUCCESS,
            characteristics,
        });
        Ok(())
    }

    fn discover_descriptors(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let peripheral = self.require_link(device_id)?;
        if !self.record(PlatformCall::DiscoverDescriptors {
            device_id: device_id.clone(),
            service,
            characteristic,
        }) {
            return Ok(());
        }

        let descriptors = peripheral
            .service(&service)
            .and_then(|s| s.characteristic(&characteristic))
            .map(|c| c.descriptors.iter().map(|d| d.uuid).collect())
            .unwrap_or_default();
        self.emit(PlatformEvent::DescriptorsDiscovered {
            device_id: device_id.clone(),
            service,
            characteristic,
            status: GattStatus::SUCCESS,
            descriptors,
        });
        Ok(())
    }

    fn read_characteristic(&self, device_id: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<()> {
        let peripheral = self.require_link(device_id)?;
        if !self.record(PlatformCall::Read {
            device_id: device_id.clone(),
            service,
            characteristic,
        }) {
            return Ok(());
        }

        let (status, value) = if peripheral.has_characteristic(&service, &characteristic) {
            let value = peripheral
                .values
                .get(&(service, characteristic))
                .cloned()
                .unwrap_or_default();
            (GattStatus::SUCCESS, value)
        } else {
            (GattStatus::ATTR_NOT_FOUND, Vec::new())
        };
        self.emit(PlatformEvent::CharacteristicRead {
            device_id: device_id.clone(),
            service,
            characteristic,
            status,
            value,
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
        self.require_link(device_id)?;
        let respond = self.record(PlatformCall::Write {
            device_id: device_id.clone(),
            service,
            characteristic,
            value: value.to_vec(),
            write_type,
        });

        if let Some(peripheral) = self.state.lock().peripherals.get_mut(device_id) {
            peripheral.values.insert((service, characteristic), value.to_vec());
        }
        if respond && write_type == WriteType::WithResponse {
            self.emit(PlatformEvent::CharacteristicWritten {
                device_id: device_id.clone(),
                service,
                characteristic,
                status: GattStatus::SUCCESS,
            });
        }
        Ok(())
    }

    fn set_notify(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()> {
        self.require_link(device_id)?;
        let respond = self.record(PlatformCall::SetNotify {
            device_id: device_id.clone(),
            service,
            characteristic,
            enabled,
        });

        let local_only = {
            let mut state = self.state.lock();
            let key = (device_id.clone(), service, characteristic);
            if enabled {
                state.subscriptions.insert(key);
            } else {
                state.subscriptions.remove(&key);
            }
            state.capabilities.subscription_descriptor_write
        };
        if respond && !local_only {
            self.emit(PlatformEvent::NotificationStateChanged {
                device_id: device_id.clone(),
                service,
                characteristic,
                status: GattStatus::SUCCESS,
            });
        }
        Ok(())
    }

    fn write_descriptor(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.require_link(device_id)?;
        if !self.record(PlatformCall::WriteDescriptor {
            device_id: device_id.clone(),
            service,
            characteristic,
            descriptor,
            value: value.to_vec(),
        }) {
            return Ok(());
        }

        if descriptor == CCCD_UUID {
            let mut state = self.state.lock();
            let key = (device_id.clone(), service, characteristic);
            if value.iter().any(|b| *b != 0) {
                state.subscriptions.insert(key);
            } else {
                state.subscriptions.remove(&key);
            }
        }
        self.emit(PlatformEvent::DescriptorWritten {
            device_id: device_id.clone(),
            service,
            characteristic,
            descriptor,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn request_mtu(&self, device_id: &DeviceId, mtu: u16) -> Result<()> {
        if !self.capabilities().mtu_negotiation {
            return Err(BleError::not_supported("MTU negotiation"));
        }
        self.require_link(device_id)?;
        if !self.record(PlatformCall::RequestMtu {
            device_id: device_id.clone(),
            mtu,
        }) {
            return Ok(());
        }

        let negotiated = mtu.min(MAX_MTU);
        if let Some(peripheral) = self.state.lock().peripherals.get_mut(device_id) {
            peripheral.mtu = negotiated;
        }
        self.emit(PlatformEvent::MtuChanged {
            device_id: device_id.clone(),
            mtu: negotiated,
            status: GattStatus::SUCCESS,
        });
        Ok(())
    }

    fn maximum_write_length(&self, device_id: &DeviceId, write_type: WriteType) -> Result<usize> {
        let peripheral = self.require_link(device_id)?;
        Ok(match write_type {
            WriteType::WithResponse => 512,
            WriteType::WithoutResponse => usize::from(peripheral.mtu).saturating_sub(ATT_HEADER_LEN),
        })
    }

    fn read_rssi(&self, device_id: &DeviceId) -> Result<()> {
        if !self.capabilities().rssi {
            return Err(BleError::not_supported("RSSI reads"));
        }
        let peripheral = self.require_link(device_id)?;
        if self.record(PlatformCall::ReadRssi(device_id.clone())) {
            self.emit(PlatformEvent::RssiRead {
                device_id: device_id.clone(),
                rssi: peripheral.rssi,
                status: GattStatus::SUCCESS,
            });
        }
        Ok(())
    }

    fn is_paired(&self, device_id: &DeviceId) -> Result<bool> {
        if !self.capabilities().pairing {
            return Err(BleError::not_supported("bond state query"));
        }
        Ok(self.peripheral(device_id)?.paired)
    }

    fn pair(&self, device_id: &DeviceId) -> Result<()> {
        if !self.capabilities().pairing {
            return Err(BleError::not_supported("pairing"));
        }
        self.peripheral(device_id)?;
        if !self.record(PlatformCall::Pair(device_id.clone())) {
            return Ok(());
        }

        let outcome = {
            let mut state = self.state.lock();
            let outcome = state.bond_outcome;
            if let Some(peripheral) = state.peripherals.get_mut(device_id) {
                peripheral.paired = outcome == BondState::Bonded;
            }
            outcome
        };
        self.emit(PlatformEvent::BondStateChanged {
            device_id: device_id.clone(),
            state: BondState::Bonding,
        });
        self.emit(PlatformEvent::BondStateChanged {
            device_id: device_id.clone(),
            state: outcome,
        });
        Ok(())
    }

    fn unpair(&self, device_id: &DeviceId) -> Result<()> {
        if !self.capabilities().pairing {
            return Err(BleError::not_supported("unpairing"));
        }
        let respond = self.record(PlatformCall::Unpair(device_id.clone()));
        if let Some(peripheral) = self.state.lock().peripherals.get_mut(device_id) {
            peripheral.paired = false;
        }
        if respond {
            self.emit(PlatformEvent::BondStateChanged {
                device_id: device_id.clone(),
                state: BondState::None,
            });
        }
        Ok(())
    }

    fn connected_system_devices(&self) -> Result<Vec<SystemDevice>> {
        let state = self.state.lock();
        let mut devices: Vec<SystemDevice> = state
            .peripherals
            .values()
            .filter(|p| p.system_connected)
            .map(|p| SystemDevice {
                device_id: p.id.clone(),
                name: p.name.clone(),
                is_paired: Some(p.paired),
            })
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unible_core::{uuid_from_u16, AdvertisementRecord, BleCharacteristic, CharacteristicProperties};

    use crate::platform::platform_event_channel;

    fn heart_rate() -> FakePeripheral {
        FakePeripheral::new("HR")
            .with_name("Pulse")
            .with_manufacturer_data(ManufacturerData::new(0x004C, vec![0x02, 0x15]))
            .with_service(BleService::new(uuid_from_u16(0x180D)).with_characteristic(
                BleCharacteristic::new(uuid_from_u16(0x2A37), CharacteristicProperties::from_bits(0x12)),
            ))
    }

    #[test]
    fn test_advertisement_bytes_decode_back() {
        let record = AdvertisementRecord::parse(&heart_rate().advertisement_bytes());
        assert_eq!(record.local_name().as_deref(), Some("Pulse"));
        assert_eq!(record.service_uuids(), vec![uuid_from_u16(0x180D)]);
        assert_eq!(
            record.manufacturer_data(),
            Some(ManufacturerData::new(0x004C, vec![0x02, 0x15]))
        );
    }

    #[tokio::test]
    async fn test_connect_posts_completion_and_records_call() {
        let (tx, mut rx) = platform_event_channel();
        let fake = FakePlatform::new(tx).with_peripheral(heart_rate());
        let device = DeviceId::from("HR");

        fake.connect(&device).unwrap();
        assert!(fake.is_linked(&device));
        assert_eq!(
            rx.recv().await,
            Some(PlatformEvent::ConnectionChanged {
                device_id: device.clone(),
                connected: true,
                reason: None,
            })
        );
        assert_eq!(fake.calls(), vec![PlatformCall::Connect(device)]);
    }

    #[tokio::test]
    async fn test_silent_mode_records_without_posting() {
        let (tx, mut rx) = platform_event_channel();
        let fake = FakePlatform::new(tx).with_peripheral(heart_rate());
        fake.set_silent(true);

        fake.connect(&DeviceId::from("HR")).unwrap();
        assert_eq!(fake.count_calls(|c| matches!(c, PlatformCall::Connect(_))), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notifications_require_subscription() {
        let (tx, _rx) = platform_event_channel();
        let fake = FakePlatform::new(tx).with_peripheral(heart_rate());
        let device = DeviceId::from("HR");
        let (s, c) = (uuid_from_u16(0x180D), uuid_from_u16(0x2A37));

        assert!(!fake.notify_value(&device, s, c, vec![0x00, 0x48]));
        fake.connect(&device).unwrap();
        fake.set_notify(&device, s, c, true).unwrap();
        assert!(fake.notify_value(&device, s, c, vec![0x00, 0x48]));
    }
}
