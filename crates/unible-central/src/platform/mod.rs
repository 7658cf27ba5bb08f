//! Platform adapter seam
//!
//! A [`PlatformAdapter`] submits work to a native BLE stack and returns
//! immediately. Completions, state changes and notifications come back as
//! [`PlatformEvent`]s on the channel handed to the adapter at construction;
//! the central's dispatcher consumes them in order. Version and platform
//! differences are expressed through [`PlatformCapabilities`] rather than
//! branches in the central.

use tokio::sync::mpsc;
use uuid::Uuid;

use unible_core::{
    AvailabilityState, BleError, BondState, DeviceId, DiscoveredCharacteristic, DiscoveredService,
    GattStatus, ManufacturerData, NativeScanFilter, Result, WriteType,
};

#[cfg(feature = "native")]
pub mod native;
pub mod fake;

// ----------------------------------------------------------------------------
// Capabilities
// ----------------------------------------------------------------------------

/// What the underlying stack can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// MTU is negotiated explicitly; otherwise it derives from the write length
    pub mtu_negotiation: bool,
    /// Subscribing needs a separate CCCD write after enabling local routing
    pub subscription_descriptor_write: bool,
    pub pairing: bool,
    /// The adapter can be switched on and off programmatically
    pub adapter_toggle: bool,
    pub rssi: bool,
    /// The stack distinguishes a "scanning too frequently" failure
    pub reports_scan_throttling: bool,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            mtu_negotiation: false,
            subscription_descriptor_write: false,
            pairing: false,
            adapter_toggle: false,
            rssi: true,
            reports_scan_throttling: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Platform Events
// ----------------------------------------------------------------------------

/// Advertisement as delivered by the platform
///
/// Platforms that expose the raw advertising bytes put them in
/// `advertisement`; fields the platform decoded itself are merged with
/// whatever the bytes contain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformScanResult {
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub is_paired: Option<bool>,
    pub advertisement: Option<Vec<u8>>,
    pub manufacturer_data: Vec<ManufacturerData>,
    pub services: Vec<Uuid>,
}

/// A device the OS reports as connected, possibly by another application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemDevice {
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub is_paired: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    AvailabilityChanged(AvailabilityState),
    ScanResult(PlatformScanResult),
    ScanFailed {
        code: i32,
    },
    ConnectionChanged {
        device_id: DeviceId,
        connected: bool,
        /// HCI reason for a disconnect or failed connect
        reason: Option<u8>,
    },
    ServicesDiscovered {
        device_id: DeviceId,
        status: GattStatus,
        services: Vec<DiscoveredService>,
    },
    CharacteristicsDiscovered {
        device_id: DeviceId,
        service: Uuid,
        status: GattStatus,
        characteristics: Vec<DiscoveredCharacteristic>,
    },
    DescriptorsDiscovered {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        status: GattStatus,
        descriptors: Vec<Uuid>,
    },
    CharacteristicRead {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        status: GattStatus,
    },
    NotificationStateChanged {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        status: GattStatus,
    },
    DescriptorWritten {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    },
    ValueChanged {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    MtuChanged {
        device_id: DeviceId,
        mtu: u16,
        status: GattStatus,
    },
    RssiRead {
        device_id: DeviceId,
        rssi: i16,
        status: GattStatus,
    },
    BondStateChanged {
        device_id: DeviceId,
        state: BondState,
    },
}

pub type PlatformEventSender = mpsc::UnboundedSender<PlatformEvent>;
pub type PlatformEventReceiver = mpsc::UnboundedReceiver<PlatformEvent>;

pub fn platform_event_channel() -> (PlatformEventSender, PlatformEventReceiver) {
    mpsc::unbounded_channel()
}

// ----------------------------------------------------------------------------
// Adapter Trait
// ----------------------------------------------------------------------------

/// Submit-style interface to a native BLE stack
///
/// Methods return once the request has been handed to the stack. An `Err`
/// means the request was never issued; its completion event will not come.
pub trait PlatformAdapter: Send + Sync + 'static {
    fn capabilities(&self) -> PlatformCapabilities;

    fn availability(&self) -> AvailabilityState;

    fn set_adapter_enabled(&self, _enabled: bool) -> Result<bool> {
        Err(BleError::not_supported("adapter toggle"))
    }

    fn start_scan(&self, filter: &NativeScanFilter) -> Result<()>;

    fn stop_scan(&self) -> Result<()>;

    /// Platform scanning flag, when the stack exposes one
    fn is_scanning(&self) -> Option<bool> {
        None
    }

    fn connect(&self, device_id: &DeviceId) -> Result<()>;

    fn disconnect(&self, device_id: &DeviceId) -> Result<()>;

    fn discover_services(&self, device_id: &DeviceId) -> Result<()>;

    fn discover_characteristics(&self, device_id: &DeviceId, service: Uuid) -> Result<()>;

    fn discover_descriptors(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()>;

    fn read_characteristic(&self, device_id: &DeviceId, service: Uuid, characteristic: Uuid)
        -> Result<()>;

    fn write_characteristic(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    /// Enable or disable notification delivery for a characteristic
    ///
    /// With `subscription_descriptor_write` this only routes notifications
    /// locally and completes synchronously; otherwise completion arrives as
    /// `NotificationStateChanged`.
    fn set_notify(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()>;

    fn write_descriptor(
        &self,
        _device_id: &DeviceId,
        _service: Uuid,
        _characteristic: Uuid,
        _descriptor: Uuid,
        _value: &[u8],
    ) -> Result<()> {
        Err(BleError::not_supported("descriptor writes"))
    }

    fn request_mtu(&self, _device_id: &DeviceId, _mtu: u16) -> Result<()> {
        Err(BleError::not_supported("MTU negotiation"))
    }

    /// Largest payload a single write may carry
    fn maximum_write_length(&self, device_id: &DeviceId, write_type: WriteType) -> Result<usize>;

    fn read_rssi(&self, _device_id: &DeviceId) -> Result<()> {
        Err(BleError::not_supported("RSSI reads"))
    }

    fn is_paired(&self, _device_id: &DeviceId) -> Result<bool> {
        Err(BleError::not_supported("bond state query"))
    }

    fn pair(&self, _device_id: &DeviceId) -> Result<()> {
        Err(BleError::NotImplemented)
    }

    fn unpair(&self, _device_id: &DeviceId) -> Result<()> {
        Err(BleError::not_supported("unpairing"))
    }

    /// Devices the OS holds connections to
    fn connected_system_devices(&self) -> Result<Vec<SystemDevice>>;
}
