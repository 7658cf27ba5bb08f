//! unible core
//!
//! Platform-neutral building blocks of a BLE central:
//!
//! - [`advertisement`]: decoding of raw advertising data into merged sections
//! - [`filter`]: scan filter description and software evaluation
//! - [`governor`]: scan start rate limiting with deferred retry
//! - [`pending`]: exactly-once correlation of platform callbacks with callers
//! - [`session`] and [`discovery`]: per-device GATT session state
//! - [`registry`] and [`cache`]: live sessions and the persisted service cache
//! - [`status`]: translation of platform status codes into [`BleError`]

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod advertisement;
pub mod cache;
pub mod discovery;
pub mod errors;
pub mod filter;
pub mod governor;
pub mod pending;
pub mod registry;
pub mod session;
pub mod status;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use advertisement::{AdvertisementRecord, ServiceData};
pub use cache::{JsonFileServiceCache, MemoryServiceCache, ServiceCache, DEFAULT_CACHE_NAMESPACE};
pub use discovery::{DiscoveredCharacteristic, DiscoveredService, DiscoveryProgress, DiscoveryStep};
pub use errors::{BleError, CharacteristicCapability, Result};
pub use filter::{ManufacturerDataFilter, NativeScanFilter, ScanFilter, ScanFilterEngine};
pub use governor::{GovernorConfig, ScanAdmission, ScanRateGovernor};
pub use pending::{OperationId, OperationKey, OperationKind, PendingOperation, PendingOperationRegistry};
pub use registry::{ConnectDecision, DeviceRegistry, MAX_ADVERTISED_NAMES};
pub use session::GattSession;
pub use status::{hci_reason_name, BondState, GattStatus, ScanFailure};
pub use types::{
    now_millis, parse_uuid, parse_uuids, short_uuid, uuid_from_u16, uuid_from_u32,
    AvailabilityState, BleCharacteristic, BleDescriptor, BleService, CharacteristicProperties,
    CharacteristicProperty, ConnectionState, DeviceId, ManufacturerData, NotificationMode,
    ScanResult, WriteType, CCCD_UUID,
};
