//! Core data model for the BLE central
//!
//! Devices are addressed by a stable string [`DeviceId`]. Services,
//! characteristics and descriptors are identified by full 128-bit UUIDs; the
//! same UUID may appear under several services, so lookups always go through
//! the `(service, characteristic)` pair.

use core::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{BleError, Result};

// ----------------------------------------------------------------------------
// Device Identifier
// ----------------------------------------------------------------------------

/// Opaque, stable identifier of a remote device (MAC address or platform UUID)
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ----------------------------------------------------------------------------
// UUID Normalization
// ----------------------------------------------------------------------------

/// Low 96 bits of the Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`
const BLUETOOTH_BASE_UUID_LOW: u128 = 0x0000_1000_8000_0080_5F9B_34FB;

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5F9B_34FB);

/// Expand a 16-bit assigned number onto the Bluetooth base UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expand a 32-bit assigned number onto the Bluetooth base UUID
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID_LOW)
}

/// The 16-bit short form of `uuid`, if it sits on the Bluetooth base UUID
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & ((1u128 << 96) - 1) != BLUETOOTH_BASE_UUID_LOW {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Parse a 16-bit, 32-bit or 128-bit UUID string into its full form
///
/// `"180D"`, `"0000180d"` and `"0000180d-0000-1000-8000-00805f9b34fb"` all
/// yield the same value.
pub fn parse_uuid(input: &str) -> Result<Uuid> {
    let trimmed = input.trim();
    let is_hex = !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_hexdigit());

    match trimmed.len() {
        4 | 8 if is_hex => u32::from_str_radix(trimmed, 16)
            .map(uuid_from_u32)
            .map_err(|_| BleError::invalid_argument(format!("Invalid UUID: {input}"))),
        _ => Uuid::parse_str(trimmed)
            .map_err(|_| BleError::invalid_argument(format!("Invalid UUID: {input}"))),
    }
}

/// Parse a list of UUID strings, failing on the first malformed entry
pub fn parse_uuids<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<Uuid>> {
    inputs.iter().map(|s| parse_uuid(s.as_ref())).collect()
}

// ----------------------------------------------------------------------------
// Characteristic Properties
// ----------------------------------------------------------------------------

/// A single GATT characteristic property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharacteristicProperty {
    Broadcast,
    Read,
    WriteWithoutResponse,
    Write,
    Notify,
    Indicate,
    AuthenticatedSignedWrites,
    ExtendedProperties,
}

impl CharacteristicProperty {
    pub const ALL: [CharacteristicProperty; 8] = [
        CharacteristicProperty::Broadcast,
        CharacteristicProperty::Read,
        CharacteristicProperty::WriteWithoutResponse,
        CharacteristicProperty::Write,
        CharacteristicProperty::Notify,
        CharacteristicProperty::Indicate,
        CharacteristicProperty::AuthenticatedSignedWrites,
        CharacteristicProperty::ExtendedProperties,
    ];

    /// Bit in the GATT characteristic declaration's property byte
    pub const fn bit(self) -> u8 {
        match self {
            CharacteristicProperty::Broadcast => 0x01,
            CharacteristicProperty::Read => 0x02,
            CharacteristicProperty::WriteWithoutResponse => 0x04,
            CharacteristicProperty::Write => 0x08,
            CharacteristicProperty::Notify => 0x10,
            CharacteristicProperty::Indicate => 0x20,
            CharacteristicProperty::AuthenticatedSignedWrites => 0x40,
            CharacteristicProperty::ExtendedProperties => 0x80,
        }
    }

    /// Ordinal used on the RPC boundary
    pub fn ordinal(self) -> u8 {
        self.bit().trailing_zeros() as u8
    }
}

/// Set of characteristic properties, stored in GATT property-byte layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, property: CharacteristicProperty) -> bool {
        self.0 & property.bit() != 0
    }

    pub fn insert(&mut self, property: CharacteristicProperty) {
        self.0 |= property.bit();
    }

    pub fn with(mut self, property: CharacteristicProperty) -> Self {
        self.insert(property);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = CharacteristicProperty> + '_ {
        CharacteristicProperty::ALL
            .into_iter()
            .filter(move |p| self.contains(*p))
    }
}

impl FromIterator<CharacteristicProperty> for CharacteristicProperties {
    fn from_iter<I: IntoIterator<Item = CharacteristicProperty>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::empty(), |props, property| props.with(property))
    }
}

// ----------------------------------------------------------------------------
// GATT Tree
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleDescriptor {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<BleDescriptor>,
}

impl BleCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            descriptors: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(BleDescriptor { uuid });
        self
    }

    pub fn has_descriptor(&self, uuid: &Uuid) -> bool {
        self.descriptors.iter().any(|d| &d.uuid == uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleService {
    pub uuid: Uuid,
    pub characteristics: Vec<BleCharacteristic>,
}

impl BleService {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: BleCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&BleCharacteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// Locate a characteristic by its `(service, characteristic)` pair
pub fn find_characteristic<'a>(
    services: &'a [BleService],
    service: &Uuid,
    characteristic: &Uuid,
) -> Option<&'a BleCharacteristic> {
    services
        .iter()
        .filter(|s| &s.uuid == service)
        .find_map(|s| s.characteristic(characteristic))
}

// ----------------------------------------------------------------------------
// States and Modes
// ----------------------------------------------------------------------------

/// Adapter availability as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvailabilityState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Connecting,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationMode {
    Disabled,
    Notification,
    Indication,
}

impl NotificationMode {
    /// Value written to the CCCD for this mode
    pub const fn cccd_value(self) -> [u8; 2] {
        match self {
            NotificationMode::Disabled => [0x00, 0x00],
            NotificationMode::Notification => [0x01, 0x00],
            NotificationMode::Indication => [0x02, 0x00],
        }
    }

    pub fn is_enabled(self) -> bool {
        self != NotificationMode::Disabled
    }
}

// ----------------------------------------------------------------------------
// Scan Results
// ----------------------------------------------------------------------------

/// Manufacturer-specific advertisement payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerData {
    pub company_identifier: u16,
    pub data: Vec<u8>,
}

impl ManufacturerData {
    pub fn new(company_identifier: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            company_identifier,
            data: data.into(),
        }
    }

    /// Split a raw manufacturer section: 2-byte little-endian company id, then payload
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }
        Some(Self {
            company_identifier: u16::from_le_bytes([bytes[0], bytes[1]]),
            data: bytes[2..].to_vec(),
        })
    }
}

impl fmt::Display for ManufacturerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}:{}", self.company_identifier, hex::encode(&self.data))
    }
}

/// A discovered (or OS-connected) device as reported to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub is_paired: Option<bool>,
    pub rssi: Option<i16>,
    pub manufacturer_data: Vec<ManufacturerData>,
    pub services: Vec<Uuid>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl ScanResult {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            name: None,
            is_paired: None,
            rssi: None,
            manufacturer_data: Vec::new(),
            services: Vec::new(),
            timestamp: now_millis(),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_forms_expand_onto_base_uuid() {
        let expected = Uuid::parse_str("0000180d-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(parse_uuid("180D").unwrap(), expected);
        assert_eq!(parse_uuid("180d").unwrap(), expected);
        assert_eq!(parse_uuid("0000180D").unwrap(), expected);
        assert_eq!(
            parse_uuid("0000180D-0000-1000-8000-00805F9B34FB").unwrap(),
            expected
        );
        assert_eq!(
            parse_uuid("180D").unwrap().to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_malformed_uuid_is_invalid_argument() {
        for bad in ["", "18G0", "12345", "not-a-uuid"] {
            let err = parse_uuid(bad).unwrap_err();
            assert_eq!(err.code(), "InvalidArgument", "input {bad:?}");
        }
    }

    #[test]
    fn test_short_uuid_only_for_base_uuids() {
        assert_eq!(short_uuid(&uuid_from_u16(0x2902)), Some(0x2902));
        assert_eq!(short_uuid(&CCCD_UUID), Some(0x2902));
        assert_eq!(short_uuid(&uuid_from_u32(0x0001_0000)), None);
        assert_eq!(short_uuid(&Uuid::new_v4()), None);
    }

    #[test]
    fn test_property_bits_follow_gatt_layout() {
        let props = CharacteristicProperties::from_bits(0x12);
        assert!(props.contains(CharacteristicProperty::Read));
        assert!(props.contains(CharacteristicProperty::Notify));
        assert!(!props.contains(CharacteristicProperty::Write));
        assert_eq!(
            props.iter().collect::<Vec<_>>(),
            vec![CharacteristicProperty::Read, CharacteristicProperty::Notify]
        );
        assert_eq!(CharacteristicProperty::Notify.ordinal(), 4);
        assert_eq!(CharacteristicProperty::ExtendedProperties.ordinal(), 7);
    }

    #[test]
    fn test_find_characteristic_uses_service_and_characteristic() {
        let shared = uuid_from_u16(0x2a00);
        let services = vec![
            BleService::new(uuid_from_u16(0x1800)).with_characteristic(BleCharacteristic::new(
                shared,
                CharacteristicProperties::empty().with(CharacteristicProperty::Read),
            )),
            BleService::new(uuid_from_u16(0x1801)).with_characteristic(BleCharacteristic::new(
                shared,
                CharacteristicProperties::empty().with(CharacteristicProperty::Write),
            )),
        ];

        let found = find_characteristic(&services, &uuid_from_u16(0x1801), &shared).unwrap();
        assert!(found.properties.contains(CharacteristicProperty::Write));
        assert!(find_characteristic(&services, &uuid_from_u16(0x180d), &shared).is_none());
    }

    #[test]
    fn test_manufacturer_data_company_is_little_endian() {
        let data = ManufacturerData::from_bytes(&[0x4c, 0x00, 0x02, 0x15]).unwrap();
        assert_eq!(data.company_identifier, 0x004c);
        assert_eq!(data.data, vec![0x02, 0x15]);
        assert!(ManufacturerData::from_bytes(&[0x4c]).is_none());
    }

    #[test]
    fn test_cccd_values() {
        assert_eq!(NotificationMode::Notification.cccd_value(), [0x01, 0x00]);
        assert_eq!(NotificationMode::Indication.cccd_value(), [0x02, 0x00]);
        assert_eq!(NotificationMode::Disabled.cccd_value(), [0x00, 0x00]);
    }
}
