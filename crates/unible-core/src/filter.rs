//! Scan-result filtering
//!
//! A [`ScanFilter`] has three dimensions: name prefixes, service UUIDs and
//! manufacturer data. A device is accepted when ANY configured dimension
//! matches it. Native OS scan filters can express services and manufacturer
//! data but not name prefixes, so a filter with a name prefix is evaluated
//! entirely in software and the native scan runs unfiltered.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{BleError, Result};
use crate::types::{parse_uuid, ManufacturerData};

// ----------------------------------------------------------------------------
// Filter Description
// ----------------------------------------------------------------------------

/// Manufacturer-data match: company id plus an optional masked payload prefix
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManufacturerDataFilter {
    pub company_identifier: u16,
    pub data: Option<Vec<u8>>,
    pub mask: Option<Vec<u8>>,
}

impl ManufacturerDataFilter {
    pub fn new(company_identifier: u16) -> Self {
        Self {
            company_identifier,
            data: None,
            mask: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_mask(mut self, mask: impl Into<Vec<u8>>) -> Self {
        self.mask = Some(mask.into());
        self
    }

    fn validate(&self) -> Result<()> {
        match (&self.data, &self.mask) {
            (Some(data), Some(mask)) if data.len() != mask.len() => {
                Err(BleError::invalid_argument(format!(
                    "Manufacturer data filter for {:#06x}: data length {} does not match mask length {}",
                    self.company_identifier,
                    data.len(),
                    mask.len()
                )))
            }
            (None, Some(_)) => Err(BleError::invalid_argument(format!(
                "Manufacturer data filter for {:#06x}: mask without data",
                self.company_identifier
            ))),
            _ => Ok(()),
        }
    }

    /// Whether an advertised manufacturer entry satisfies this filter
    pub fn matches(&self, advertised: &ManufacturerData) -> bool {
        advertised.company_identifier == self.company_identifier
            && masked_prefix_matches(self.data.as_deref(), self.mask.as_deref(), &advertised.data)
    }
}

/// Compare `find` against the start of `payload` under `mask`
///
/// No `find` matches anything. The default mask is all ones. A mask of a
/// different length than `find`, or a payload shorter than `find`, rejects.
fn masked_prefix_matches(find: Option<&[u8]>, mask: Option<&[u8]>, payload: &[u8]) -> bool {
    let Some(find) = find else {
        return true;
    };
    if let Some(mask) = mask {
        if mask.len() != find.len() {
            return false;
        }
    }
    if payload.len() < find.len() {
        return false;
    }

    find.iter().enumerate().all(|(i, expected)| {
        let m = mask.map_or(0xFF, |mask| mask[i]);
        expected & m == payload[i] & m
    })
}

/// Declarative scan filter as supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanFilter {
    pub services: Vec<String>,
    pub name_prefixes: Vec<String>,
    pub manufacturer_data: Vec<ManufacturerDataFilter>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, uuid: impl Into<String>) -> Self {
        self.services.push(uuid.into());
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefixes.push(prefix.into());
        self
    }

    pub fn with_manufacturer_data(mut self, filter: ManufacturerDataFilter) -> Self {
        self.manufacturer_data.push(filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.name_prefixes.is_empty()
            && self.manufacturer_data.is_empty()
    }

    /// Name prefixes cannot be pushed to the OS, so their presence forces
    /// software evaluation of every dimension
    pub fn uses_custom_filters(&self) -> bool {
        !self.name_prefixes.is_empty()
    }

    /// Reject malformed UUIDs and data/mask mismatches before any scan starts
    pub fn validate(&self) -> Result<()> {
        self.service_uuids()?;
        self.manufacturer_data
            .iter()
            .try_for_each(ManufacturerDataFilter::validate)
    }

    /// Service filter entries normalized to full 128-bit UUIDs
    pub fn service_uuids(&self) -> Result<Vec<Uuid>> {
        self.services.iter().map(|s| parse_uuid(s)).collect()
    }

    /// Native filter for the OS scanner; empty when filtering runs in software
    pub fn native_filter(&self) -> Result<NativeScanFilter> {
        if self.uses_custom_filters() {
            return Ok(NativeScanFilter::default());
        }
        Ok(NativeScanFilter {
            services: self.service_uuids()?,
            manufacturer_data: self.manufacturer_data.clone(),
        })
    }
}

/// Filter dimensions the OS scanner evaluates itself
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NativeScanFilter {
    pub services: Vec<Uuid>,
    pub manufacturer_data: Vec<ManufacturerDataFilter>,
}

impl NativeScanFilter {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.manufacturer_data.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Filter Engine
// ----------------------------------------------------------------------------

/// Software evaluation of the active scan filter
#[derive(Debug, Clone, Default)]
pub struct ScanFilterEngine {
    filter: Option<ActiveFilter>,
}

#[derive(Debug, Clone)]
struct ActiveFilter {
    name_prefixes: Vec<String>,
    services: Vec<Uuid>,
    manufacturer_data: Vec<ManufacturerDataFilter>,
}

impl ScanFilterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `filter`, or accept everything with `None`
    pub fn set_filter(&mut self, filter: Option<&ScanFilter>) -> Result<()> {
        self.filter = match filter {
            Some(filter) => {
                filter.validate()?;
                Some(ActiveFilter {
                    name_prefixes: filter.name_prefixes.clone(),
                    services: filter.service_uuids()?,
                    manufacturer_data: filter.manufacturer_data.clone(),
                })
            }
            None => None,
        };
        Ok(())
    }

    pub fn clear(&mut self) {
        self.filter = None;
    }

    pub fn is_active(&self) -> bool {
        self.filter.is_some()
    }

    /// Accept or reject one advertised device
    pub fn filter_device(
        &self,
        name: Option<&str>,
        manufacturer_data: &[ManufacturerData],
        services: &[Uuid],
    ) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };

        let has_name = !filter.name_prefixes.is_empty();
        let has_services = !filter.services.is_empty();
        let has_manufacturer = !filter.manufacturer_data.is_empty();

        if !has_name && !has_services && !has_manufacturer {
            return true;
        }

        (has_name && filter.name_matches(name))
            || (has_services && filter.services_match(services))
            || (has_manufacturer && filter.manufacturer_matches(manufacturer_data))
    }
}

impl ActiveFilter {
    fn name_matches(&self, name: Option<&str>) -> bool {
        match name {
            Some(name) if !name.is_empty() => self
                .name_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str())),
            _ => false,
        }
    }

    fn services_match(&self, advertised: &[Uuid]) -> bool {
        self.services.iter().any(|uuid| advertised.contains(uuid))
    }

    fn manufacturer_matches(&self, advertised: &[ManufacturerData]) -> bool {
        self.manufacturer_data
            .iter()
            .any(|filter| advertised.iter().any(|entry| filter.matches(entry)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::uuid_from_u16;

    fn engine_with(filter: ScanFilter) -> ScanFilterEngine {
        let mut engine = ScanFilterEngine::new();
        engine.set_filter(Some(&filter)).unwrap();
        engine
    }

    #[test]
    fn test_no_filter_accepts_everything() {
        let engine = ScanFilterEngine::new();
        assert!(engine.filter_device(None, &[], &[]));

        let empty = engine_with(ScanFilter::new());
        assert!(empty.filter_device(None, &[], &[]));
    }

    #[test]
    fn test_service_only_filter() {
        let engine = engine_with(ScanFilter::new().with_service("180D"));

        assert!(engine.filter_device(
            Some("anything"),
            &[],
            &[uuid_from_u16(0x180D), uuid_from_u16(0x1800)]
        ));
        assert!(!engine.filter_device(Some("anything"), &[], &[uuid_from_u16(0x1800)]));
        assert!(!engine.filter_device(None, &[], &[]));
    }

    #[test]
    fn test_masked_manufacturer_prefix_match() {
        let engine = engine_with(ScanFilter::new().with_manufacturer_data(
            ManufacturerDataFilter::new(0x004C)
                .with_data(vec![0x02])
                .with_mask(vec![0xFF]),
        ));

        let ibeacon = ManufacturerData::new(0x004C, vec![0x02, 0x15, 0x00]);
        let other = ManufacturerData::new(0x004C, vec![0x03, 0x15]);
        let wrong_company = ManufacturerData::new(0x0059, vec![0x02, 0x15]);

        assert!(engine.filter_device(None, &[ibeacon], &[]));
        assert!(!engine.filter_device(None, &[other], &[]));
        assert!(!engine.filter_device(None, &[wrong_company], &[]));
    }

    #[test]
    fn test_mask_ignores_cleared_bits() {
        let filter = ManufacturerDataFilter::new(0x0001)
            .with_data(vec![0xA0, 0x01])
            .with_mask(vec![0xF0, 0xFF]);
        assert!(filter.matches(&ManufacturerData::new(0x0001, vec![0xAF, 0x01])));
        assert!(!filter.matches(&ManufacturerData::new(0x0001, vec![0xB0, 0x01])));
    }

    #[test]
    fn test_company_only_filter_matches_any_payload() {
        let filter = ManufacturerDataFilter::new(0x004C);
        assert!(filter.matches(&ManufacturerData::new(0x004C, vec![])));
        assert!(filter.matches(&ManufacturerData::new(0x004C, vec![0x99])));
    }

    #[test]
    fn test_short_payload_rejects() {
        let filter = ManufacturerDataFilter::new(0x004C).with_data(vec![0x02, 0x15, 0x01]);
        assert!(!filter.matches(&ManufacturerData::new(0x004C, vec![0x02])));
    }

    #[test]
    fn test_dimensions_are_ored() {
        let engine = engine_with(
            ScanFilter::new()
                .with_name_prefix("HR")
                .with_service("180F"),
        );

        assert!(engine.filter_device(Some("HR-100"), &[], &[]));
        assert!(engine.filter_device(Some("Thermo"), &[], &[uuid_from_u16(0x180F)]));
        assert!(!engine.filter_device(Some("Thermo"), &[], &[uuid_from_u16(0x180D)]));
    }

    #[test]
    fn test_name_prefix_is_case_sensitive_and_needs_a_name() {
        let engine = engine_with(ScanFilter::new().with_name_prefix("Polar"));
        assert!(engine.filter_device(Some("Polar H10"), &[], &[]));
        assert!(!engine.filter_device(Some("polar H10"), &[], &[]));
        assert!(!engine.filter_device(Some(""), &[], &[]));
        assert!(!engine.filter_device(None, &[], &[]));
    }

    #[test]
    fn test_native_filter_split() {
        let native_only = ScanFilter::new()
            .with_service("180D")
            .with_manufacturer_data(ManufacturerDataFilter::new(0x004C));
        assert!(!native_only.uses_custom_filters());
        let native = native_only.native_filter().unwrap();
        assert_eq!(native.services, vec![uuid_from_u16(0x180D)]);
        assert_eq!(native.manufacturer_data.len(), 1);

        let mixed = native_only.with_name_prefix("HR");
        assert!(mixed.uses_custom_filters());
        assert!(mixed.native_filter().unwrap().is_empty());
    }

    #[test]
    fn test_validation_rejects_bad_input() {
        let bad_uuid = ScanFilter::new().with_service("xyz");
        assert_eq!(bad_uuid.validate().unwrap_err().code(), "InvalidArgument");

        let bad_mask = ScanFilter::new().with_manufacturer_data(
            ManufacturerDataFilter::new(1)
                .with_data(vec![1, 2])
                .with_mask(vec![0xFF]),
        );
        assert_eq!(bad_mask.validate().unwrap_err().code(), "InvalidArgument");

        let mut engine = ScanFilterEngine::new();
        assert!(engine.set_filter(Some(&bad_mask)).is_err());
        assert!(!engine.is_active());
    }
}
