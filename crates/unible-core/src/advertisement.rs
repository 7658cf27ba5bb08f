//! Advertisement data decoding
//!
//! Raw advertising data is a sequence of AD structures:
//!
//! ```text
//! [length: 1][type: 1][payload: length - 1]
//! ```
//!
//! Sections are accumulated per type. Peripherals that split one logical
//! service-data record across several structures repeat its 2-byte UUID
//! header in every fragment; when a later fragment starts with the same two
//! bytes as the accumulated data, only the bytes after its header are
//! appended.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::types::{uuid_from_u16, uuid_from_u32, ManufacturerData};

// ----------------------------------------------------------------------------
// AD Types
// ----------------------------------------------------------------------------

pub const AD_TYPE_FLAGS: u8 = 0x01;
pub const AD_TYPE_INCOMPLETE_SERVICES_16: u8 = 0x02;
pub const AD_TYPE_COMPLETE_SERVICES_16: u8 = 0x03;
pub const AD_TYPE_INCOMPLETE_SERVICES_32: u8 = 0x04;
pub const AD_TYPE_COMPLETE_SERVICES_32: u8 = 0x05;
pub const AD_TYPE_INCOMPLETE_SERVICES_128: u8 = 0x06;
pub const AD_TYPE_COMPLETE_SERVICES_128: u8 = 0x07;
pub const AD_TYPE_SHORTENED_LOCAL_NAME: u8 = 0x08;
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const AD_TYPE_SERVICE_DATA_16: u8 = 0x16;
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

const UUID_HEADER_LENGTH: usize = 2;

// ----------------------------------------------------------------------------
// Service Data
// ----------------------------------------------------------------------------

/// Payload of a 16-bit service-data section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub uuid: u16,
    pub data: Vec<u8>,
}

impl ServiceData {
    pub fn full_uuid(&self) -> Uuid {
        uuid_from_u16(self.uuid)
    }
}

// ----------------------------------------------------------------------------
// Advertisement Record
// ----------------------------------------------------------------------------

/// Merged advertisement sections keyed by AD type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementRecord {
    sections: BTreeMap<u8, Vec<u8>>,
}

impl AdvertisementRecord {
    /// Decode a raw advertisement buffer
    ///
    /// Parsing stops at the first section whose length byte is 0 or 1, or
    /// whose declared length runs past the end of the buffer. Whatever was
    /// accumulated before that point is kept.
    pub fn parse(data: &[u8]) -> Self {
        let mut record = Self::default();
        let mut index = 0;

        while index < data.len() {
            match record.parse_section(data, index) {
                Some(consumed) => index += consumed,
                None => break,
            }
        }

        record
    }

    /// Merge one AD structure starting at `start`, returning the bytes consumed
    fn parse_section(&mut self, data: &[u8], start: usize) -> Option<usize> {
        let length = data[start] as usize;
        if length <= 1 {
            return None;
        }

        let ad_type = *data.get(start + 1)?;
        let payload = data.get(start + 2..start + 1 + length)?;

        match self.sections.get_mut(&ad_type) {
            Some(existing) => {
                let offset = if shares_uuid_header(existing, payload) {
                    UUID_HEADER_LENGTH
                } else {
                    0
                };
                existing.extend_from_slice(&payload[offset..]);
            }
            None => {
                self.sections.insert(ad_type, payload.to_vec());
            }
        }

        Some(length + 1)
    }

    pub fn section(&self, ad_type: u8) -> Option<&[u8]> {
        self.sections.get(&ad_type).map(Vec::as_slice)
    }

    pub fn sections(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.sections.iter().map(|(t, d)| (*t, d.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Merged manufacturer-specific data; the company id is little-endian
    pub fn manufacturer_data(&self) -> Option<ManufacturerData> {
        self.section(AD_TYPE_MANUFACTURER_DATA)
            .and_then(ManufacturerData::from_bytes)
    }

    /// Merged 16-bit service data; a header-only section carries no payload
    pub fn service_data(&self) -> Option<ServiceData> {
        let data = self.section(AD_TYPE_SERVICE_DATA_16)?;
        if data.len() <= UUID_HEADER_LENGTH {
            return None;
        }
        Some(ServiceData {
            uuid: u16::from_le_bytes([data[0], data[1]]),
            data: data[UUID_HEADER_LENGTH..].to_vec(),
        })
    }

    /// Complete local name, falling back to the shortened one
    pub fn local_name(&self) -> Option<String> {
        self.section(AD_TYPE_COMPLETE_LOCAL_NAME)
            .or_else(|| self.section(AD_TYPE_SHORTENED_LOCAL_NAME))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Every advertised service UUID, expanded to 128 bits
    pub fn service_uuids(&self) -> Vec<Uuid> {
        let mut uuids = Vec::new();

        for ad_type in [AD_TYPE_INCOMPLETE_SERVICES_16, AD_TYPE_COMPLETE_SERVICES_16] {
            if let Some(data) = self.section(ad_type) {
                uuids.extend(
                    data.chunks_exact(2)
                        .map(|c| uuid_from_u16(u16::from_le_bytes([c[0], c[1]]))),
                );
            }
        }

        for ad_type in [AD_TYPE_INCOMPLETE_SERVICES_32, AD_TYPE_COMPLETE_SERVICES_32] {
            if let Some(data) = self.section(ad_type) {
                uuids.extend(
                    data.chunks_exact(4)
                        .map(|c| uuid_from_u32(u32::from_le_bytes([c[0], c[1], c[2], c[3]]))),
                );
            }
        }

        for ad_type in [AD_TYPE_INCOMPLETE_SERVICES_128, AD_TYPE_COMPLETE_SERVICES_128] {
            if let Some(data) = self.section(ad_type) {
                uuids.extend(data.chunks_exact(16).map(uuid_from_wire));
            }
        }

        uuids.dedup();
        uuids
    }
}

fn shares_uuid_header(existing: &[u8], incoming: &[u8]) -> bool {
    existing.len() >= UUID_HEADER_LENGTH
        && incoming.len() >= UUID_HEADER_LENGTH
        && existing[..UUID_HEADER_LENGTH] == incoming[..UUID_HEADER_LENGTH]
}

/// 128-bit UUIDs are transmitted fully little-endian
fn uuid_from_wire(chunk: &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(chunk);
    bytes.reverse();
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_service_data_is_merged() {
        // Two service-data fragments for UUID 0xAABB
        let raw = [
            0x05, 0x16, 0xBB, 0xAA, 0x01, 0x02, //
            0x04, 0x16, 0xBB, 0xAA, 0x03,
        ];
        let record = AdvertisementRecord::parse(&raw);

        let merged = record.section(AD_TYPE_SERVICE_DATA_16).unwrap();
        assert_eq!(merged.len(), 4 + (3 - 2));

        let service = record.service_data().unwrap();
        assert_eq!(service.uuid, 0xAABB);
        assert_eq!(service.data, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_sections_without_shared_header_concatenate_whole() {
        let raw = [
            0x03, 0xFF, 0x4C, 0x00, //
            0x03, 0xFF, 0x02, 0x15,
        ];
        let record = AdvertisementRecord::parse(&raw);
        assert_eq!(
            record.section(AD_TYPE_MANUFACTURER_DATA).unwrap(),
            &[0x4C, 0x00, 0x02, 0x15]
        );

        let manufacturer = record.manufacturer_data().unwrap();
        assert_eq!(manufacturer.company_identifier, 0x004C);
        assert_eq!(manufacturer.data, vec![0x02, 0x15]);
    }

    #[test]
    fn test_zero_length_section_stops_parsing() {
        let raw = [0x02, 0x01, 0x06, 0x00, 0x03, 0xFF, 0x4C, 0x00];
        let record = AdvertisementRecord::parse(&raw);
        assert_eq!(record.len(), 1);
        assert_eq!(record.section(AD_TYPE_FLAGS).unwrap(), &[0x06]);
        assert!(record.manufacturer_data().is_none());
    }

    #[test]
    fn test_truncated_section_keeps_earlier_sections() {
        let raw = [0x02, 0x01, 0x06, 0x09, 0x09, b'a', b'b'];
        let record = AdvertisementRecord::parse(&raw);
        assert_eq!(record.len(), 1);
        assert!(record.local_name().is_none());
    }

    #[test]
    fn test_empty_and_degenerate_buffers() {
        assert!(AdvertisementRecord::parse(&[]).is_empty());
        assert!(AdvertisementRecord::parse(&[0x01]).is_empty());
        assert!(AdvertisementRecord::parse(&[0x05]).is_empty());
    }

    #[test]
    fn test_header_only_service_data_has_no_payload() {
        let record = AdvertisementRecord::parse(&[0x03, 0x16, 0x0D, 0x18]);
        assert!(record.service_data().is_none());
    }

    #[test]
    fn test_names_and_service_lists() {
        let raw = [
            0x05, 0x03, 0x0D, 0x18, 0x0F, 0x18, //
            0x04, 0x08, b'H', b'R', b'M', //
            0x06, 0x09, b'H', b'R', b' ', b'P', b'r', //
        ];
        let record = AdvertisementRecord::parse(&raw);

        assert_eq!(record.local_name().as_deref(), Some("HR Pr"));
        assert_eq!(
            record.service_uuids(),
            vec![uuid_from_u16(0x180D), uuid_from_u16(0x180F)]
        );
    }

    #[test]
    fn test_128_bit_service_uuid_is_little_endian_on_the_wire() {
        let uuid = Uuid::parse_str("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap();
        let mut raw = vec![0x11, AD_TYPE_COMPLETE_SERVICES_128];
        let mut wire = *uuid.as_bytes();
        wire.reverse();
        raw.extend_from_slice(&wire);

        let record = AdvertisementRecord::parse(&raw);
        assert_eq!(record.service_uuids(), vec![uuid]);
    }
}
