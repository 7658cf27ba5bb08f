//! Progressive GATT discovery tracking
//!
//! Some platforms report the whole GATT tree in one callback, others report
//! services first, then characteristics per service, then descriptors per
//! characteristic. [`DiscoveryProgress`] absorbs either shape: every level
//! starts as "not yet reported" (`None`) and discovery is complete once no
//! required level is still missing.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::types::{BleCharacteristic, BleDescriptor, BleService, CharacteristicProperties};

// ----------------------------------------------------------------------------
// Platform-Reported Tree
// ----------------------------------------------------------------------------

/// A service as reported by the platform; `characteristics` is `None` until known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Option<Vec<DiscoveredCharacteristic>>,
}

/// A characteristic as reported by the platform; `descriptors` is `None` until known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Option<Vec<Uuid>>,
}

impl DiscoveredService {
    pub fn pending(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: None,
        }
    }
}

impl From<&BleService> for DiscoveredService {
    fn from(service: &BleService) -> Self {
        Self {
            uuid: service.uuid,
            characteristics: Some(
                service
                    .characteristics
                    .iter()
                    .map(DiscoveredCharacteristic::from)
                    .collect(),
            ),
        }
    }
}

impl From<&BleCharacteristic> for DiscoveredCharacteristic {
    fn from(characteristic: &BleCharacteristic) -> Self {
        Self {
            uuid: characteristic.uuid,
            properties: characteristic.properties,
            descriptors: Some(characteristic.descriptors.iter().map(|d| d.uuid).collect()),
        }
    }
}

/// Follow-up platform request needed to make progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStep {
    Characteristics { service: Uuid },
    Descriptors { service: Uuid, characteristic: Uuid },
}

// ----------------------------------------------------------------------------
// Discovery Progress
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DiscoveryProgress {
    with_descriptors: bool,
    services: Option<Vec<DiscoveredService>>,
}

impl DiscoveryProgress {
    pub fn new(with_descriptors: bool) -> Self {
        Self {
            with_descriptors,
            services: None,
        }
    }

    pub fn with_descriptors(&self) -> bool {
        self.with_descriptors
    }

    /// Record the service list and return the requests still needed
    pub fn on_services(&mut self, services: Vec<DiscoveredService>) -> Vec<DiscoveryStep> {
        let mut steps = Vec::new();
        for service in &services {
            match &service.characteristics {
                None => steps.push(DiscoveryStep::Characteristics {
                    service: service.uuid,
                }),
                Some(characteristics) => {
                    steps.extend(self.descriptor_steps(service.uuid, characteristics))
                }
            }
        }
        self.services = Some(services);
        steps
    }

    /// Record one service's characteristics and return the requests still needed
    pub fn on_characteristics(
        &mut self,
        service: Uuid,
        characteristics: Vec<DiscoveredCharacteristic>,
    ) -> Vec<DiscoveryStep> {
        let steps = self.descriptor_steps(service, &characteristics);

        let Some(entry) = self.service_awaiting(service) else {
            debug!("Characteristics reported for unexpected service {}", service);
            return Vec::new();
        };
        entry.characteristics = Some(characteristics);
        steps
    }

    /// Record one characteristic's descriptors
    pub fn on_descriptors(&mut self, service: Uuid, characteristic: Uuid, descriptors: Vec<Uuid>) {
        let entry = self
            .services
            .iter_mut()
            .flatten()
            .filter(|s| s.uuid == service)
            .filter_map(|s| s.characteristics.as_mut())
            .flatten()
            .find(|c| c.uuid == characteristic && c.descriptors.is_none());

        match entry {
            Some(entry) => entry.descriptors = Some(descriptors),
            None => debug!(
                "Descriptors reported for unexpected characteristic {}/{}",
                service, characteristic
            ),
        }
    }

    /// Characteristics reported so far versus characteristics whose
    /// descriptors are known, for one service
    pub fn descriptor_progress(&self, service: Uuid) -> Option<(usize, usize)> {
        let characteristics = self
            .services
            .as_ref()?
            .iter()
            .find(|s| s.uuid == service)?
            .characteristics
            .as_ref()?;
        let completed = characteristics
            .iter()
            .filter(|c| c.descriptors.is_some())
            .count();
        Some((characteristics.len(), completed))
    }

    pub fn is_complete(&self) -> bool {
        let Some(services) = &self.services else {
            return false;
        };
        services.iter().all(|service| match &service.characteristics {
            None => false,
            Some(characteristics) => {
                !self.with_descriptors || characteristics.iter().all(|c| c.descriptors.is_some())
            }
        })
    }

    /// The discovered tree; levels not yet reported are empty
    pub fn services(&self) -> Vec<BleService> {
        self.services
            .iter()
            .flatten()
            .map(|service| BleService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .flatten()
                    .map(|c| BleCharacteristic {
                        uuid: c.uuid,
                        properties: c.properties,
                        descriptors: c
                            .descriptors
                            .iter()
                            .flatten()
                            .map(|uuid| BleDescriptor { uuid: *uuid })
                            .collect(),
                    })
                    .collect(),
            })
            .collect()
    }

    fn descriptor_steps(
        &self,
        service: Uuid,
        characteristics: &[DiscoveredCharacteristic],
    ) -> Vec<DiscoveryStep> {
        if !self.with_descriptors {
            return Vec::new();
        }
        characteristics
            .iter()
            .filter(|c| c.descriptors.is_none())
            .map(|c| DiscoveryStep::Descriptors {
                service,
                characteristic: c.uuid,
            })
            .collect()
    }

    fn service_awaiting(&mut self, service: Uuid) -> Option<&mut DiscoveredService> {
        let services = self.services.as_mut()?;
        let index = services
            .iter()
            .position(|s| s.uuid == service && s.characteristics.is_none())?;
        services.get_mut(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{uuid_from_u16, CharacteristicProperty, CCCD_UUID};

    fn characteristic(uuid: u16) -> DiscoveredCharacteristic {
        DiscoveredCharacteristic {
            uuid: uuid_from_u16(uuid),
            properties: CharacteristicProperties::empty().with(CharacteristicProperty::Read),
            descriptors: None,
        }
    }

    #[test]
    fn test_progressive_discovery_without_descriptors() {
        let mut progress = DiscoveryProgress::new(false);
        assert!(!progress.is_complete());

        let steps = progress.on_services(vec![
            DiscoveredService::pending(uuid_from_u16(0x1800)),
            DiscoveredService::pending(uuid_from_u16(0x180D)),
        ]);
        assert_eq!(steps.len(), 2);
        assert!(!progress.is_complete());

        let steps = progress.on_characteristics(uuid_from_u16(0x1800), vec![characteristic(0x2A00)]);
        assert!(steps.is_empty());
        assert!(!progress.is_complete());

        progress.on_characteristics(uuid_from_u16(0x180D), vec![characteristic(0x2A37)]);
        assert!(progress.is_complete());

        let services = progress.services();
        assert_eq!(services.len(), 2);
        assert_eq!(services[1].characteristics[0].uuid, uuid_from_u16(0x2A37));
    }

    #[test]
    fn test_descriptors_gate_completion_when_requested() {
        let mut progress = DiscoveryProgress::new(true);
        let service = uuid_from_u16(0x180D);
        progress.on_services(vec![DiscoveredService::pending(service)]);

        let steps =
            progress.on_characteristics(service, vec![characteristic(0x2A37), characteristic(0x2A38)]);
        assert_eq!(steps.len(), 2);
        assert_eq!(progress.descriptor_progress(service), Some((2, 0)));

        progress.on_descriptors(service, uuid_from_u16(0x2A37), vec![CCCD_UUID]);
        assert_eq!(progress.descriptor_progress(service), Some((2, 1)));
        assert!(!progress.is_complete());

        progress.on_descriptors(service, uuid_from_u16(0x2A38), vec![]);
        assert!(progress.is_complete());
        assert!(progress.services()[0].characteristics[0].has_descriptor(&CCCD_UUID));
    }

    #[test]
    fn test_full_tree_in_one_report_completes_immediately() {
        let tree = BleService::new(uuid_from_u16(0x180F)).with_characteristic(
            BleCharacteristic::new(uuid_from_u16(0x2A19), CharacteristicProperties::from_bits(0x12))
                .with_descriptor(CCCD_UUID),
        );
        let mut progress = DiscoveryProgress::new(true);
        let steps = progress.on_services(vec![DiscoveredService::from(&tree)]);

        assert!(steps.is_empty());
        assert!(progress.is_complete());
        assert_eq!(progress.services(), vec![tree]);
    }

    #[test]
    fn test_empty_device_completes() {
        let mut progress = DiscoveryProgress::new(true);
        progress.on_services(Vec::new());
        assert!(progress.is_complete());
        assert!(progress.services().is_empty());
    }

    #[test]
    fn test_repeated_service_uuid_fills_each_instance() {
        let service = uuid_from_u16(0xFFF0);
        let mut progress = DiscoveryProgress::new(false);
        progress.on_services(vec![
            DiscoveredService::pending(service),
            DiscoveredService::pending(service),
        ]);

        progress.on_characteristics(service, vec![characteristic(0xFFF1)]);
        assert!(!progress.is_complete());
        progress.on_characteristics(service, vec![characteristic(0xFFF2)]);
        assert!(progress.is_complete());
    }
}
