//! Per-device GATT session state
//!
//! A session exists from `connect()` until terminal disconnect. It owns the
//! connection state, the discovered GATT tree, the single in-flight
//! discovery and per-characteristic subscription state. Operation validation
//! happens here so that it runs before any platform call is issued.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::discovery::DiscoveryProgress;
use crate::errors::{BleError, CharacteristicCapability, Result};
use crate::types::{
    find_characteristic, BleCharacteristic, BleService, CharacteristicProperty, ConnectionState,
    DeviceId, NotificationMode, WriteType,
};

// ----------------------------------------------------------------------------
// GATT Session
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GattSession {
    device_id: DeviceId,
    state: ConnectionState,
    /// Opened only to inspect an OS-connected device; torn down afterwards
    incidental: bool,
    services: Option<Vec<BleService>>,
    discovery: Option<DiscoveryProgress>,
    mtu: Option<u16>,
    subscriptions: HashMap<(Uuid, Uuid), NotificationMode>,
}

impl GattSession {
    /// A session that has just requested a platform connection
    pub fn connecting(device_id: DeviceId, incidental: bool) -> Self {
        Self {
            device_id,
            state: ConnectionState::Connecting,
            incidental,
            services: None,
            discovery: None,
            mtu: None,
            subscriptions: HashMap::new(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    pub fn is_incidental(&self) -> bool {
        self.incidental
    }

    /// A caller asked for this connection explicitly; keep it open
    pub fn promote(&mut self) {
        self.incidental = false;
    }

    pub fn mark_connected(&mut self) {
        debug!("Session {} connected", self.device_id);
        self.state = ConnectionState::Connected;
    }

    pub fn mark_disconnecting(&mut self) {
        self.state = ConnectionState::Disconnecting;
    }

    pub fn require_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BleError::DeviceDisconnected)
        }
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    pub fn services(&self) -> Option<&[BleService]> {
        self.services.as_deref()
    }

    pub fn set_services(&mut self, services: Vec<BleService>) {
        self.services = Some(services);
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_some()
    }

    /// Start a discovery unless one is in flight. Returns `true` if started.
    pub fn begin_discovery(&mut self, with_descriptors: bool) -> bool {
        if self.discovery.is_some() {
            return false;
        }
        self.discovery = Some(DiscoveryProgress::new(with_descriptors));
        true
    }

    pub fn discovery_mut(&mut self) -> Option<&mut DiscoveryProgress> {
        self.discovery.as_mut()
    }

    /// Take the in-flight discovery if it has completed, storing its tree
    pub fn complete_discovery(&mut self) -> Option<Vec<BleService>> {
        if !self.discovery.as_ref().is_some_and(DiscoveryProgress::is_complete) {
            return None;
        }
        let services = self.discovery.take()?.services();
        self.services = Some(services.clone());
        Some(services)
    }

    pub fn abort_discovery(&mut self) -> bool {
        self.discovery.take().is_some()
    }

    // ------------------------------------------------------------------------
    // Operation Validation
    // ------------------------------------------------------------------------

    pub fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Result<&BleCharacteristic> {
        self.services
            .as_deref()
            .and_then(|services| find_characteristic(services, service, characteristic))
            .ok_or_else(|| BleError::characteristic_not_found(characteristic))
    }

    pub fn validate_read(&self, service: &Uuid, characteristic: &Uuid) -> Result<()> {
        let found = self.characteristic(service, characteristic)?;
        if !found.properties.contains(CharacteristicProperty::Read) {
            return Err(BleError::CharacteristicDoesNotSupport(
                CharacteristicCapability::Read,
            ));
        }
        Ok(())
    }

    pub fn validate_write(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
        write_type: WriteType,
    ) -> Result<()> {
        let found = self.characteristic(service, characteristic)?;
        let (property, capability) = match write_type {
            WriteType::WithResponse => (CharacteristicProperty::Write, CharacteristicCapability::Write),
            WriteType::WithoutResponse => (
                CharacteristicProperty::WriteWithoutResponse,
                CharacteristicCapability::WriteWithoutResponse,
            ),
        };
        if !found.properties.contains(property) {
            return Err(BleError::CharacteristicDoesNotSupport(capability));
        }
        Ok(())
    }

    /// Check `mode` against the characteristic; disabling needs either property
    pub fn validate_notify(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
        mode: NotificationMode,
    ) -> Result<&BleCharacteristic> {
        let found = self.characteristic(service, characteristic)?;
        let props = found.properties;
        let supported = match mode {
            NotificationMode::Notification => props.contains(CharacteristicProperty::Notify),
            NotificationMode::Indication => props.contains(CharacteristicProperty::Indicate),
            NotificationMode::Disabled => {
                props.contains(CharacteristicProperty::Notify)
                    || props.contains(CharacteristicProperty::Indicate)
            }
        };
        if !supported {
            let capability = match mode {
                NotificationMode::Indication => CharacteristicCapability::Indicate,
                _ => CharacteristicCapability::Notify,
            };
            return Err(BleError::CharacteristicDoesNotSupport(capability));
        }
        Ok(found)
    }

    // ------------------------------------------------------------------------
    // Link State
    // ------------------------------------------------------------------------

    pub fn set_subscription(&mut self, service: Uuid, characteristic: Uuid, mode: NotificationMode) {
        if mode.is_enabled() {
            self.subscriptions.insert((service, characteristic), mode);
        } else {
            self.subscriptions.remove(&(service, characteristic));
        }
    }

    pub fn subscription(&self, service: &Uuid, characteristic: &Uuid) -> NotificationMode {
        self.subscriptions
            .get(&(*service, *characteristic))
            .copied()
            .unwrap_or(NotificationMode::Disabled)
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = Some(mtu);
    }

    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveredService;
    use crate::types::{uuid_from_u16, CharacteristicProperties};

    fn connected_session() -> GattSession {
        let mut session = GattSession::connecting(DeviceId::from("D"), false);
        session.mark_connected();
        session.set_services(vec![BleService::new(uuid_from_u16(0x180D)).with_characteristic(
            BleCharacteristic::new(
                uuid_from_u16(0x2A37),
                [CharacteristicProperty::Read, CharacteristicProperty::Notify]
                    .into_iter()
                    .collect::<CharacteristicProperties>(),
            ),
        )]);
        session
    }

    #[test]
    fn test_write_mode_validation() {
        let session = connected_session();
        let (s, c) = (uuid_from_u16(0x180D), uuid_from_u16(0x2A37));

        assert_eq!(
            session.validate_write(&s, &c, WriteType::WithResponse).unwrap_err(),
            BleError::CharacteristicDoesNotSupport(CharacteristicCapability::Write)
        );
        assert_eq!(
            session.validate_write(&s, &c, WriteType::WithoutResponse).unwrap_err(),
            BleError::CharacteristicDoesNotSupport(CharacteristicCapability::WriteWithoutResponse)
        );
        assert!(session.validate_read(&s, &c).is_ok());
    }

    #[test]
    fn test_notify_validation() {
        let session = connected_session();
        let (s, c) = (uuid_from_u16(0x180D), uuid_from_u16(0x2A37));

        assert!(session.validate_notify(&s, &c, NotificationMode::Notification).is_ok());
        assert!(session.validate_notify(&s, &c, NotificationMode::Disabled).is_ok());
        assert_eq!(
            session.validate_notify(&s, &c, NotificationMode::Indication).unwrap_err(),
            BleError::CharacteristicDoesNotSupport(CharacteristicCapability::Indicate)
        );
    }

    #[test]
    fn test_unknown_characteristic_before_discovery() {
        let session = GattSession::connecting(DeviceId::from("D"), false);
        let err = session
            .validate_read(&uuid_from_u16(0x180D), &uuid_from_u16(0x2A37))
            .unwrap_err();
        assert_eq!(err.code(), "CharacteristicNotFound");
        assert_eq!(session.require_connected().unwrap_err(), BleError::DeviceDisconnected);
    }

    #[test]
    fn test_single_discovery_in_flight() {
        let mut session = connected_session();
        assert!(session.begin_discovery(false));
        assert!(!session.begin_discovery(true));
        assert!(session.complete_discovery().is_none());

        session
            .discovery_mut()
            .unwrap()
            .on_services(vec![DiscoveredService {
                uuid: uuid_from_u16(0x180F),
                characteristics: Some(Vec::new()),
            }]);
        let services = session.complete_discovery().unwrap();
        assert_eq!(services.len(), 1);
        assert!(!session.is_discovering());
        assert_eq!(session.services().unwrap()[0].uuid, uuid_from_u16(0x180F));
    }

    #[test]
    fn test_subscription_tracking() {
        let mut session = connected_session();
        let (s, c) = (uuid_from_u16(0x180D), uuid_from_u16(0x2A37));
        session.set_subscription(s, c, NotificationMode::Notification);
        assert_eq!(session.subscription(&s, &c), NotificationMode::Notification);
        session.set_subscription(s, c, NotificationMode::Disabled);
        assert_eq!(session.subscription(&s, &c), NotificationMode::Disabled);
    }
}
