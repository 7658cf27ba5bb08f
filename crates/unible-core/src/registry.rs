//! Registry of live GATT sessions and cached device metadata
//!
//! One session per device. The registry also holds the persisted
//! device → service-UUID cache and the names seen in advertisements.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::ServiceCache;
use crate::errors::{BleError, Result};
use crate::session::GattSession;
use crate::types::{ConnectionState, DeviceId};

/// Advertised names kept for naming system devices
pub const MAX_ADVERTISED_NAMES: usize = 1024;

/// What `connect()` should do after consulting the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// A new `Connecting` session was registered; issue the platform connect
    Proceed,
    /// The device is already connected; report it without touching the platform
    AlreadyConnected,
}

pub struct DeviceRegistry {
    sessions: DashMap<DeviceId, GattSession>,
    service_cache: DashMap<DeviceId, Vec<String>>,
    advertised_names: DashMap<DeviceId, String>,
    /// Locally requested disconnects whose platform event is still due
    disconnect_echoes: DashMap<DeviceId, usize>,
    store: Arc<dyn ServiceCache>,
}

impl DeviceRegistry {
    /// Create the registry, loading persisted service lists from `store`
    pub fn new(store: Arc<dyn ServiceCache>) -> Self {
        let service_cache = DashMap::new();
        match store.load_all() {
            Ok(entries) => {
                for (device, services) in entries {
                    service_cache.insert(DeviceId::from(device), services);
                }
            }
            Err(e) => warn!("Failed to load service cache: {}", e),
        }
        info!("Device registry loaded {} cached devices", service_cache.len());

        Self {
            sessions: DashMap::new(),
            service_cache,
            advertised_names: DashMap::new(),
            disconnect_echoes: DashMap::new(),
            store,
        }
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Lookup-or-create on connect
    ///
    /// Connected sessions short-circuit (an incidental one is promoted to a
    /// regular session), connecting sessions reject, anything else is
    /// replaced by a fresh `Connecting` session.
    pub fn begin_connect(&self, device_id: &DeviceId, incidental: bool) -> Result<ConnectDecision> {
        Ok(match self.begin_connect_with(device_id, incidental, || ())? {
            Some(()) => ConnectDecision::Proceed,
            None => ConnectDecision::AlreadyConnected,
        })
    }

    /// [`begin_connect`](Self::begin_connect) running `on_proceed` under the entry lock
    ///
    /// `on_proceed` runs only when a fresh `Connecting` session was inserted,
    /// before any other caller can observe or remove that session. `None`
    /// means the device was already connected.
    pub fn begin_connect_with<R>(
        &self,
        device_id: &DeviceId,
        incidental: bool,
        on_proceed: impl FnOnce() -> R,
    ) -> Result<Option<R>> {
        match self.sessions.entry(device_id.clone()) {
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                match session.state() {
                    ConnectionState::Connected => {
                        if !incidental {
                            session.promote();
                        }
                        Ok(None)
                    }
                    ConnectionState::Connecting => Err(BleError::ConnectionInProgress),
                    ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                        debug!("Replacing stale session for {}", device_id);
                        entry.insert(GattSession::connecting(device_id.clone(), incidental));
                        Ok(Some(on_proceed()))
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(GattSession::connecting(device_id.clone(), incidental));
                Ok(Some(on_proceed()))
            }
        }
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.sessions.contains_key(device_id)
    }

    /// Whether a caller-requested (non-incidental) session exists
    pub fn is_known(&self, device_id: &DeviceId) -> bool {
        self.sessions
            .get(device_id)
            .is_some_and(|session| !session.is_incidental())
    }

    pub fn connection_state(&self, device_id: &DeviceId) -> ConnectionState {
        self.sessions
            .get(device_id)
            .map(|session| session.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn with_session<R>(&self, device_id: &DeviceId, f: impl FnOnce(&GattSession) -> R) -> Option<R> {
        self.sessions.get(device_id).map(|session| f(session.value()))
    }

    pub fn with_session_mut<R>(
        &self,
        device_id: &DeviceId,
        f: impl FnOnce(&mut GattSession) -> R,
    ) -> Option<R> {
        self.sessions
            .get_mut(device_id)
            .map(|mut session| f(session.value_mut()))
    }

    /// Run `f` on the session, or fail with `DeviceNotFound`
    pub fn session_mut<R>(
        &self,
        device_id: &DeviceId,
        f: impl FnOnce(&mut GattSession) -> Result<R>,
    ) -> Result<R> {
        self.with_session_mut(device_id, f)
            .unwrap_or_else(|| Err(BleError::device_not_found(device_id.as_str())))
    }

    pub fn remove(&self, device_id: &DeviceId) -> Option<GattSession> {
        self.sessions.remove(device_id).map(|(_, session)| session)
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // ------------------------------------------------------------------------
    // Service Cache
    // ------------------------------------------------------------------------

    pub fn cached_services(&self, device_id: &DeviceId) -> Option<Vec<String>> {
        self.service_cache.get(device_id).map(|entry| entry.value().clone())
    }

    /// Remember the service list of `device_id` in memory
    ///
    /// Returns the stored strings; persisting them through
    /// [`service_store`](Self::service_store) is up to the caller.
    pub fn remember_services(&self, device_id: &DeviceId, services: &[Uuid]) -> Vec<String> {
        let services: Vec<String> = services.iter().map(Uuid::to_string).collect();
        self.service_cache.insert(device_id.clone(), services.clone());
        services
    }

    pub fn service_store(&self) -> Arc<dyn ServiceCache> {
        Arc::clone(&self.store)
    }

    // ------------------------------------------------------------------------
    // Advertised Names
    // ------------------------------------------------------------------------

    /// Record an advertised name, evicting an arbitrary entry once full
    pub fn remember_name(&self, device_id: &DeviceId, name: &str) {
        if name.is_empty() {
            return;
        }
        if self.advertised_names.len() >= MAX_ADVERTISED_NAMES
            && !self.advertised_names.contains_key(device_id)
        {
            let evicted = self
                .advertised_names
                .iter()
                .next()
                .map(|entry| entry.key().clone());
            if let Some(evicted) = evicted {
                self.advertised_names.remove(&evicted);
            }
        }
        self.advertised_names.insert(device_id.clone(), name.to_string());
    }

    pub fn advertised_name_count(&self) -> usize {
        self.advertised_names.len()
    }

    pub fn advertised_name(&self, device_id: &DeviceId) -> Option<String> {
        self.advertised_names.get(device_id).map(|name| name.value().clone())
    }

    // ------------------------------------------------------------------------
    // Disconnect Echoes
    // ------------------------------------------------------------------------

    /// Note a locally requested disconnect; its platform event is an echo
    pub fn expect_disconnect_echo(&self, device_id: &DeviceId) {
        *self.disconnect_echoes.entry(device_id.clone()).or_insert(0) += 1;
    }

    /// Consume one expected echo, `true` if the disconnect event was one
    pub fn take_disconnect_echo(&self, device_id: &DeviceId) -> bool {
        let Some(mut pending) = self.disconnect_echoes.get_mut(device_id) else {
            return false;
        };
        *pending -= 1;
        let drained = *pending == 0;
        drop(pending);
        if drained {
            self.disconnect_echoes.remove_if(device_id, |_, count| *count == 0);
        }
        true
    }

    /// Forget echoes that never arrived once the link is up again
    pub fn clear_disconnect_echoes(&self, device_id: &DeviceId) {
        self.disconnect_echoes.remove(device_id);
    }

    pub fn cached_device_count(&self) -> usize {
        self.service_cache.len()
    }

    pub fn cache_snapshot(&self) -> HashMap<DeviceId, Vec<String>> {
        self.service_cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryServiceCache;
    use crate::types::uuid_from_u16;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(MemoryServiceCache::new()))
    }

    #[test]
    fn test_connect_lifecycle_decisions() {
        let registry = registry();
        let device = DeviceId::from("D");

        assert_eq!(registry.begin_connect(&device, false).unwrap(), ConnectDecision::Proceed);
        assert_eq!(
            registry.begin_connect(&device, false).unwrap_err(),
            BleError::ConnectionInProgress
        );

        registry.with_session_mut(&device, GattSession::mark_connected);
        assert_eq!(
            registry.begin_connect(&device, false).unwrap(),
            ConnectDecision::AlreadyConnected
        );
        assert_eq!(registry.len(), 1);

        registry.with_session_mut(&device, GattSession::mark_disconnecting);
        assert_eq!(registry.begin_connect(&device, false).unwrap(), ConnectDecision::Proceed);
        assert_eq!(registry.connection_state(&device), ConnectionState::Connecting);
    }

    #[test]
    fn test_incidental_sessions_are_not_known_until_promoted() {
        let registry = registry();
        let device = DeviceId::from("D");

        registry.begin_connect(&device, true).unwrap();
        assert!(registry.contains(&device));
        assert!(!registry.is_known(&device));

        registry.with_session_mut(&device, GattSession::mark_connected);
        registry.begin_connect(&device, false).unwrap();
        assert!(registry.is_known(&device));
    }

    #[test]
    fn test_service_cache_loads_and_persists() {
        let store = Arc::new(MemoryServiceCache::new().with_entry("A", vec!["x".into()]));
        let registry = DeviceRegistry::new(store.clone());
        assert_eq!(registry.cached_services(&DeviceId::from("A")), Some(vec!["x".to_string()]));

        let device = DeviceId::from("B");
        let stored = registry.remember_services(&device, &[uuid_from_u16(0x180D)]);
        let expected = vec!["0000180d-0000-1000-8000-00805f9b34fb".to_string()];
        assert_eq!(stored, expected);
        assert_eq!(registry.cached_services(&device), Some(expected.clone()));
        assert!(store.load_all().unwrap().get("B").is_none());

        registry.service_store().store(device.as_str(), &stored).unwrap();
        assert_eq!(store.load_all().unwrap().get("B"), Some(&expected));
    }

    #[test]
    fn test_missing_session_is_device_not_found() {
        let registry = registry();
        let err = registry
            .session_mut(&DeviceId::from("nope"), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.code(), "DeviceNotFound");
        assert_eq!(
            registry.connection_state(&DeviceId::from("nope")),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_connect_registration_runs_only_on_proceed() {
        let registry = registry();
        let device = DeviceId::from("D");
        let mut registered = 0;

        let first = registry.begin_connect_with(&device, false, || {
            registered += 1;
            registered
        });
        assert_eq!(first.unwrap(), Some(1));

        assert_eq!(
            registry
                .begin_connect_with(&device, false, || registered += 1)
                .unwrap_err(),
            BleError::ConnectionInProgress
        );

        registry.with_session_mut(&device, GattSession::mark_connected);
        assert_eq!(
            registry.begin_connect_with(&device, false, || registered += 1).unwrap(),
            None
        );
        assert_eq!(registered, 1);
    }

    #[test]
    fn test_disconnect_echoes_are_counted() {
        let registry = registry();
        let device = DeviceId::from("D");
        assert!(!registry.take_disconnect_echo(&device));

        registry.expect_disconnect_echo(&device);
        registry.expect_disconnect_echo(&device);
        assert!(registry.take_disconnect_echo(&device));
        assert!(registry.take_disconnect_echo(&device));
        assert!(!registry.take_disconnect_echo(&device));

        registry.expect_disconnect_echo(&device);
        registry.clear_disconnect_echoes(&device);
        assert!(!registry.take_disconnect_echo(&device));
    }

    #[test]
    fn test_advertised_names_are_bounded() {
        let registry = registry();
        for i in 0..MAX_ADVERTISED_NAMES + 10 {
            registry.remember_name(&DeviceId::from(format!("R{i}")), "Tag");
        }
        assert_eq!(registry.advertised_name_count(), MAX_ADVERTISED_NAMES);

        let latest = DeviceId::from(format!("R{}", MAX_ADVERTISED_NAMES + 9));
        assert_eq!(registry.advertised_name(&latest), Some("Tag".to_string()));

        // Renaming a known device never evicts
        registry.remember_name(&latest, "Tag 2");
        assert_eq!(registry.advertised_name_count(), MAX_ADVERTISED_NAMES);
        assert_eq!(registry.advertised_name(&latest), Some("Tag 2".to_string()));
    }
}
