//! Platform event dispatcher
//!
//! One task consumes the platform event channel in order, so for any device
//! a connection-state change is always applied before completions of
//! operations issued after it.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use unible_core::{
    hci_reason_name, now_millis, BleError, BondState, DeviceId, DiscoveryStep, GattStatus,
    OperationKey, OperationKind, Result, CCCD_UUID,
};

use crate::central::{Completion, Inner};
use crate::events::CentralEvent;
use crate::platform::{PlatformAdapter, PlatformEvent, PlatformEventReceiver};

pub(crate) fn spawn_dispatcher<P: PlatformAdapter>(
    inner: &Arc<Inner<P>>,
    mut events: PlatformEventReceiver,
) -> JoinHandle<()> {
    let inner = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.handle_platform_event(event);
        }
        debug!("Platform event dispatcher stopped");
    })
}

fn characteristic_key(
    kind: OperationKind,
    device_id: &DeviceId,
    service: Uuid,
    characteristic: Uuid,
) -> OperationKey {
    OperationKey::characteristic(kind, device_id, service, characteristic)
}

impl<P: PlatformAdapter> Inner<P> {
    pub(crate) fn handle_platform_event(&self, event: PlatformEvent) {
        trace!("Platform event: {:?}", event);
        match event {
            PlatformEvent::AvailabilityChanged(state) => {
                info!("Bluetooth availability changed: {:?}", state);
                self.events.emit(CentralEvent::AvailabilityChanged(state));
            }
            PlatformEvent::ScanResult(result) => self.on_scan_result(result),
            PlatformEvent::ScanFailed { code } => self.on_scan_failed(code),
            PlatformEvent::ConnectionChanged {
                device_id,
                connected,
                reason,
            } => {
                if connected {
                    self.on_connected(&device_id);
                } else {
                    self.on_disconnected(&device_id, reason);
                }
            }
            PlatformEvent::ServicesDiscovered {
                device_id,
                status,
                services,
            } => {
                if let Err(e) = status.into_result() {
                    self.fail_discovery(&device_id, e);
                    return;
                }
                let steps = self.registry.with_session_mut(&device_id, |session| {
                    session
                        .discovery_mut()
                        .map(|discovery| discovery.on_services(services))
                });
                self.advance_discovery(&device_id, steps.flatten());
            }
            PlatformEvent::CharacteristicsDiscovered {
                device_id,
                service,
                status,
                characteristics,
            } => {
                if let Err(e) = status.into_result() {
                    self.fail_discovery(&device_id, e);
                    return;
                }
                let steps = self.registry.with_session_mut(&device_id, |session| {
                    session
                        .discovery_mut()
                        .map(|discovery| discovery.on_characteristics(service, characteristics))
                });
                self.advance_discovery(&device_id, steps.flatten());
            }
            PlatformEvent::DescriptorsDiscovered {
                device_id,
                service,
                characteristic,
                status,
                descriptors,
            } => {
                if let Err(e) = status.into_result() {
                    self.fail_discovery(&device_id, e);
                    return;
                }
                let recorded = self.registry.with_session_mut(&device_id, |session| {
                    session.discovery_mut().map(|discovery| {
                        discovery.on_descriptors(service, characteristic, descriptors)
                    })
                });
                self.advance_discovery(&device_id, recorded.flatten().map(|()| Vec::new()));
            }
            PlatformEvent::CharacteristicRead {
                device_id,
                service,
                characteristic,
                status,
                value,
            } => {
                let key = characteristic_key(
                    OperationKind::ReadCharacteristic,
                    &device_id,
                    service,
                    characteristic,
                );
                self.complete(&key, status, Completion::Value(value));
            }
            PlatformEvent::CharacteristicWritten {
                device_id,
                service,
                characteristic,
                status,
            } => {
                let key = characteristic_key(
                    OperationKind::WriteCharacteristic,
                    &device_id,
                    service,
                    characteristic,
                );
                self.complete(&key, status, Completion::Done);
            }
            PlatformEvent::NotificationStateChanged {
                device_id,
                service,
                characteristic,
                status,
            } => {
                let key = characteristic_key(
                    OperationKind::SetNotification,
                    &device_id,
                    service,
                    characteristic,
                );
                self.complete(&key, status, Completion::Done);
            }
            PlatformEvent::DescriptorWritten {
                device_id,
                service,
                characteristic,
                descriptor,
                status,
            } => {
                if descriptor != CCCD_UUID {
                    debug!("Ignoring write confirmation for descriptor {}", descriptor);
                    return;
                }
                let key = characteristic_key(
                    OperationKind::SetNotification,
                    &device_id,
                    service,
                    characteristic,
                );
                self.complete(&key, status, Completion::Done);
            }
            PlatformEvent::ValueChanged {
                device_id,
                service,
                characteristic,
                value,
            } => self.on_value_changed(device_id, service, characteristic, value),
            PlatformEvent::MtuChanged {
                device_id,
                mtu,
                status,
            } => {
                if status.is_success() {
                    self.registry
                        .with_session_mut(&device_id, |session| session.set_mtu(mtu));
                }
                let key = OperationKey::device(OperationKind::RequestMtu, &device_id);
                self.complete(&key, status, Completion::Mtu(mtu));
            }
            PlatformEvent::RssiRead {
                device_id,
                rssi,
                status,
            } => {
                let key = OperationKey::device(OperationKind::ReadRssi, &device_id);
                self.complete(&key, status, Completion::Rssi(rssi));
            }
            PlatformEvent::BondStateChanged { device_id, state } => {
                self.on_bond_state(&device_id, state)
            }
        }
    }

    /// Resolve the oldest waiter for `key` with `status` translated
    fn complete(&self, key: &OperationKey, status: GattStatus, value: Completion) {
        let result = status.into_result().map(|()| value);
        if let Err(e) = &result {
            error!("{:?} on {} failed: {}", key.kind, key.device_id, e);
        }
        if !self.pending.resolve(key, result) {
            debug!("No caller waiting for {:?} on {}", key.kind, key.device_id);
        }
    }

    // ------------------------------------------------------------------------
    // Connection State
    // ------------------------------------------------------------------------

    fn on_connected(&self, device_id: &DeviceId) {
        let incidental = self.registry.with_session_mut(device_id, |session| {
            session.is_connecting().then(|| {
                session.mark_connected();
                session.is_incidental()
            })
        });

        match incidental.flatten() {
            Some(incidental) => {
                info!("Connected to {}", device_id);
                self.registry.clear_disconnect_echoes(device_id);
                if !incidental {
                    self.events.emit(CentralEvent::ConnectionChanged {
                        device_id: device_id.clone(),
                        connected: true,
                        error: None,
                    });
                }
                let key = OperationKey::device(OperationKind::Connect, device_id);
                self.pending.resolve(&key, Ok(Completion::Done));
            }
            None => warn!("Unexpected connect event for {}", device_id),
        }
    }

    fn on_disconnected(&self, device_id: &DeviceId, reason: Option<u8>) {
        // The session of a local disconnect is already gone; a newer one may exist
        if self.registry.take_disconnect_echo(device_id) {
            debug!("Disconnect of {} confirmed by the platform", device_id);
            return;
        }

        let session = self
            .registry
            .with_session(device_id, |session| (session.is_connecting(), session.is_incidental()));
        let Some((was_connecting, incidental)) = session else {
            debug!("Disconnect event for {} without a session", device_id);
            return;
        };

        let reason_name = reason.and_then(hci_reason_name).map(str::to_string);
        if was_connecting {
            let message = reason_name
                .clone()
                .unwrap_or_else(|| "Connection failed".to_string());
            warn!("Connection to {} failed: {}", device_id, message);
            let key = OperationKey::device(OperationKind::Connect, device_id);
            self.pending.resolve(
                &key,
                Err(BleError::Failed {
                    status: reason.map(i32::from).unwrap_or(-1),
                    message,
                }),
            );
        } else {
            info!(
                "{} disconnected{}",
                device_id,
                reason_name
                    .as_deref()
                    .map(|r| format!(": {r}"))
                    .unwrap_or_default()
            );
        }

        self.teardown(device_id, reason_name, !incidental);
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Issue follow-up discovery requests, then finish if nothing is missing
    ///
    /// `steps` is `None` when no discovery was in flight for the device.
    fn advance_discovery(&self, device_id: &DeviceId, steps: Option<Vec<DiscoveryStep>>) {
        let Some(steps) = steps else {
            debug!("Discovery callback for {} with nothing in flight", device_id);
            return;
        };

        for step in steps {
            let issued: Result<()> = match step {
                DiscoveryStep::Characteristics { service } => {
                    self.platform.discover_characteristics(device_id, service)
                }
                DiscoveryStep::Descriptors {
                    service,
                    characteristic,
                } => self
                    .platform
                    .discover_descriptors(device_id, service, characteristic),
            };
            if let Err(e) = issued {
                self.fail_discovery(device_id, e);
                return;
            }
        }

        let completed = self
            .registry
            .with_session_mut(device_id, |session| session.complete_discovery())
            .flatten();
        let Some(services) = completed else {
            return;
        };

        let uuids: Vec<Uuid> = services.iter().map(|s| s.uuid).collect();
        self.persist_services(device_id, &uuids);
        info!("Discovered {} services on {}", services.len(), device_id);

        let key = OperationKey::device(OperationKind::DiscoverServices, device_id);
        self.pending
            .resolve_all(&key, Ok(Completion::Services(services)));
    }

    /// Cache the service list now and write it to the store off the dispatcher
    fn persist_services(&self, device_id: &DeviceId, uuids: &[Uuid]) {
        let services = self.registry.remember_services(device_id, uuids);
        let store = self.registry.service_store();
        let device_id = device_id.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.store(device_id.as_str(), &services) {
                warn!("Failed to persist services for {}: {}", device_id, e);
            }
        });
    }

    // ------------------------------------------------------------------------
    // Notifications and Bonding
    // ------------------------------------------------------------------------

    fn on_value_changed(
        &self,
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) {
        let visible = self
            .registry
            .with_session(&device_id, |session| !session.is_incidental())
            .unwrap_or(false);
        if !visible {
            debug!("Value for {} without a session dropped", device_id);
            return;
        }

        self.events.emit(CentralEvent::ValueChanged {
            device_id,
            service,
            characteristic,
            value,
            timestamp: now_millis(),
        });
    }

    fn on_bond_state(&self, device_id: &DeviceId, state: BondState) {
        let key = OperationKey::device(OperationKind::Pair, device_id);
        let (result, is_paired, error) = match state {
            BondState::Bonding => {
                debug!("Bonding with {}", device_id);
                return;
            }
            BondState::Bonded => (Ok(Completion::Paired(true)), true, None),
            BondState::None => (Ok(Completion::Paired(false)), false, None),
            BondState::Failed => {
                let message = "Pairing failed".to_string();
                (
                    Err(BleError::PairingFailed(message.clone())),
                    false,
                    Some(message),
                )
            }
        };

        info!("Bond state of {}: {:?}", device_id, state);
        self.pending.resolve(&key, result);
        self.events.emit(CentralEvent::PairStateChanged {
            device_id: device_id.clone(),
            is_paired,
            error,
        });
    }
}
