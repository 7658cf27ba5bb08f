//! BLE central coordinator
//!
//! [`BleCentral`] is the inbound operation surface. Each operation validates
//! against the session held in the [`DeviceRegistry`], registers its waiter in
//! the [`PendingOperationRegistry`] and only then submits work to the
//! platform. Completions are delivered by the dispatcher task, which consumes
//! [`PlatformEvent`]s in arrival order.
//!
//! [`PlatformEvent`]: crate::platform::PlatformEvent

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use unible_core::{
    AvailabilityState, BleError, BleService, ConnectionState, DeviceId,
    DeviceRegistry, GattSession, JsonFileServiceCache, MemoryServiceCache, NotificationMode,
    OperationKey, OperationKind, PendingOperation, PendingOperationRegistry, Result, ServiceCache,
    WriteType, CCCD_UUID,
};

use crate::config::CentralConfig;
use crate::events::{CentralEvent, CentralEventReceiver, EventSink};
use crate::platform::{PlatformAdapter, PlatformEventReceiver};
use crate::scanning::ScanState;

/// ATT header carried by every write, added to the write length to derive an MTU
const ATT_HEADER_LEN: usize = 3;

// ----------------------------------------------------------------------------
// Operation Results
// ----------------------------------------------------------------------------

/// Value delivered to a waiting caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Completion {
    Done,
    Services(Vec<BleService>),
    Value(Vec<u8>),
    Mtu(u16),
    Rssi(i16),
    Paired(bool),
}

impl Completion {
    fn into_services(self) -> Result<Vec<BleService>> {
        match self {
            Completion::Services(services) => Ok(services),
            other => Err(unexpected(other)),
        }
    }

    fn into_value(self) -> Result<Vec<u8>> {
        match self {
            Completion::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    fn into_mtu(self) -> Result<u16> {
        match self {
            Completion::Mtu(mtu) => Ok(mtu),
            other => Err(unexpected(other)),
        }
    }

    fn into_rssi(self) -> Result<i16> {
        match self {
            Completion::Rssi(rssi) => Ok(rssi),
            other => Err(unexpected(other)),
        }
    }

    fn into_paired(self) -> Result<bool> {
        match self {
            Completion::Paired(paired) => Ok(paired),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(completion: Completion) -> BleError {
    BleError::Unknown(format!("unexpected completion {completion:?}"))
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

pub(crate) struct Inner<P: PlatformAdapter> {
    pub(crate) platform: Arc<P>,
    pub(crate) config: CentralConfig,
    pub(crate) registry: DeviceRegistry,
    pub(crate) pending: PendingOperationRegistry<Completion>,
    pub(crate) scan: Mutex<ScanState>,
    pub(crate) events: EventSink,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<P: PlatformAdapter> Drop for Inner<P> {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        self.scan.lock().cancel_retry();
    }
}

// ----------------------------------------------------------------------------
// BLE Central
// ----------------------------------------------------------------------------

/// Cross-platform BLE central
///
/// Cloning is cheap; clones share one set of sessions.
pub struct BleCentral<P: PlatformAdapter> {
    inner: Arc<Inner<P>>,
}

impl<P: PlatformAdapter> Clone for BleCentral<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: PlatformAdapter> BleCentral<P> {
    /// Create the central and start consuming `platform_events`
    ///
    /// The service cache is a JSON file under `config.cache_dir` when set,
    /// in memory otherwise. Must be called inside a tokio runtime.
    pub fn new(
        platform: Arc<P>,
        platform_events: PlatformEventReceiver,
        config: CentralConfig,
    ) -> (Self, CentralEventReceiver) {
        let cache: Arc<dyn ServiceCache> = match &config.cache_dir {
            Some(dir) => Arc::new(JsonFileServiceCache::open(dir, &config.cache_namespace)),
            None => Arc::new(MemoryServiceCache::new()),
        };
        Self::with_service_cache(platform, platform_events, config, cache)
    }

    /// Create the central with an explicit service cache
    pub fn with_service_cache(
        platform: Arc<P>,
        platform_events: PlatformEventReceiver,
        config: CentralConfig,
        cache: Arc<dyn ServiceCache>,
    ) -> (Self, CentralEventReceiver) {
        let (events, receiver) = EventSink::channel();
        let inner = Arc::new(Inner {
            platform,
            scan: Mutex::new(ScanState::new(config.scan_governor.clone())),
            registry: DeviceRegistry::new(cache),
            pending: PendingOperationRegistry::new(),
            config,
            events,
            dispatcher: Mutex::new(None),
        });

        let handle = crate::dispatch::spawn_dispatcher(&inner, platform_events);
        *inner.dispatcher.lock() = Some(handle);
        info!("BLE central started");

        (Self { inner }, receiver)
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.inner.platform
    }

    pub fn config(&self) -> &CentralConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    /// Operations still waiting on the platform for `device_id`
    pub fn pending_operations(&self, device_id: &DeviceId) -> usize {
        self.inner.pending.pending_for_device(device_id)
    }

    // ------------------------------------------------------------------------
    // Adapter
    // ------------------------------------------------------------------------

    pub fn availability_state(&self) -> AvailabilityState {
        self.inner.platform.availability()
    }

    pub fn enable_bluetooth(&self) -> Result<bool> {
        self.inner.set_adapter_enabled(true)
    }

    pub fn disable_bluetooth(&self) -> Result<bool> {
        self.inner.set_adapter_enabled(false)
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Connect and wait for the link to come up
    ///
    /// Already connected devices report `ConnectionChanged` again and return
    /// immediately; a second call while connecting fails with
    /// `ConnectionInProgress`.
    pub async fn connect(&self, device_id: &DeviceId) -> Result<()> {
        self.inner.connect(device_id, false).await
    }

    /// Tear down the session; unknown devices just report disconnection
    pub fn disconnect(&self, device_id: &DeviceId) -> Result<()> {
        self.inner.disconnect(device_id)
    }

    pub fn connection_state(&self, device_id: &DeviceId) -> ConnectionState {
        self.inner.registry.connection_state(device_id)
    }

    // ------------------------------------------------------------------------
    // GATT Operations
    // ------------------------------------------------------------------------

    /// Discover the GATT tree, joining a discovery already in flight
    pub async fn discover_services(
        &self,
        device_id: &DeviceId,
        with_descriptors: bool,
    ) -> Result<Vec<BleService>> {
        self.inner.discover_services(device_id, with_descriptors).await
    }

    pub async fn read_value(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        self.inner.read_value(device_id, service, characteristic).await
    }

    /// Write a value; without-response writes complete on submission
    pub async fn write_value(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.inner
            .write_value(device_id, service, characteristic, value, write_type)
            .await
    }

    pub async fn set_notifiable(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        mode: NotificationMode,
    ) -> Result<()> {
        self.inner
            .set_notifiable(device_id, service, characteristic, mode)
            .await
    }

    /// Negotiate the ATT MTU, or derive it where the platform does not negotiate
    pub async fn request_mtu(&self, device_id: &DeviceId, desired: u16) -> Result<u16> {
        self.inner.request_mtu(device_id, desired).await
    }

    pub async fn read_rssi(&self, device_id: &DeviceId) -> Result<i16> {
        self.inner.read_rssi(device_id).await
    }

    // ------------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------------

    pub fn is_paired(&self, device_id: &DeviceId) -> Result<bool> {
        self.inner.require_pairing()?;
        self.inner.platform.is_paired(device_id)
    }

    /// Bond with the device; `false` when the OS declined without an error
    pub async fn pair(&self, device_id: &DeviceId) -> Result<bool> {
        self.inner.pair(device_id).await
    }

    pub fn unpair(&self, device_id: &DeviceId) -> Result<()> {
        self.inner.require_pairing()?;
        if !self.inner.platform.is_paired(device_id)? {
            debug!("Unpair of {} ignored: not paired", device_id);
            return Ok(());
        }
        self.inner.platform.unpair(device_id)
    }

    pub(crate) fn inner(&self) -> &Arc<Inner<P>> {
        &self.inner
    }
}

// ----------------------------------------------------------------------------
// Operation Implementations
// ----------------------------------------------------------------------------

impl<P: PlatformAdapter> Inner<P> {
    pub(crate) fn require_powered_on(&self) -> Result<()> {
        match self.platform.availability() {
            AvailabilityState::PoweredOn => Ok(()),
            _ => Err(BleError::BluetoothNotEnabled),
        }
    }

    fn require_pairing(&self) -> Result<()> {
        if self.platform.capabilities().pairing {
            Ok(())
        } else {
            Err(BleError::not_supported("pairing"))
        }
    }

    fn set_adapter_enabled(&self, enabled: bool) -> Result<bool> {
        if !self.platform.capabilities().adapter_toggle {
            return Err(BleError::not_supported("adapter toggle"));
        }
        self.platform.set_adapter_enabled(enabled)
    }

    /// Submit platform work for an already registered waiter and await it
    ///
    /// A submission error withdraws the waiter so nothing is left behind.
    async fn submit(
        &self,
        key: OperationKey,
        pending: PendingOperation<Completion>,
        issue: impl FnOnce() -> Result<()>,
    ) -> Result<Completion> {
        if let Err(e) = issue() {
            self.pending.withdraw(&key, pending.id());
            return Err(e);
        }
        pending.await
    }

    /// Register a waiter under `key` while holding the device's session
    ///
    /// `check` runs against the session first; registering under the session
    /// lock guarantees that a concurrent teardown cancels the waiter.
    fn register_on_session<R>(
        &self,
        device_id: &DeviceId,
        key: &OperationKey,
        check: impl FnOnce(&GattSession) -> Result<R>,
    ) -> Result<(R, PendingOperation<Completion>)> {
        self.registry.session_mut(device_id, |session| {
            session.require_connected()?;
            let checked = check(&*session)?;
            Ok((checked, self.pending.register(key.clone())))
        })
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    pub(crate) async fn connect(&self, device_id: &DeviceId, incidental: bool) -> Result<()> {
        let key = OperationKey::device(OperationKind::Connect, device_id);
        let registered = self
            .registry
            .begin_connect_with(device_id, incidental, || self.pending.register(key.clone()))?;
        let Some(pending) = registered else {
            debug!("{} already connected", device_id);
            if !incidental {
                self.events.emit(CentralEvent::ConnectionChanged {
                    device_id: device_id.clone(),
                    connected: true,
                    error: None,
                });
            }
            return Ok(());
        };

        info!("Connecting to {}", device_id);
        if let Err(e) = self.platform.connect(device_id) {
            warn!("Connect to {} not issued: {}", device_id, e);
            self.pending.withdraw(&key, pending.id());
            self.registry.remove(device_id);
            return Err(e);
        }
        pending.await.map(|_| ())
    }

    pub(crate) fn disconnect(&self, device_id: &DeviceId) -> Result<()> {
        let incidental = self.registry.with_session_mut(device_id, |session| {
            session.mark_disconnecting();
            session.is_incidental()
        });
        let Some(incidental) = incidental else {
            debug!("Disconnect of unknown device {}", device_id);
            self.events.emit(CentralEvent::ConnectionChanged {
                device_id: device_id.clone(),
                connected: false,
                error: None,
            });
            return Ok(());
        };

        info!("Disconnecting from {}", device_id);
        self.disconnect_link(device_id);
        self.teardown(device_id, None, !incidental);
        Ok(())
    }

    /// Ask the platform to drop the link, expecting its disconnect event later
    pub(crate) fn disconnect_link(&self, device_id: &DeviceId) {
        self.registry.expect_disconnect_echo(device_id);
        if let Err(e) = self.platform.disconnect(device_id) {
            warn!("Platform disconnect of {} failed: {}", device_id, e);
            self.registry.take_disconnect_echo(device_id);
        }
    }

    /// Remove the session and fail everything still pending for it
    pub(crate) fn teardown(&self, device_id: &DeviceId, error: Option<String>, notify: bool) {
        if self.registry.remove(device_id).is_none() {
            return;
        }
        self.pending
            .cancel_all_for_device(device_id, BleError::DeviceDisconnected);
        if notify {
            self.events.emit(CentralEvent::ConnectionChanged {
                device_id: device_id.clone(),
                connected: false,
                error,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    pub(crate) async fn discover_services(
        &self,
        device_id: &DeviceId,
        with_descriptors: bool,
    ) -> Result<Vec<BleService>> {
        let key = OperationKey::device(OperationKind::DiscoverServices, device_id);
        let (started, pending) = self.registry.session_mut(device_id, |session| {
            session.require_connected()?;
            let started = session.begin_discovery(with_descriptors);
            Ok((started, self.pending.register(key.clone())))
        })?;

        if started {
            debug!("Discovering services of {}", device_id);
            if let Err(e) = self.platform.discover_services(device_id) {
                self.fail_discovery(device_id, e);
            }
        } else {
            debug!("Joining discovery already in flight for {}", device_id);
        }

        pending.await?.into_services()
    }

    /// Abort the in-flight discovery and fail everyone waiting on it
    pub(crate) fn fail_discovery(&self, device_id: &DeviceId, error: BleError) {
        warn!("Service discovery of {} failed: {}", device_id, error);
        self.registry
            .with_session_mut(device_id, |session| session.abort_discovery());
        let key = OperationKey::device(OperationKind::DiscoverServices, device_id);
        self.pending.resolve_all(&key, Err(error));
    }

    // ------------------------------------------------------------------------
    // Characteristic Operations
    // ------------------------------------------------------------------------

    async fn read_value(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        let key = OperationKey::characteristic(
            OperationKind::ReadCharacteristic,
            device_id,
            service,
            characteristic,
        );
        let ((), pending) = self.register_on_session(device_id, &key, |session| {
            session.validate_read(&service, &characteristic)
        })?;

        self.submit(key, pending, || {
            self.platform
                .read_characteristic(device_id, service, characteristic)
        })
        .await?
        .into_value()
    }

    async fn write_value(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        if write_type == WriteType::WithoutResponse {
            self.registry.session_mut(device_id, |session| {
                session.require_connected()?;
                session.validate_write(&service, &characteristic, write_type)
            })?;
            return self.platform.write_characteristic(
                device_id,
                service,
                characteristic,
                value,
                write_type,
            );
        }

        let key = OperationKey::characteristic(
            OperationKind::WriteCharacteristic,
            device_id,
            service,
            characteristic,
        );
        let ((), pending) = self.register_on_session(device_id, &key, |session| {
            session.validate_write(&service, &characteristic, write_type)
        })?;

        self.submit(key, pending, || {
            self.platform
                .write_characteristic(device_id, service, characteristic, value, write_type)
        })
        .await
        .map(|_| ())
    }

    async fn set_notifiable(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        mode: NotificationMode,
    ) -> Result<()> {
        let key = OperationKey::characteristic(
            OperationKind::SetNotification,
            device_id,
            service,
            characteristic,
        );
        // The CCCD is absent only when descriptors are known and lack it
        let (has_cccd, pending) = self.register_on_session(device_id, &key, |session| {
            let found = session.validate_notify(&service, &characteristic, mode)?;
            Ok(found.descriptors.is_empty() || found.has_descriptor(&CCCD_UUID))
        })?;
        let enabled = mode.is_enabled();

        if self.platform.capabilities().subscription_descriptor_write {
            if let Err(e) = self
                .platform
                .set_notify(device_id, service, characteristic, enabled)
            {
                self.pending.withdraw(&key, pending.id());
                return Err(e);
            }
            if has_cccd {
                self.submit(key, pending, || {
                    self.platform.write_descriptor(
                        device_id,
                        service,
                        characteristic,
                        CCCD_UUID,
                        &mode.cccd_value(),
                    )
                })
                .await?;
            } else {
                debug!("{} has no CCCD; local routing only", characteristic);
                self.pending.withdraw(&key, pending.id());
            }
        } else {
            self.submit(key, pending, || {
                self.platform
                    .set_notify(device_id, service, characteristic, enabled)
            })
            .await?;
        }

        self.registry.with_session_mut(device_id, |session| {
            session.set_subscription(service, characteristic, mode)
        });
        debug!("{} on {} set to {:?}", characteristic, device_id, mode);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Link Parameters
    // ------------------------------------------------------------------------

    async fn request_mtu(&self, device_id: &DeviceId, desired: u16) -> Result<u16> {
        if !self.platform.capabilities().mtu_negotiation {
            self.registry
                .session_mut(device_id, |session| session.require_connected())?;
            let length = self
                .platform
                .maximum_write_length(device_id, WriteType::WithoutResponse)?;
            let mtu = u16::try_from(length + ATT_HEADER_LEN).unwrap_or(u16::MAX);
            self.registry
                .with_session_mut(device_id, |session| session.set_mtu(mtu));
            return Ok(mtu);
        }

        let key = OperationKey::device(OperationKind::RequestMtu, device_id);
        let ((), pending) = self.register_on_session(device_id, &key, |_| Ok(()))?;
        self.submit(key, pending, || self.platform.request_mtu(device_id, desired))
            .await?
            .into_mtu()
    }

    async fn read_rssi(&self, device_id: &DeviceId) -> Result<i16> {
        if !self.platform.capabilities().rssi {
            return Err(BleError::not_supported("RSSI reads"));
        }
        let key = OperationKey::device(OperationKind::ReadRssi, device_id);
        let ((), pending) = self.register_on_session(device_id, &key, |_| Ok(()))?;
        self.submit(key, pending, || self.platform.read_rssi(device_id))
            .await?
            .into_rssi()
    }

    async fn pair(&self, device_id: &DeviceId) -> Result<bool> {
        self.require_pairing()?;
        if self.platform.is_paired(device_id)? {
            return Ok(true);
        }

        let key = OperationKey::device(OperationKind::Pair, device_id);
        let pending = self.pending.register(key.clone());
        info!("Pairing with {}", device_id);
        self.submit(key, pending, || self.platform.pair(device_id))
            .await?
            .into_paired()
    }
}
