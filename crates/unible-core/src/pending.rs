//! Correlation of asynchronous platform callbacks with waiting callers
//!
//! Each caller registers a single-use continuation under an [`OperationKey`]
//! and awaits the returned [`PendingOperation`]. Platform callbacks resolve
//! the oldest entry for their key. Every registered continuation receives
//! exactly one result: success, translated platform failure, or the error
//! delivered by [`PendingOperationRegistry::cancel_all_for_device`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::{BleError, Result};
use crate::types::DeviceId;

// ----------------------------------------------------------------------------
// Operation Keys
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic,
    SetNotification,
    RequestMtu,
    ReadRssi,
    Pair,
}

/// Correlation key: device, optional service and characteristic, operation kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub device_id: DeviceId,
    pub service: Option<Uuid>,
    pub characteristic: Option<Uuid>,
    pub kind: OperationKind,
}

impl OperationKey {
    /// Key for a device-wide operation
    pub fn device(kind: OperationKind, device_id: &DeviceId) -> Self {
        Self {
            device_id: device_id.clone(),
            service: None,
            characteristic: None,
            kind,
        }
    }

    /// Key for an operation on one characteristic
    pub fn characteristic(
        kind: OperationKind,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Self {
        Self {
            device_id: device_id.clone(),
            service: Some(service),
            characteristic: Some(characteristic),
            kind,
        }
    }
}

/// Identity of one registration, used to withdraw it if submission fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

// ----------------------------------------------------------------------------
// Pending Operation Future
// ----------------------------------------------------------------------------

/// Caller side of a registered operation
#[derive(Debug)]
pub struct PendingOperation<T> {
    id: OperationId,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> PendingOperation<T> {
    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl<T> Future for PendingOperation<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(BleError::Unknown("operation registry dropped".to_string()))
            })
        })
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

type Waiter<T> = (OperationId, oneshot::Sender<Result<T>>);

/// Correlation table of outstanding operations
pub struct PendingOperationRegistry<T> {
    entries: Mutex<HashMap<OperationKey, VecDeque<Waiter<T>>>>,
    next_id: AtomicU64,
}

impl<T> Default for PendingOperationRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingOperationRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a continuation under `key`
    pub fn register(&self, key: OperationKey) -> PendingOperation<T> {
        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();

        trace!("Registering {:?} for {}", key.kind, key.device_id);
        self.entries
            .lock()
            .entry(key)
            .or_default()
            .push_back((id, sender));

        PendingOperation { id, receiver }
    }

    /// Complete the oldest continuation for `key`
    ///
    /// Returns `false` when nothing was waiting; duplicate or stale platform
    /// callbacks land here and are ignored.
    pub fn resolve(&self, key: &OperationKey, result: Result<T>) -> bool {
        let waiter = {
            let mut entries = self.entries.lock();
            let Some(queue) = entries.get_mut(key) else {
                return false;
            };
            let waiter = queue.pop_front();
            if queue.is_empty() {
                entries.remove(key);
            }
            waiter
        };

        match waiter {
            Some((_, sender)) => {
                if sender.send(result).is_err() {
                    debug!("Caller for {:?} on {} went away", key.kind, key.device_id);
                }
                true
            }
            None => false,
        }
    }

    /// Remove one specific registration without completing it
    pub fn withdraw(&self, key: &OperationKey, id: OperationId) -> bool {
        let mut entries = self.entries.lock();
        let Some(queue) = entries.get_mut(key) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|(waiter_id, _)| *waiter_id != id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            entries.remove(key);
        }
        removed
    }

    /// Fail every continuation registered for `device_id`
    pub fn cancel_all_for_device(&self, device_id: &DeviceId, error: BleError) -> usize {
        let drained: Vec<Waiter<T>> = {
            let mut entries = self.entries.lock();
            let keys: Vec<OperationKey> = entries
                .keys()
                .filter(|key| &key.device_id == device_id)
                .cloned()
                .collect();
            keys.iter()
                .filter_map(|key| entries.remove(key))
                .flatten()
                .collect()
        };

        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(error.clone()));
        }
        if count > 0 {
            debug!("Cancelled {} pending operations for {}", count, device_id);
        }
        count
    }

    pub fn has_pending(&self, key: &OperationKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn pending_for_device(&self, device_id: &DeviceId) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(key, _)| &key.device_id == device_id)
            .map(|(_, queue)| queue.len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T: Clone> PendingOperationRegistry<T> {
    /// Complete every continuation for `key` with the same result
    pub fn resolve_all(&self, key: &OperationKey, result: Result<T>) -> usize {
        let waiters = self.entries.lock().remove(key).unwrap_or_default();
        let count = waiters.len();
        for (_, sender) in waiters {
            let _ = sender.send(result.clone());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::uuid_from_u16;
    use tokio_test::{assert_err, assert_ok};

    fn read_key(device: &DeviceId) -> OperationKey {
        OperationKey::characteristic(
            OperationKind::ReadCharacteristic,
            device,
            uuid_from_u16(0x180D),
            uuid_from_u16(0x2A37),
        )
    }

    #[tokio::test]
    async fn test_duplicate_callbacks_resolve_once() {
        let registry = PendingOperationRegistry::<Vec<u8>>::new();
        let device = DeviceId::from("D");
        let key = read_key(&device);

        let pending = registry.register(key.clone());
        assert!(registry.resolve(&key, Ok(vec![1])));
        assert!(!registry.resolve(&key, Ok(vec![2])));

        assert_eq!(pending.await.unwrap(), vec![1]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_resolution_is_fifo_per_key() {
        let registry = PendingOperationRegistry::<u8>::new();
        let device = DeviceId::from("D");
        let key = read_key(&device);

        let first = registry.register(key.clone());
        let second = registry.register(key.clone());
        registry.resolve(&key, Ok(1));
        registry.resolve(&key, Ok(2));

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_all_only_touches_one_device() {
        let registry = PendingOperationRegistry::<()>::new();
        let d = DeviceId::from("D");
        let other = DeviceId::from("E");

        let read = registry.register(read_key(&d));
        let discover = registry.register(OperationKey::device(OperationKind::DiscoverServices, &d));
        let survivor = registry.register(read_key(&other));

        assert_eq!(registry.cancel_all_for_device(&d, BleError::DeviceDisconnected), 2);
        assert_eq!(registry.pending_for_device(&d), 0);
        assert_eq!(registry.pending_for_device(&other), 1);

        assert_eq!(assert_err!(read.await), BleError::DeviceDisconnected);
        assert_eq!(assert_err!(discover.await), BleError::DeviceDisconnected);

        registry.resolve(&read_key(&other), Ok(()));
        assert_ok!(survivor.await);
    }

    #[tokio::test]
    async fn test_withdraw_removes_only_that_registration() {
        let registry = PendingOperationRegistry::<u8>::new();
        let device = DeviceId::from("D");
        let key = read_key(&device);

        let first = registry.register(key.clone());
        let second = registry.register(key.clone());
        assert!(registry.withdraw(&key, second.id()));
        assert!(!registry.withdraw(&key, second.id()));

        registry.resolve(&key, Ok(7));
        assert_eq!(first.await.unwrap(), 7);
        assert!(!registry.has_pending(&key));
    }

    #[tokio::test]
    async fn test_resolve_all_fans_out() {
        let registry = PendingOperationRegistry::<u8>::new();
        let device = DeviceId::from("D");
        let key = OperationKey::device(OperationKind::DiscoverServices, &device);

        let waiters: Vec<_> = (0..3).map(|_| registry.register(key.clone())).collect();
        assert_eq!(registry.resolve_all(&key, Ok(9)), 3);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 9);
        }
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_poison_registry() {
        let registry = PendingOperationRegistry::<u8>::new();
        let device = DeviceId::from("D");
        let key = read_key(&device);

        drop(registry.register(key.clone()));
        assert!(registry.resolve(&key, Ok(1)));
        assert!(registry.is_empty());
    }
}
