//! Handle registry shared between callers and background tasks.
//!
//! This module provides `Registry<K, R>`, a mutex-guarded map from handle to
//! lifecycle record. It is the single arbitration point for cancel-vs-complete
//! races: whoever removes a handle first owns its cleanup, and every
//! "is this handle still present" check happens under the same lock as the
//! mutation that depends on it. [`DeliveryGate`] extends that arbitration
//! past the lock to the callback that follows a successful check.

use crate::error::LockResultExt;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

/// A thread-safe handle → record map with atomic check-and-remove.
///
/// Handles are allocated from a per-registry counter starting at 1, so two
/// registries never need to coordinate.
///
/// # Example
///
/// ```ignore
/// let registry: Registry<ConnectionId, &str> = Registry::new();
/// let id = registry.insert("pending");
///
/// // First remover wins
/// assert_eq!(registry.remove(id), Some("pending"));
/// assert_eq!(registry.remove(id), None);
/// ```
pub(crate) struct Registry<K, R> {
    records: Mutex<HashMap<K, R>>,
    next_id: AtomicU64,
}

impl<K, R> Registry<K, R>
where
    K: Copy + Eq + Hash + From<u64>,
{
    /// Create a new empty `Registry`.
    pub(crate) fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh handle and insert `record` under it.
    pub(crate) fn insert(&self, record: R) -> K {
        let id = K::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records
            .lock()
            .recover_poison("Registry::insert")
            .insert(id, record);
        id
    }

    /// Remove `id`, returning its record if this call was the one to remove it.
    pub(crate) fn remove(&self, id: K) -> Option<R> {
        self.records
            .lock()
            .recover_poison("Registry::remove")
            .remove(&id)
    }

    /// Run `f` against the record for `id` while holding the registry lock.
    ///
    /// Returns `None` without calling `f` when the handle is absent. `f` must
    /// not call back into the registry or into user code.
    pub(crate) fn with_record<T>(&self, id: K, f: impl FnOnce(&mut R) -> T) -> Option<T> {
        self.records
            .lock()
            .recover_poison("Registry::with_record")
            .get_mut(&id)
            .map(f)
    }

    /// Check whether `id` is still registered.
    pub(crate) fn contains(&self, id: K) -> bool {
        self.records
            .lock()
            .recover_poison("Registry::contains")
            .contains_key(&id)
    }

    /// Snapshot of all currently registered handles.
    pub(crate) fn ids(&self) -> Vec<K> {
        self.records
            .lock()
            .recover_poison("Registry::ids")
            .keys()
            .copied()
            .collect()
    }

    /// Number of registered handles.
    pub(crate) fn len(&self) -> usize {
        self.records.lock().recover_poison("Registry::len").len()
    }
}

impl<K, R> Default for Registry<K, R>
where
    K: Copy + Eq + Hash + From<u64>,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Orders a background delivery against removal of its handle.
///
/// A background task holds the gate from its membership check until its
/// callback returns. The remover calls [`DeliveryGate::wait_idle`] after
/// removing the record, so once removal returns no callback for that handle
/// can still be running. A removal made from inside the delivery itself (on
/// the delivering thread) does not wait; the delivery re-checks membership
/// instead.
#[derive(Debug, Default)]
pub(crate) struct DeliveryGate {
    /// Thread currently delivering, if any
    owner: Mutex<Option<ThreadId>>,
    idle: Condvar,
}

/// Held for the duration of one delivery.
pub(crate) struct DeliveryGuard<'a> {
    gate: &'a DeliveryGate,
}

impl DeliveryGate {
    /// Block until no other delivery is running, then claim the gate.
    pub(crate) fn enter(&self) -> DeliveryGuard<'_> {
        let mut owner = self.owner.lock().recover_poison("DeliveryGate::enter");
        while owner.is_some() {
            owner = self.idle.wait(owner).recover_poison("DeliveryGate::enter");
        }
        *owner = Some(thread::current().id());
        DeliveryGuard { gate: self }
    }

    /// Wait for a delivery running on another thread to finish.
    pub(crate) fn wait_idle(&self) {
        let current = thread::current().id();
        let mut owner = self.owner.lock().recover_poison("DeliveryGate::wait_idle");
        while let Some(delivering) = *owner {
            if delivering == current {
                return;
            }
            owner = self.idle.wait(owner).recover_poison("DeliveryGate::wait_idle");
        }
    }
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        *self
            .gate
            .owner
            .lock()
            .recover_poison("DeliveryGuard::drop") = None;
        self.gate.idle.notify_all();
    }
}
