//! Bounded per-instrument tick history with a typed listener registry.
//!
//! The store is a cheap-to-clone handle; clones share the same buffers. Listeners are invoked
//! synchronously on [`TickStore::add_tick`], outside the store lock, so a listener may read
//! the store. A panicking listener is logged and skipped without affecting the others.

use crate::types::{SymbolKey, Tick};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Weak},
};
use tracing::{debug, error};

/// Default number of ticks retained per instrument.
pub const DEFAULT_TICK_CAPACITY: usize = 10_000;

type Listener = Arc<dyn Fn(&Tick) + Send + Sync>;

#[derive(Clone)]
pub struct TickStore {
    inner: Arc<RwLock<StoreInner>>,
}

struct StoreInner {
    capacity: usize,
    entries: FnvHashMap<SymbolKey, StoreEntry>,
    next_listener_id: u64,
}

#[derive(Default)]
struct StoreEntry {
    ticks: VecDeque<Tick>,
    listeners: Vec<(u64, Listener)>,
}

impl Default for TickStore {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_CAPACITY)
    }
}

impl std::fmt::Debug for TickStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("TickStore")
            .field("capacity", &inner.capacity)
            .field("keys", &inner.entries.len())
            .finish()
    }
}

impl TickStore {
    /// Create a store retaining at most `capacity` ticks per key (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                capacity: capacity.max(1),
                entries: FnvHashMap::default(),
                next_listener_id: 0,
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity
    }

    /// Append a tick, evicting the oldest beyond capacity, then notify listeners for `key`.
    pub fn add_tick(&self, key: &SymbolKey, tick: Tick) {
        let listeners = {
            let mut inner = self.inner.write();
            let capacity = inner.capacity;
            let entry = inner.entries.entry(key.clone()).or_default();

            while entry.ticks.len() >= capacity {
                entry.ticks.pop_front();
            }
            entry.ticks.push_back(tick);

            entry
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect::<Vec<_>>()
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&tick))).is_err() {
                error!(%key, time = tick.time, "tick listener panicked, continuing with remaining listeners");
            }
        }
    }

    /// Every buffered tick with `from <= time <= to`, in insertion order.
    pub fn get_ticks_in_range(&self, key: &SymbolKey, from: i64, to: i64) -> Vec<Tick> {
        self.inner
            .read()
            .entries
            .get(key)
            .map(|entry| {
                entry
                    .ticks
                    .iter()
                    .filter(|tick| tick.time >= from && tick.time <= to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every buffered tick for `key`, in insertion order.
    pub fn ticks(&self, key: &SymbolKey) -> Vec<Tick> {
        self.inner
            .read()
            .entries
            .get(key)
            .map(|entry| entry.ticks.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, key: &SymbolKey) -> Option<Tick> {
        self.inner
            .read()
            .entries
            .get(key)
            .and_then(|entry| entry.ticks.back().copied())
    }

    pub fn len(&self, key: &SymbolKey) -> usize {
        self.inner
            .read()
            .entries
            .get(key)
            .map(|entry| entry.ticks.len())
            .unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<SymbolKey> {
        self.inner.read().entries.keys().cloned().collect()
    }

    /// Register a listener for ticks added under `key`.
    ///
    /// The listener stays registered until the returned handle is unsubscribed or dropped.
    #[must_use = "dropping the handle unsubscribes the listener"]
    pub fn add_listener<F>(&self, key: &SymbolKey, listener: F) -> ListenerHandle
    where
        F: Fn(&Tick) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        self.register(&mut inner, key, Arc::new(listener))
    }

    /// Swap the listener behind `previous` for `listener` under one lock, so each tick added
    /// under `key` reaches exactly one of them.
    #[must_use = "dropping the handle unsubscribes the listener"]
    pub fn replace_listener<F>(&self, mut previous: ListenerHandle, key: &SymbolKey, listener: F) -> ListenerHandle
    where
        F: Fn(&Tick) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        if std::mem::take(&mut previous.active) {
            if let Some(entry) = inner.entries.get_mut(&previous.key) {
                entry.listeners.retain(|(id, _)| *id != previous.id);
            }
        }
        self.register(&mut inner, key, Arc::new(listener))
    }

    fn register(&self, inner: &mut StoreInner, key: &SymbolKey, listener: Listener) -> ListenerHandle {
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner
            .entries
            .entry(key.clone())
            .or_default()
            .listeners
            .push((id, listener));

        debug!(%key, listener_id = id, "tick listener registered");

        ListenerHandle {
            store: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
            active: true,
        }
    }

    pub fn listener_count(&self, key: &SymbolKey) -> usize {
        self.inner
            .read()
            .entries
            .get(key)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    /// Drop every buffered tick for `key`; listeners stay registered.
    pub fn clear(&self, key: &SymbolKey) {
        if let Some(entry) = self.inner.write().entries.get_mut(key) {
            entry.ticks.clear();
            debug!(%key, "tick buffer cleared");
        }
    }

    /// Drop the buffer and every listener for `key`.
    pub fn remove(&self, key: &SymbolKey) {
        if self.inner.write().entries.remove(key).is_some() {
            debug!(%key, "tick store entry removed");
        }
    }
}

/// Disposable registration returned by [`TickStore::add_listener`].
#[derive(Debug)]
pub struct ListenerHandle {
    store: Weak<RwLock<StoreInner>>,
    key: SymbolKey,
    id: u64,
    active: bool,
}

impl ListenerHandle {
    pub fn key(&self) -> &SymbolKey {
        &self.key
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            if let Some(entry) = store.write().entries.get_mut(&self.key) {
                entry.listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
