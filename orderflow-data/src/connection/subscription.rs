//! Reference-counted subscription table for the shared connection.
//!
//! Many [`SubscriptionId`]s may hold the same [`SymbolKey`]; the server only ever sees one
//! subscribe per key (at the highest requested mode) and one unsubscribe when the last
//! holder lets go.

use crate::types::{SubscriptionMode, SymbolKey};
use derive_more::Display;
use fnv::FnvHashMap;
use itertools::Itertools;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("sub-{_0}")]
pub struct SubscriptionId(pub u64);

/// Server-side effect of a table update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    /// Send a subscribe frame at this mode
    Subscribe(SubscriptionMode),
    /// Send an unsubscribe frame
    Unsubscribe,
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionTable {
    keys: FnvHashMap<SymbolKey, FnvHashMap<SubscriptionId, SubscriptionMode>>,
}

impl SubscriptionTable {
    /// Register `id` as a holder of `key`. Re-acquiring replaces the holder's mode.
    pub fn acquire(&mut self, id: SubscriptionId, key: &SymbolKey, mode: SubscriptionMode) -> KeyChange {
        let previous = self.mode(key);
        self.keys.entry(key.clone()).or_default().insert(id, mode);
        let current = self.mode(key);

        match (previous, current) {
            (None, Some(mode)) => KeyChange::Subscribe(mode),
            (Some(previous), Some(mode)) if mode > previous => KeyChange::Subscribe(mode),
            _ => KeyChange::Unchanged,
        }
    }

    /// Drop `id` as a holder of `key`.
    pub fn release(&mut self, id: SubscriptionId, key: &SymbolKey) -> KeyChange {
        let Some(holders) = self.keys.get_mut(key) else {
            return KeyChange::Unchanged;
        };
        if holders.remove(&id).is_none() {
            return KeyChange::Unchanged;
        }
        if holders.is_empty() {
            self.keys.remove(key);
            return KeyChange::Unsubscribe;
        }
        KeyChange::Unchanged
    }

    /// Effective mode of `key`: the highest mode among its holders.
    pub fn mode(&self, key: &SymbolKey) -> Option<SubscriptionMode> {
        self.keys
            .get(key)
            .and_then(|holders| holders.values().copied().max())
    }

    pub fn ref_count(&self, key: &SymbolKey) -> usize {
        self.keys.get(key).map(|holders| holders.len()).unwrap_or(0)
    }

    pub fn holders(&self, key: &SymbolKey) -> Vec<SubscriptionId> {
        self.keys
            .get(key)
            .map(|holders| holders.keys().copied().sorted().collect())
            .unwrap_or_default()
    }

    /// Every held key with its effective mode, ordered by key.
    pub fn active(&self) -> Vec<(SymbolKey, SubscriptionMode)> {
        self.keys
            .keys()
            .sorted()
            .filter_map(|key| self.mode(key).map(|mode| (key.clone(), mode)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
