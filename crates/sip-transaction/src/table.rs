// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;

use crate::{TransactionError, TransactionKey};

/// Implemented by values stored in a [`TransactionTable`].
pub trait TableEntry {
    /// A terminated entry may be replaced by a new transaction with the same key.
    fn is_terminated(&self) -> bool;
}

/// Concurrent map from [`TransactionKey`] to transaction state.
///
/// The shard guard returned by [`TransactionTable::get_mut`] is the
/// per-transaction lock. Callers must drop it before awaiting anything.
pub struct TransactionTable<E> {
    entries: DashMap<TransactionKey, E>,
    limit: usize,
}

impl<E: TableEntry> TransactionTable<E> {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: DashMap::new(),
            limit,
        }
    }

    /// Atomically inserts `entry` unless a live transaction owns `key`.
    ///
    /// A terminated entry under the same key is replaced. The capacity check
    /// happens before the shard is locked, so the limit is approximate under
    /// heavy contention.
    pub fn insert_new(&self, key: TransactionKey, entry: E) -> Result<(), TransactionError> {
        let at_capacity = self.entries.len() >= self.limit;
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_terminated() {
                    return Err(TransactionError::DuplicateTransaction(
                        occupied.key().clone(),
                    ));
                }
                occupied.insert(entry);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                if at_capacity {
                    return Err(TransactionError::ResourcesExhausted { limit: self.limit });
                }
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &TransactionKey) -> Option<Ref<'_, TransactionKey, E>> {
        self.entries.get(key)
    }

    pub fn get_mut(&self, key: &TransactionKey) -> Option<RefMut<'_, TransactionKey, E>> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&self, key: &TransactionKey) -> Option<E> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Snapshot of the keys currently stored.
    pub fn keys(&self) -> Vec<TransactionKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}
