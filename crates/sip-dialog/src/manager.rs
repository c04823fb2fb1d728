// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use dashmap::DashMap;
use sip_core::{Request, Response};
use sip_transaction::TransactionKey;
use tracing::debug;

use crate::{metrics::DialogMetrics, Dialog, DialogId, DialogState};

/// Table of active dialogs.
///
/// Mutation goes through [`DialogManager::update`], which runs under the
/// dialog's shard lock so concurrent tasks touching one dialog are
/// serialized. The closure must not block or await.
#[derive(Debug, Default)]
pub struct DialogManager {
    dialogs: DashMap<DialogId, Dialog>,
    by_transaction: DashMap<TransactionKey, Vec<DialogId>>,
    metrics: DialogMetrics,
}

impl DialogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &DialogMetrics {
        &self.metrics
    }

    /// Inserts a dialog, replacing any previous one with the same identifier.
    pub fn insert(&self, dialog: Dialog) {
        for key in &dialog.transactions {
            self.index(key.clone(), dialog.id.clone());
        }
        self.metrics.record_created();
        if dialog.state == DialogState::Confirmed {
            self.metrics.record_confirmed();
        }
        debug!(dialog = %dialog.id, state = ?dialog.state, "dialog stored");
        self.dialogs.insert(dialog.id.clone(), dialog);
    }

    /// Returns a snapshot of the dialog.
    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &DialogId) -> bool {
        self.dialogs.contains_key(id)
    }

    /// Mutates one dialog under its lock.
    ///
    /// Transactions the closure adds to `Dialog::transactions` are indexed
    /// afterwards, and state changes into `Confirmed`/`Terminated` are counted.
    pub fn update<R>(&self, id: &DialogId, f: impl FnOnce(&mut Dialog) -> R) -> Option<R> {
        let (result, before, after, added) = {
            let mut dialog = self.dialogs.get_mut(id)?;
            let before = dialog.state;
            let known = dialog.transactions.clone();
            let result = f(&mut dialog);
            let added: Vec<TransactionKey> =
                dialog.transactions.difference(&known).cloned().collect();
            (result, before, dialog.state, added)
        };

        for key in added {
            self.index(key, id.clone());
        }
        if before != after {
            match after {
                DialogState::Confirmed => self.metrics.record_confirmed(),
                DialogState::Terminated => self.metrics.record_terminated(),
                _ => {}
            }
        }
        Some(result)
    }

    /// Associates a transaction with a dialog.
    pub fn associate(&self, key: TransactionKey, id: &DialogId) {
        self.update(id, |dialog| dialog.track_transaction(key));
    }

    /// Finds the dialog a received in-dialog request belongs to.
    pub fn find_for_request(&self, request: &Request) -> Option<DialogId> {
        let id = DialogId::for_incoming_request(request)?;
        self.contains(&id).then_some(id)
    }

    /// Finds the dialog a response to one of our requests belongs to.
    pub fn find_for_response(&self, response: &Response) -> Option<DialogId> {
        let id = DialogId::for_uac_response(response)?;
        self.contains(&id).then_some(id)
    }

    /// Dialogs a transaction created or belongs to. A forked INVITE can
    /// own several early dialogs.
    pub fn dialogs_for_transaction(&self, key: &TransactionKey) -> Vec<DialogId> {
        self.by_transaction
            .get(key)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Drops the transaction from the index once it has terminated.
    pub fn forget_transaction(&self, key: &TransactionKey) {
        self.by_transaction.remove(key);
    }

    pub fn remove(&self, id: &DialogId) -> Option<Dialog> {
        let (_, dialog) = self.dialogs.remove(id)?;
        for key in &dialog.transactions {
            if let Some(mut ids) = self.by_transaction.get_mut(key) {
                ids.retain(|other| other != id);
            }
        }
        self.by_transaction.retain(|_, ids| !ids.is_empty());
        debug!(dialog = %id, "dialog removed");
        Some(dialog)
    }

    /// Removes all terminated dialogs, returning how many were dropped.
    pub fn cleanup_terminated(&self) -> usize {
        let terminated: Vec<DialogId> = self
            .dialogs
            .iter()
            .filter(|entry| entry.is_terminated())
            .map(|entry| entry.key().clone())
            .collect();
        terminated
            .iter()
            .filter(|id| self.remove(id).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    pub fn all_ids(&self) -> Vec<DialogId> {
        self.dialogs.iter().map(|entry| entry.key().clone()).collect()
    }

    fn index(&self, key: TransactionKey, id: DialogId) {
        let mut ids = self.by_transaction.entry(key).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
}
