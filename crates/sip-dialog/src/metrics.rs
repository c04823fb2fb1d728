// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

/// Dialog-level counters (creation, confirmation, termination, rejected requests).
#[derive(Debug, Clone, Default)]
pub struct DialogMetrics {
    inner: Arc<RwLock<MetricsData>>,
}

#[derive(Debug, Default)]
struct MetricsData {
    created: u64,
    confirmed: u64,
    terminated: u64,
    out_of_order: u64,
    last_updated: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct DialogMetricsSnapshot {
    pub created: u64,
    pub confirmed: u64,
    pub terminated: u64,
    pub out_of_order: u64,
    pub last_updated: Option<Instant>,
}

impl DialogMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_created(&self) {
        self.bump(|data| data.created += 1);
    }

    pub fn record_confirmed(&self) {
        self.bump(|data| data.confirmed += 1);
    }

    pub fn record_terminated(&self) {
        self.bump(|data| data.terminated += 1);
    }

    /// A request was rejected for a CSeq lower than the dialog's.
    pub fn record_out_of_order(&self) {
        self.bump(|data| data.out_of_order += 1);
    }

    fn bump(&self, f: impl FnOnce(&mut MetricsData)) {
        let mut data = self.inner.write();
        f(&mut data);
        data.last_updated = Some(Instant::now());
    }

    pub fn snapshot(&self) -> DialogMetricsSnapshot {
        let data = self.inner.read();
        DialogMetricsSnapshot {
            created: data.created,
            confirmed: data.confirmed,
            terminated: data.terminated,
            out_of_order: data.out_of_order,
            last_updated: data.last_updated,
        }
    }
}
