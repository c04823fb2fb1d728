// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction counters.
//!
//! [`TransactionManager`](crate::TransactionManager) records into a
//! [`TransactionMetrics`] as transactions start, fire timers and end:
//!
//! ```
//! use sip_transaction::metrics::{TransactionMetrics, TransactionOutcome, TransactionRole};
//! use sip_core::Method;
//! use std::time::Duration;
//!
//! let metrics = TransactionMetrics::new();
//! metrics.record_start(TransactionRole::Client, &Method::Invite);
//! metrics.record_outcome(TransactionOutcome::Completed);
//! metrics.record_duration(Duration::from_millis(250));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.starts_by_method.get("INVITE"), Some(&1));
//! assert_eq!(snapshot.total_finished, 1);
//! ```
//!
//! All operations take a short `parking_lot::RwLock` write; clones share
//! the same counters.

use parking_lot::RwLock;
use sip_core::Method;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::TransactionTimer;

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOutcome {
    /// Reached Terminated through the normal path
    Completed,
    /// Timer B, F or H fired
    Timeout,
    /// The transport refused a send
    TransportError,
}

/// Transaction role (client vs server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub starts_by_role: HashMap<TransactionRole, u64>,
    pub starts_by_method: HashMap<String, u64>,
    pub outcomes: HashMap<TransactionOutcome, u64>,
    pub timer_fires: HashMap<TransactionTimer, u64>,
    /// Retransmitted requests absorbed by server transactions
    pub retransmissions: u64,
    pub total_finished: u64,
    pub avg_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
}

#[derive(Debug, Default)]
struct MetricsData {
    starts_by_role: HashMap<TransactionRole, u64>,
    starts_by_method: HashMap<String, u64>,
    outcomes: HashMap<TransactionOutcome, u64>,
    timer_fires: HashMap<TransactionTimer, u64>,
    retransmissions: u64,
    finished: u64,
    total_duration: Duration,
    max_duration: Option<Duration>,
}

/// Thread-safe transaction metrics collector.
#[derive(Debug, Clone, Default)]
pub struct TransactionMetrics {
    data: Arc<RwLock<MetricsData>>,
}

impl TransactionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self, role: TransactionRole, method: &Method) {
        let mut data = self.data.write();
        *data.starts_by_role.entry(role).or_insert(0) += 1;
        *data
            .starts_by_method
            .entry(method.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn record_outcome(&self, outcome: TransactionOutcome) {
        *self.data.write().outcomes.entry(outcome).or_insert(0) += 1;
    }

    /// Records the lifetime of a finished transaction.
    pub fn record_duration(&self, duration: Duration) {
        let mut data = self.data.write();
        data.finished += 1;
        data.total_duration += duration;
        data.max_duration = Some(data.max_duration.map_or(duration, |max| max.max(duration)));
    }

    pub fn record_timer_fired(&self, timer: TransactionTimer) {
        *self.data.write().timer_fires.entry(timer).or_insert(0) += 1;
    }

    pub fn record_retransmission(&self) {
        self.data.write().retransmissions += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let data = self.data.read();
        let avg_duration = (data.finished > 0)
            .then(|| data.total_duration / u32::try_from(data.finished).unwrap_or(u32::MAX));
        MetricsSnapshot {
            starts_by_role: data.starts_by_role.clone(),
            starts_by_method: data.starts_by_method.clone(),
            outcomes: data.outcomes.clone(),
            timer_fires: data.timer_fires.clone(),
            retransmissions: data.retransmissions,
            total_finished: data.finished,
            avg_duration,
            max_duration: data.max_duration,
        }
    }

    pub fn reset(&self) {
        *self.data.write() = MetricsData::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_aggregate() {
        let metrics = TransactionMetrics::new();
        metrics.record_duration(Duration::from_millis(100));
        metrics.record_duration(Duration::from_millis(300));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_finished, 2);
        assert_eq!(snapshot.avg_duration, Some(Duration::from_millis(200)));
        assert_eq!(snapshot.max_duration, Some(Duration::from_millis(300)));
    }

    #[test]
    fn timer_fires_are_counted_per_timer() {
        let metrics = TransactionMetrics::new();
        metrics.record_timer_fired(TransactionTimer::A);
        metrics.record_timer_fired(TransactionTimer::A);
        metrics.record_timer_fired(TransactionTimer::B);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.timer_fires.get(&TransactionTimer::A), Some(&2));
        assert_eq!(snapshot.timer_fires.get(&TransactionTimer::B), Some(&1));
    }

    #[test]
    fn reset_clears_everything() {
        let metrics = TransactionMetrics::new();
        metrics.record_start(TransactionRole::Server, &Method::Options);
        metrics.record_outcome(TransactionOutcome::Timeout);
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert!(snapshot.starts_by_role.is_empty());
        assert!(snapshot.outcomes.is_empty());
        assert_eq!(snapshot.avg_duration, None);
    }
}
