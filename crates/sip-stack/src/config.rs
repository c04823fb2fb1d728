// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stack configuration.
//!
//! Built in code through the `with_*` helpers or loaded from JSON:
//!
//! ```json
//! {
//!   "t1_ms": 500,
//!   "retransmission_filter": true,
//!   "max_server_transactions": 10000,
//!   "dialog_methods": ["SUBSCRIBE", "REFER"],
//!   "delivery": "serialized",
//!   "routes": ["udp:192.0.2.10:5060"]
//! }
//! ```
//!
//! Every field is optional.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use sip_core::Method;
use sip_transaction::{TimerDefaults, TransactionLimits, TransportKind};
use smol_str::SmolStr;

use crate::router::{Hop, RouterKind};

/// How queued events are handed to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// One event at a time; the next waits for the listener to return.
    #[default]
    Serialized,
    /// Each event is handed to its own task in queue order.
    Concurrent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackConfig {
    /// T1/T2/T4 plus the 2xx linger period and the automatic 100 delay.
    pub timers: TimerDefaults,
    /// When set the stack retransmits UAS 2xx responses and absorbs
    /// retransmitted 2xx on the UAC side.
    pub retransmission_filter: bool,
    pub limits: TransactionLimits,
    /// Methods besides INVITE whose responses create dialogs.
    pub dialog_methods: Vec<Method>,
    pub delivery: DeliveryMode,
    pub router: RouterKind,
    /// host[:port] written into Via headers the stack adds.
    pub sent_by: SmolStr,
    /// Transport named in Via headers the stack adds.
    pub via_transport: TransportKind,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            timers: TimerDefaults::default(),
            retransmission_filter: true,
            limits: TransactionLimits::default(),
            dialog_methods: Vec::new(),
            delivery: DeliveryMode::default(),
            router: RouterKind::default(),
            sent_by: SmolStr::new("127.0.0.1:5060"),
            via_transport: TransportKind::Udp,
        }
    }
}

impl StackConfig {
    pub fn with_timers(mut self, timers: TimerDefaults) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_limits(mut self, limits: TransactionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retransmission_filter(mut self, enabled: bool) -> Self {
        self.retransmission_filter = enabled;
        self
    }

    /// Adds an extension method whose responses create dialogs.
    pub fn with_dialog_method(mut self, method: Method) -> Self {
        if method != Method::Invite && !self.dialog_methods.contains(&method) {
            self.dialog_methods.push(method);
        }
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_router(mut self, router: RouterKind) -> Self {
        self.router = router;
        self
    }

    pub fn with_sent_by(mut self, sent_by: impl Into<SmolStr>, transport: TransportKind) -> Self {
        self.sent_by = sent_by.into();
        self.via_transport = transport;
        self
    }

    /// Parses a JSON configuration document.
    ///
    /// Missing fields keep their defaults. A linger or trying value that is
    /// not given explicitly follows the configured T1.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: FileStackConfig =
            serde_json::from_str(json).context("invalid stack configuration")?;
        file.into_config()
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&contents)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileStackConfig {
    t1_ms: Option<u64>,
    t2_ms: Option<u64>,
    t4_ms: Option<u64>,
    linger_ms: Option<u64>,
    trying_ms: Option<u64>,
    retransmission_filter: Option<bool>,
    max_server_transactions: Option<usize>,
    max_client_transactions: Option<usize>,
    dialog_methods: Vec<String>,
    delivery: Option<String>,
    routes: Vec<String>,
    sent_by: Option<String>,
    via_transport: Option<String>,
}

impl FileStackConfig {
    fn into_config(self) -> Result<StackConfig> {
        let defaults = StackConfig::default();
        let base = defaults.timers;

        let t1 = self.t1_ms.map(Duration::from_millis).unwrap_or(base.t1);
        if t1.is_zero() {
            return Err(anyhow!("t1_ms must be greater than zero"));
        }
        let mut timers = TimerDefaults::with_base(
            t1,
            self.t2_ms.map(Duration::from_millis).unwrap_or(base.t2),
            self.t4_ms.map(Duration::from_millis).unwrap_or(base.t4),
        );
        if let Some(linger) = self.linger_ms {
            timers.linger = Duration::from_millis(linger);
        }
        if let Some(trying) = self.trying_ms {
            timers.trying = Duration::from_millis(trying);
        }

        let limits = TransactionLimits::new(
            self.max_server_transactions
                .unwrap_or(defaults.limits.max_server_transactions),
            self.max_client_transactions
                .unwrap_or(defaults.limits.max_client_transactions),
        );

        let delivery = match self.delivery.as_deref() {
            None => DeliveryMode::Serialized,
            Some(mode) if mode.eq_ignore_ascii_case("serialized") => DeliveryMode::Serialized,
            Some(mode) if mode.eq_ignore_ascii_case("concurrent") => DeliveryMode::Concurrent,
            Some(other) => return Err(anyhow!("unknown delivery mode '{}'", other)),
        };

        let router = if self.routes.is_empty() {
            RouterKind::Default
        } else {
            let hops = self
                .routes
                .iter()
                .map(|route| route.parse::<Hop>())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            RouterKind::Static(hops)
        };

        let mut config = StackConfig {
            timers,
            retransmission_filter: self
                .retransmission_filter
                .unwrap_or(defaults.retransmission_filter),
            limits,
            delivery,
            router,
            ..defaults
        };
        for token in &self.dialog_methods {
            config = config.with_dialog_method(Method::from_token(token.trim()));
        }
        if let Some(sent_by) = self.sent_by {
            config.sent_by = SmolStr::new(sent_by);
        }
        if let Some(transport) = self.via_transport {
            config.via_transport = TransportKind::from_token(&transport);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = StackConfig::from_json("{}").unwrap();
        assert_eq!(config, StackConfig::default());
        assert!(config.retransmission_filter);
        assert_eq!(config.timers.t1, Duration::from_millis(500));
        assert_eq!(config.timers.linger, Duration::from_secs(1));
    }

    #[test]
    fn millisecond_fields_and_derived_linger() {
        let config = StackConfig::from_json(r#"{"t1_ms": 100, "t2_ms": 800, "trying_ms": 50}"#)
            .unwrap();
        assert_eq!(config.timers.t1, Duration::from_millis(100));
        assert_eq!(config.timers.t2, Duration::from_millis(800));
        assert_eq!(config.timers.linger, Duration::from_millis(200));
        assert_eq!(config.timers.trying, Duration::from_millis(50));

        let config = StackConfig::from_json(r#"{"t1_ms": 100, "linger_ms": 5000}"#).unwrap();
        assert_eq!(config.timers.linger, Duration::from_secs(5));
    }

    #[test]
    fn extension_methods_and_routes() {
        let config = StackConfig::from_json(
            r#"{
                "dialog_methods": ["SUBSCRIBE", "X-CUSTOM", "INVITE"],
                "delivery": "Concurrent",
                "routes": ["tcp:192.0.2.10:5060"],
                "max_server_transactions": 5
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.dialog_methods,
            vec![Method::Subscribe, Method::from_token("X-CUSTOM")]
        );
        assert_eq!(config.delivery, DeliveryMode::Concurrent);
        assert_eq!(config.limits.max_server_transactions, 5);
        assert_eq!(
            config.router,
            RouterKind::Static(vec![Hop::new(
                TransportKind::Tcp,
                "192.0.2.10:5060".parse().unwrap()
            )])
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(StackConfig::from_json(r#"{"delivery": "sometimes"}"#).is_err());
        assert!(StackConfig::from_json(r#"{"routes": ["example.com"]}"#).is_err());
        assert!(StackConfig::from_json(r#"{"t1_ms": 0}"#).is_err());
        assert!(StackConfig::from_json("not json").is_err());
    }

    #[test]
    fn builders() {
        let config = StackConfig::default()
            .with_retransmission_filter(false)
            .with_delivery(DeliveryMode::Concurrent)
            .with_limits(TransactionLimits::small())
            .with_dialog_method(Method::Refer)
            .with_dialog_method(Method::Refer)
            .with_sent_by("10.0.0.5:5070", TransportKind::Tcp);
        assert!(!config.retransmission_filter);
        assert_eq!(config.dialog_methods, vec![Method::Refer]);
        assert_eq!(config.limits, TransactionLimits::small());
        assert_eq!(config.via_transport, TransportKind::Tcp);
    }
}
