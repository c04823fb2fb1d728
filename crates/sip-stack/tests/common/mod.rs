// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sip_core::{Method, Request, Response, SipMessage};
use sip_dialog::DialogId;
use sip_stack::{Hop, RouterKind, SipEvent, SipListener, SipStack, StackConfig};
use sip_transaction::{ServerTransactionHandle, TransportContext, TransportDispatcher};
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const PEER: &str = "192.0.2.1:5060";

pub fn peer() -> SocketAddr {
    PEER.parse().unwrap()
}

pub fn udp() -> TransportContext {
    TransportContext::udp(peer())
}

/// Captures everything the stack hands to the transport.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Duration, SipMessage)>>,
    pub fail: AtomicBool,
    start: Mutex<Option<Instant>>,
}

impl RecordingTransport {
    pub async fn responses(&self, code: u16) -> Vec<Response> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|(_, m)| m.as_response().filter(|r| r.code() == code).cloned())
            .collect()
    }

    pub async fn response_times(&self, code: u16) -> Vec<Duration> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(_, m)| m.as_response().map_or(false, |r| r.code() == code))
            .map(|(at, _)| *at)
            .collect()
    }

    pub async fn requests(&self, method: Method) -> Vec<Request> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|(_, m)| m.as_request().filter(|r| r.method() == &method).cloned())
            .collect()
    }

    pub async fn mark_start(&self) {
        *self.start.lock().await = Some(Instant::now());
    }
}

#[async_trait]
impl TransportDispatcher for RecordingTransport {
    async fn send_message(&self, _ctx: &TransportContext, message: &SipMessage) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        let start = *self.start.lock().await.get_or_insert_with(Instant::now);
        self.sent.lock().await.push((start.elapsed(), message.clone()));
        Ok(())
    }
}

/// Records every event in delivery order.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<SipEvent>>,
}

impl RecordingListener {
    pub async fn events(&self) -> Vec<SipEvent> {
        self.events.lock().await.clone()
    }

    pub async fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().await.iter().map(SipEvent::kind).collect()
    }

    /// Requests delivered so far, with their transaction handle and dialog.
    pub async fn requests(&self) -> Vec<(Request, Option<ServerTransactionHandle>, Option<DialogId>)> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                SipEvent::Request {
                    request,
                    transaction,
                    dialog,
                    ..
                } => Some((request.clone(), transaction.clone(), dialog.clone())),
                _ => None,
            })
            .collect()
    }

    pub async fn responses(&self) -> Vec<(u16, Option<DialogId>)> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                SipEvent::Response {
                    response, dialog, ..
                } => Some((response.code(), dialog.clone())),
                _ => None,
            })
            .collect()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl SipListener for RecordingListener {
    async fn on_event(&self, event: SipEvent) {
        self.events.lock().await.push(event);
    }
}

pub struct Harness {
    pub stack: SipStack,
    pub transport: Arc<RecordingTransport>,
    pub listener: Arc<RecordingListener>,
}

impl Harness {
    pub fn new(config: StackConfig) -> Self {
        init_tracing();
        let transport = Arc::new(RecordingTransport::default());
        let listener = Arc::new(RecordingListener::default());
        let stack = SipStack::new(config, transport.clone(), listener.clone());
        Self {
            stack,
            transport,
            listener,
        }
    }

    /// Stack whose requests all go to [`PEER`] over UDP.
    pub fn to_peer() -> Self {
        Self::new(
            StackConfig::default().with_router(RouterKind::Static(vec![Hop::udp(peer())])),
        )
    }

    pub async fn receive(&self, message: impl Into<SipMessage>) {
        self.stack
            .on_message_received(message.into(), udp())
            .await
            .unwrap();
        settle().await;
    }
}

/// Test logs, filtered by `RUST_LOG`. Only the first call installs them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Lets the dispatcher worker and spawned timer tasks run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Lets paused time run forward; every timer due in between fires in order.
pub async fn wait(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}
