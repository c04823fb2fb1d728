// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP stack context.
//!
//! Ties the transaction layer (`sip-transaction`) and dialog layer
//! (`sip-dialog`) together behind [`SipStack`], and delivers everything the
//! application needs to know as [`SipEvent`]s through one ordered queue.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use sip_core::SipMessage;
//! use sip_stack::{SipEvent, SipListener, SipStack, StackConfig};
//! use sip_transaction::{TransportContext, TransportDispatcher};
//!
//! struct Udp;
//!
//! #[async_trait]
//! impl TransportDispatcher for Udp {
//!     async fn send_message(&self, _ctx: &TransportContext, _msg: &SipMessage) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! struct App;
//!
//! #[async_trait]
//! impl SipListener for App {
//!     async fn on_event(&self, event: SipEvent) {
//!         println!("{}", event.kind());
//!     }
//! }
//!
//! # async fn run() {
//! let stack = SipStack::new(StackConfig::default(), Arc::new(Udp), Arc::new(App));
//! // feed inbound messages with stack.on_message_received(msg, ctx)
//! stack.shutdown().await;
//! # }
//! ```

pub mod config;
pub mod dispatcher;
mod error;
pub mod event;
pub mod router;
mod stack;

pub use config::{DeliveryMode, StackConfig};
pub use dispatcher::EventDispatcher;
pub use error::StackError;
pub use event::{DispatchItem, SipEvent, SipListener};
pub use router::{build_router, DefaultRouter, Hop, Router, RouterKind, StaticRouter};
pub use stack::SipStack;
