// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use async_trait::async_trait;
use sip_core::{Request, Response};
use sip_dialog::DialogId;
use sip_transaction::{ServerTransactionHandle, TimeoutKind, TransactionKey, TransportContext};

/// Everything the stack reports to the application.
#[derive(Debug, Clone)]
pub enum SipEvent {
    /// A new request. `transaction` is `None` for ACKs of 2xx responses and
    /// for CANCELs that matched nothing; a CANCEL for a pending INVITE
    /// carries the INVITE's handle so the application can answer 487.
    Request {
        request: Request,
        transaction: Option<ServerTransactionHandle>,
        dialog: Option<DialogId>,
        ctx: TransportContext,
    },
    /// A response to a request we sent. `transaction` is `None` for 2xx
    /// retransmissions that arrive after the INVITE transaction is gone.
    Response {
        response: Response,
        transaction: Option<TransactionKey>,
        dialog: Option<DialogId>,
    },
    /// A transaction gave up (`Transaction`), or with the retransmission
    /// filter off, a 2xx retransmit interval elapsed (`Retransmit`). 2xx
    /// retransmission timeouts name the dialog instead of a transaction.
    Timeout {
        kind: TimeoutKind,
        transaction: Option<TransactionKey>,
        dialog: Option<DialogId>,
    },
    /// The transport failed while sending for a transaction.
    TransactionError {
        transaction: TransactionKey,
        reason: String,
    },
    TransactionTerminated {
        transaction: TransactionKey,
    },
    DialogTerminated {
        dialog: DialogId,
    },
}

impl SipEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SipEvent::Request { .. } => "request",
            SipEvent::Response { .. } => "response",
            SipEvent::Timeout { .. } => "timeout",
            SipEvent::TransactionError { .. } => "transaction-error",
            SipEvent::TransactionTerminated { .. } => "transaction-terminated",
            SipEvent::DialogTerminated { .. } => "dialog-terminated",
        }
    }
}

/// The application side of the stack.
#[async_trait]
pub trait SipListener: Send + Sync + 'static {
    async fn on_event(&self, event: SipEvent);
}

/// Entry in the dispatch queue. `Shutdown` stops the worker once every
/// event queued before it has been delivered.
#[derive(Debug)]
pub enum DispatchItem {
    Event(SipEvent),
    Shutdown,
}
