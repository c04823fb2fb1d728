// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use sip_core::MessageError;
use sip_dialog::DialogError;
use sip_transaction::TransactionError;

/// Errors returned by [`SipStack`](crate::SipStack) operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    Transaction(TransactionError),
    Dialog(DialogError),
    Message(MessageError),
    /// No usable next hop for the request.
    Routing(String),
    /// The transport refused a message sent outside a transaction.
    Transport(String),
    /// The event queue has been shut down.
    Shutdown,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::Transaction(err) => write!(f, "transaction error: {}", err),
            StackError::Dialog(err) => write!(f, "dialog error: {}", err),
            StackError::Message(err) => write!(f, "invalid message: {}", err),
            StackError::Routing(reason) => write!(f, "cannot route request: {}", reason),
            StackError::Transport(reason) => write!(f, "transport failure: {}", reason),
            StackError::Shutdown => write!(f, "stack is shut down"),
        }
    }
}

impl std::error::Error for StackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StackError::Transaction(err) => Some(err),
            StackError::Dialog(err) => Some(err),
            StackError::Message(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransactionError> for StackError {
    fn from(err: TransactionError) -> Self {
        StackError::Transaction(err)
    }
}

impl From<DialogError> for StackError {
    fn from(err: DialogError) -> Self {
        StackError::Dialog(err)
    }
}

impl From<MessageError> for StackError {
    fn from(err: MessageError) -> Self {
        StackError::Message(err)
    }
}
