// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use sip_core::MessageError;

use crate::TransactionKey;

/// Errors returned synchronously by transaction operations.
///
/// Failures that happen later on a timer or transport task are not returned
/// here; they reach the transaction user as callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// A live transaction with the same key already exists.
    DuplicateTransaction(TransactionKey),
    /// The table is at its configured capacity.
    ResourcesExhausted { limit: usize },
    /// The message lacks what a transaction needs (Call-ID, CSeq, Via).
    InvalidMessage(MessageError),
    /// No transaction with this key is in the table.
    NotFound(TransactionKey),
    /// The operation is not legal in the transaction's current state.
    InvalidState {
        key: TransactionKey,
        operation: &'static str,
    },
    /// The transport refused the initial send.
    Transport(String),
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateTransaction(key) => write!(f, "transaction {} already exists", key),
            Self::ResourcesExhausted { limit } => {
                write!(f, "transaction table full (limit {})", limit)
            }
            Self::InvalidMessage(err) => write!(f, "invalid message: {}", err),
            Self::NotFound(key) => write!(f, "no transaction {}", key),
            Self::InvalidState { key, operation } => {
                write!(f, "cannot {} in current state of {}", operation, key)
            }
            Self::Transport(reason) => write!(f, "transport failure: {}", reason),
        }
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidMessage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MessageError> for TransactionError {
    fn from(err: MessageError) -> Self {
        Self::InvalidMessage(err)
    }
}
