// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 transaction layer.
//!
//! - [`fsm`]: sans-IO state machines for the four transaction kinds
//! - [`manager`]: owns live transactions, runs their timers and talks to the transport
//! - [`table`]: the concurrent transaction table with atomic find-or-create
//! - [`scheduler`]: cancellable one-shot and back-off timers on tokio
//! - [`timers`]: transport-aware RFC 3261 timer values

use std::fmt;

use rand::{distributions::Alphanumeric, Rng};
use sip_core::{HeaderAccess, Method, Request, Response, MAGIC_COOKIE};
use smol_str::SmolStr;

pub mod error;
pub mod fsm;
pub mod manager;
pub mod metrics;
pub mod scheduler;
pub mod table;
pub mod timers;

pub use error::TransactionError;
pub use fsm::{
    build_non_2xx_ack, ClientAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent,
    ClientNonInviteFsm, ServerAction, ServerInviteEvent, ServerInviteFsm, ServerNonInviteEvent,
    ServerNonInviteFsm,
};
pub use manager::{
    build_cancel, ServerTransactionHandle, TransactionLimits, TransactionManager,
    TransactionUser, TransportContext, TransportDispatcher,
};
pub use scheduler::{TimerHandle, TimerService};
pub use table::{TableEntry, TransactionTable};
pub use timers::{TimerDefaults, TransportAwareTimers};

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{}{}", MAGIC_COOKIE, suffix))
}

/// Transport class of the hop a transaction runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// Returns true for connection-oriented transports (TCP or TLS).
    pub fn is_reliable(self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }

    /// Maps a Via transport token. Unknown tokens are treated as unreliable.
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("TCP") {
            TransportKind::Tcp
        } else if token.eq_ignore_ascii_case("TLS") {
            TransportKind::Tls
        } else {
            TransportKind::Udp
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }
}

/// Timers referenced by the SIP transaction state machines (RFC 3261 §17).
///
/// `Trying` drives the automatic 100 response of INVITE server transactions
/// and `Linger` keeps a record answered by a 2xx around long enough to
/// absorb retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    Trying,
    Linger,
    T1,
    T2,
    T4,
}

/// Distinguishes a retransmission interval from a transaction giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    Retransmit,
    Transaction,
}

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// State of any transaction, as reported outside the transaction layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

impl TransactionState {
    pub fn is_terminated(self) -> bool {
        matches!(self, TransactionState::Terminated)
    }
}

impl From<ClientInviteState> for TransactionState {
    fn from(state: ClientInviteState) -> Self {
        match state {
            ClientInviteState::Calling => TransactionState::Calling,
            ClientInviteState::Proceeding => TransactionState::Proceeding,
            ClientInviteState::Completed => TransactionState::Completed,
            ClientInviteState::Terminated => TransactionState::Terminated,
        }
    }
}

impl From<ServerInviteState> for TransactionState {
    fn from(state: ServerInviteState) -> Self {
        match state {
            ServerInviteState::Proceeding => TransactionState::Proceeding,
            ServerInviteState::Completed => TransactionState::Completed,
            ServerInviteState::Confirmed => TransactionState::Confirmed,
            ServerInviteState::Terminated => TransactionState::Terminated,
        }
    }
}

impl From<ClientNonInviteState> for TransactionState {
    fn from(state: ClientNonInviteState) -> Self {
        match state {
            ClientNonInviteState::Trying => TransactionState::Trying,
            ClientNonInviteState::Proceeding => TransactionState::Proceeding,
            ClientNonInviteState::Completed => TransactionState::Completed,
            ClientNonInviteState::Terminated => TransactionState::Terminated,
        }
    }
}

impl From<ServerNonInviteState> for TransactionState {
    fn from(state: ServerNonInviteState) -> Self {
        match state {
            ServerNonInviteState::Trying => TransactionState::Trying,
            ServerNonInviteState::Proceeding => TransactionState::Proceeding,
            ServerNonInviteState::Completed => TransactionState::Completed,
            ServerNonInviteState::Terminated => TransactionState::Terminated,
        }
    }
}

/// Identifier shared by every message of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionId {
    /// RFC 3261 branch (magic cookie present), lower-cased.
    Branch(SmolStr),
    /// RFC 2543 peers: derived from the fields that stay constant across
    /// retransmissions of the request and its ACK.
    Legacy {
        call_id: SmolStr,
        cseq: u32,
        sent_by: SmolStr,
        from_tag: Option<SmolStr>,
    },
}

impl TransactionId {
    /// Derives the identifier from the top Via (and, for legacy peers,
    /// Call-ID, CSeq number and From tag) of any message.
    pub fn from_message<M: HeaderAccess>(message: &M) -> Option<Self> {
        let via = message.top_via()?;
        if via.has_rfc3261_branch() {
            let branch = via.branch()?;
            return Some(TransactionId::Branch(SmolStr::new(
                branch.to_ascii_lowercase(),
            )));
        }
        Some(TransactionId::Legacy {
            call_id: SmolStr::new(message.call_id()?),
            cseq: message.cseq()?.number,
            sent_by: via.sent_by,
            from_tag: message.from_tag(),
        })
    }

    /// Returns the branch for RFC 3261 identifiers.
    pub fn branch(&self) -> Option<&str> {
        match self {
            TransactionId::Branch(branch) => Some(branch.as_str()),
            TransactionId::Legacy { .. } => None,
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionId::Branch(branch) => f.write_str(branch),
            TransactionId::Legacy {
                call_id,
                cseq,
                sent_by,
                ..
            } => write!(f, "{}:{}@{}", call_id, cseq, sent_by),
        }
    }
}

/// Unique key identifying a transaction (id + method + direction).
///
/// An ACK maps onto the INVITE it acknowledges. CANCEL keeps its own key
/// even though it shares the INVITE's branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub id: TransactionId,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    /// Builds the key of the transaction a request belongs to.
    pub fn from_request(req: &Request, is_server: bool) -> Option<Self> {
        Some(Self {
            id: TransactionId::from_message(req)?,
            method: key_method(req.method()),
            is_server,
        })
    }

    /// Builds the key of the client transaction a response answers.
    pub fn from_response(resp: &Response) -> Option<Self> {
        Some(Self {
            id: TransactionId::from_message(resp)?,
            method: key_method(&resp.cseq()?.method),
            is_server: false,
        })
    }

    /// Key of the INVITE transaction a CANCEL with this key targets.
    pub fn invite_key(&self) -> Self {
        Self {
            id: self.id.clone(),
            method: Method::Invite,
            is_server: self.is_server,
        }
    }

    /// Key of a CANCEL sharing this transaction's identifier.
    pub fn cancel_key(&self) -> Self {
        Self {
            id: self.id.clone(),
            method: Method::Cancel,
            is_server: self.is_server,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.id.branch()
    }

    pub fn is_invite(&self) -> bool {
        self.method == Method::Invite
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.id,
            self.method,
            if self.is_server { "server" } else { "client" }
        )
    }
}

fn key_method(method: &Method) -> Method {
    match method {
        Method::Ack => Method::Invite,
        other => other.clone(),
    }
}
