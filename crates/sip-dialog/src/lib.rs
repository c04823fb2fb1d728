// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 dialog state management.
//!
//! A [`Dialog`] tracks the peer-to-peer relationship created by an INVITE (or
//! an extension dialog-creating method): its identifier, both CSeq spaces,
//! remote target and route set. It also keeps the bookkeeping the stack needs
//! for 2xx handshakes that live outside the INVITE transaction: the ACKs it
//! has sent, and the 2xx it is retransmitting until an ACK arrives.
//!
//! Dialog state moves `Early -> Confirmed -> Completed -> Terminated`; an
//! early dialog whose creating transaction fails goes straight to
//! `Terminated`.
//!
//! # Example
//! ```
//! use sip_dialog::{Dialog, DialogManager, DialogState};
//! use sip_transaction::TransactionKey;
//! # use sip_testkit::{build_invite, build_response};
//! let manager = DialogManager::new();
//! let invite = build_invite("sip:bob@example.com", "z9hG4bKdoc", "doc-call");
//! let ok = build_response(&invite, 200, "OK", Some("bob-tag"));
//! let key = TransactionKey::from_request(&invite, false).unwrap();
//!
//! let dialog = Dialog::new_uac(&invite, &ok, key).unwrap();
//! assert_eq!(dialog.state, DialogState::Confirmed);
//! manager.insert(dialog);
//! assert_eq!(manager.len(), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

use bytes::Bytes;
use sip_core::{
    CSeq, HeaderAccess, Headers, Method, NameAddr, Request, RequestLine, Response, Uri,
};
use sip_transaction::TransactionKey;
use smol_str::SmolStr;
use tracing::debug;

pub mod manager;
pub mod metrics;

pub use manager::DialogManager;
pub use metrics::{DialogMetrics, DialogMetricsSnapshot};

/// Dialog state per RFC 3261 §12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Established by a provisional response carrying a To tag
    Early,
    /// Established by a 2xx response
    Confirmed,
    /// A BYE transaction is in progress
    Completed,
    /// Dialog is over and may be removed
    Terminated,
}

/// Which side of the creating transaction we were on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    Uac,
    Uas,
}

/// Unique dialog identifier composed of Call-ID and local/remote tags (RFC 3261 §12).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<SmolStr>,
        local_tag: impl Into<SmolStr>,
        remote_tag: impl Into<SmolStr>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Dialog a received request belongs to: To tag is local, From tag remote.
    /// Returns `None` for requests without a To tag (out of dialog).
    pub fn for_incoming_request(req: &Request) -> Option<Self> {
        Some(Self::new(req.call_id()?, req.to_tag()?, req.from_tag()?))
    }

    /// Dialog a response to one of our requests belongs to: From tag is
    /// local, To tag remote.
    pub fn for_uac_response(resp: &Response) -> Option<Self> {
        Some(Self::new(resp.call_id()?, resp.from_tag()?, resp.to_tag()?))
    }

    /// Dialog a response we are sending belongs to: To tag is local, From
    /// tag remote.
    pub fn for_uas_response(resp: &Response) -> Option<Self> {
        Some(Self::new(resp.call_id()?, resp.to_tag()?, resp.from_tag()?))
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Dialog-related errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogError {
    /// A received request's CSeq is lower than the last one accepted.
    OutOfOrder { last: u32, received: u32 },
    /// No dialog with this identifier
    NotFound,
    /// Operation not allowed in the dialog's current state
    InvalidState(DialogState),
    /// Method cannot be sent through the dialog this way
    InvalidMethod(Method),
    /// The message lacks a header needed to build or match the dialog
    MissingHeader(&'static str),
    /// Response cannot establish a dialog (no To tag, or not 1xx/2xx)
    NotDialogCreating(u16),
    /// The local CSeq has reached `u32::MAX`
    CSeqExhausted,
}

impl fmt::Display for DialogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogError::OutOfOrder { last, received } => {
                write!(f, "CSeq {} is lower than last remote CSeq {}", received, last)
            }
            DialogError::NotFound => write!(f, "Dialog not found"),
            DialogError::InvalidState(state) => write!(f, "Invalid dialog state {:?}", state),
            DialogError::InvalidMethod(method) => {
                write!(f, "{} cannot be sent through the dialog", method)
            }
            DialogError::MissingHeader(name) => write!(f, "Missing required header {}", name),
            DialogError::NotDialogCreating(code) => {
                write!(f, "{} response does not establish a dialog", code)
            }
            DialogError::CSeqExhausted => write!(f, "Local CSeq space exhausted"),
        }
    }
}

impl std::error::Error for DialogError {}

/// Returns `true` for requests that establish a dialog: INVITE plus any
/// configured extension methods (e.g. SUBSCRIBE, REFER).
pub fn is_dialog_creating(method: &Method, extensions: &[Method]) -> bool {
    *method == Method::Invite || extensions.contains(method)
}

/// Complete dialog state tracking per RFC 3261 §12.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub role: DialogRole,
    /// Last CSeq we used; the next dialog request gets `local_cseq + 1`.
    pub local_cseq: u32,
    /// Last CSeq accepted from the peer.
    pub remote_cseq: Option<u32>,
    /// Our From/To header value, tag included.
    pub local_party: SmolStr,
    /// The peer's From/To header value, tag included.
    pub remote_party: SmolStr,
    /// Where in-dialog requests go (the peer's Contact).
    pub remote_target: Uri,
    /// Route set in the order Route headers are emitted.
    pub route_set: Vec<Uri>,
    pub secure: bool,
    pub creating_transaction: TransactionKey,
    /// Transactions sent or received inside this dialog.
    pub transactions: HashSet<TransactionKey>,
    /// CSeq of the last INVITE sent, reused by its ACK.
    pub invite_cseq: Option<u32>,
    bye_transaction: Option<TransactionKey>,
    acks: HashMap<u32, Request>,
    pending_ok: Option<(u32, Response)>,
    /// Number handed out by `create_request` and not yet sent.
    reserved_cseq: Option<u32>,
    last_invite_ok: Option<u32>,
}

impl Dialog {
    /// Creates a dialog on the UAC side from a 1xx/2xx carrying a To tag.
    pub fn new_uac(
        request: &Request,
        response: &Response,
        origin: TransactionKey,
    ) -> Result<Self, DialogError> {
        let state = creating_state(response)?;
        let id = DialogId::for_uac_response(response)
            .ok_or(DialogError::NotDialogCreating(response.code()))?;
        let cseq = request.cseq().ok_or(DialogError::MissingHeader("CSeq"))?;
        let local_party = request
            .headers()
            .get("From")
            .cloned()
            .ok_or(DialogError::MissingHeader("From"))?;
        let remote_party = response
            .headers()
            .get("To")
            .cloned()
            .ok_or(DialogError::MissingHeader("To"))?;

        let mut route_set = route_set(response.headers());
        route_set.reverse();
        let remote_target = contact_uri(response.headers()).unwrap_or_else(|| request.uri().clone());

        let mut transactions = HashSet::new();
        transactions.insert(origin.clone());
        debug!(dialog = %id, ?state, "UAC dialog created");

        Ok(Self {
            id,
            state,
            role: DialogRole::Uac,
            local_cseq: cseq.number,
            remote_cseq: None,
            local_party,
            remote_party,
            remote_target,
            route_set,
            secure: request.uri().is_sips(),
            invite_cseq: (cseq.method == Method::Invite).then_some(cseq.number),
            creating_transaction: origin,
            transactions,
            bye_transaction: None,
            acks: HashMap::new(),
            pending_ok: None,
            reserved_cseq: None,
            last_invite_ok: None,
        })
    }

    /// Creates a dialog on the UAS side when responding with a To tag.
    pub fn new_uas(
        request: &Request,
        response: &Response,
        origin: TransactionKey,
    ) -> Result<Self, DialogError> {
        let state = creating_state(response)?;
        let id = DialogId::for_uas_response(response)
            .ok_or(DialogError::NotDialogCreating(response.code()))?;
        let cseq = request.cseq().ok_or(DialogError::MissingHeader("CSeq"))?;
        let remote_party = request
            .headers()
            .get("From")
            .cloned()
            .ok_or(DialogError::MissingHeader("From"))?;
        let local_party = response
            .headers()
            .get("To")
            .cloned()
            .ok_or(DialogError::MissingHeader("To"))?;

        let remote_target = contact_uri(request.headers())
            .ok_or(DialogError::MissingHeader("Contact"))?;

        let mut transactions = HashSet::new();
        transactions.insert(origin.clone());
        debug!(dialog = %id, ?state, "UAS dialog created");

        Ok(Self {
            id,
            state,
            role: DialogRole::Uas,
            local_cseq: 0,
            remote_cseq: Some(cseq.number),
            local_party,
            remote_party,
            remote_target,
            route_set: route_set(request.headers()),
            secure: request.uri().is_sips(),
            invite_cseq: None,
            creating_transaction: origin,
            transactions,
            bye_transaction: None,
            acks: HashMap::new(),
            pending_ok: None,
            reserved_cseq: None,
            last_invite_ok: None,
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }

    /// Applies a response on one of this dialog's transactions.
    ///
    /// Covers both roles: responses we receive as UAC and responses we send
    /// as UAS. Returns `true` when the state changed.
    pub fn on_response(&mut self, key: &TransactionKey, response: &Response) -> bool {
        let before = self.state;
        let code = response.code();

        if *key == self.creating_transaction {
            match code {
                100..=199 => {
                    if self.role == DialogRole::Uac {
                        self.refresh_target(response.headers());
                    }
                }
                200..=299 => {
                    if self.state == DialogState::Early {
                        self.state = DialogState::Confirmed;
                        if self.role == DialogRole::Uac {
                            let mut routes = route_set(response.headers());
                            routes.reverse();
                            self.route_set = routes;
                        }
                    }
                    if self.role == DialogRole::Uac {
                        self.refresh_target(response.headers());
                    }
                }
                _ => {
                    if self.state == DialogState::Early {
                        self.state = DialogState::Terminated;
                    }
                }
            }
        } else {
            match code {
                200..=299 if matches!(key.method, Method::Invite | Method::Update) => {
                    if !key.is_server {
                        self.refresh_target(response.headers());
                    }
                }
                // RFC 3261 §12.2.1.2: the peer has lost the dialog.
                408 | 481 if !key.is_server => self.state = DialogState::Terminated,
                _ => {}
            }
        }

        if before != self.state {
            debug!(dialog = %self.id, from = ?before, to = ?self.state, "dialog state changed");
        }
        before != self.state
    }

    /// Builds a new in-dialog request with the next local CSeq.
    ///
    /// ACK reuses the last INVITE's CSeq without consuming a number; CANCEL
    /// must be built from the INVITE it cancels instead. The returned request
    /// has no Via; the sender adds one with a fresh branch.
    pub fn create_request(&mut self, method: Method) -> Result<Request, DialogError> {
        if self.state == DialogState::Terminated {
            return Err(DialogError::InvalidState(self.state));
        }
        match method {
            Method::Cancel => return Err(DialogError::InvalidMethod(method)),
            Method::Ack => {
                let cseq = self
                    .invite_cseq
                    .ok_or(DialogError::InvalidMethod(Method::Ack))?;
                return self.create_ack(cseq);
            }
            _ => {}
        }

        let number = self.next_local_cseq(&method)?;
        self.reserved_cseq = Some(number);
        self.build_request(method, number)
    }

    fn next_local_cseq(&mut self, method: &Method) -> Result<u32, DialogError> {
        let number = self
            .local_cseq
            .checked_add(1)
            .ok_or(DialogError::CSeqExhausted)?;
        self.local_cseq = number;
        if *method == Method::Invite {
            self.invite_cseq = Some(number);
        }
        Ok(number)
    }

    /// Builds the ACK for a 2xx to the INVITE sent with `cseq`.
    pub fn create_ack(&self, cseq: u32) -> Result<Request, DialogError> {
        self.build_request(Method::Ack, cseq)
    }

    /// Prepares a caller-built request for sending inside this dialog.
    ///
    /// Fills in From/To tags, Call-ID and the route set when absent, assigns
    /// the next local CSeq (ACK keeps the INVITE's number) and associates
    /// `transaction` with the dialog. A request from [`Dialog::create_request`]
    /// keeps the number it was built with. Returns the CSeq number used.
    pub fn prepare_request(
        &mut self,
        request: &mut Request,
        transaction: TransactionKey,
    ) -> Result<u32, DialogError> {
        if self.state == DialogState::Terminated {
            return Err(DialogError::InvalidState(self.state));
        }
        let method = request.method().clone();
        let number = match method {
            Method::Cancel => return Err(DialogError::InvalidMethod(method)),
            Method::Ack => self
                .invite_cseq
                .ok_or(DialogError::InvalidMethod(Method::Ack))?,
            _ => {
                let carried = request
                    .cseq()
                    .filter(|cseq| cseq.method == method)
                    .map(|cseq| cseq.number);
                match self.reserved_cseq.take() {
                    Some(reserved) if carried == Some(reserved) => reserved,
                    _ => self.next_local_cseq(&method)?,
                }
            }
        };

        let headers = request.headers_mut();
        if headers.get("From").and_then(|v| sip_core::extract_tag(v)).is_none() {
            headers.set("From", self.local_party.clone());
        }
        if headers.get("To").and_then(|v| sip_core::extract_tag(v)).is_none() {
            headers.set("To", self.remote_party.clone());
        }
        if !headers.contains("Call-ID") {
            headers.set("Call-ID", self.id.call_id.clone());
        }
        if !headers.contains("Route") {
            for route in self.route_headers() {
                headers.push("Route", route);
            }
        }
        headers.set("CSeq", CSeq::new(number, method.clone()).to_string());

        if method != Method::Ack {
            self.transactions.insert(transaction.clone());
        }
        if method == Method::Bye {
            self.on_bye(transaction);
        }
        Ok(number)
    }

    /// Checks and records a request received inside this dialog.
    ///
    /// Rejects a CSeq lower than the last accepted one; equal numbers are
    /// accepted. ACK and CANCEL carry the number of the request they refer
    /// to and are not sequenced.
    pub fn validate_remote_request(&mut self, request: &Request) -> Result<(), DialogError> {
        let cseq = request.cseq().ok_or(DialogError::MissingHeader("CSeq"))?;
        if matches!(request.method(), Method::Ack | Method::Cancel) {
            return Ok(());
        }
        if let Some(last) = self.remote_cseq {
            if cseq.number < last {
                return Err(DialogError::OutOfOrder {
                    last,
                    received: cseq.number,
                });
            }
        }
        self.remote_cseq = Some(cseq.number);
        if matches!(request.method(), Method::Invite | Method::Update) {
            self.refresh_target(request.headers());
        }
        Ok(())
    }

    /// Associates a transaction with the dialog.
    pub fn track_transaction(&mut self, key: TransactionKey) {
        self.transactions.insert(key);
    }

    /// Remembers the ACK sent for the 2xx to the INVITE with `cseq`.
    pub fn record_ack(&mut self, cseq: u32, ack: Request) {
        self.acks.insert(cseq, ack);
    }

    /// The ACK previously sent for this (retransmitted) 2xx, if any.
    pub fn ack_for(&self, response: &Response) -> Option<&Request> {
        let cseq = response.cseq()?;
        if cseq.method != Method::Invite || !response.is_success() {
            return None;
        }
        self.acks.get(&cseq.number)
    }

    /// Records a 2xx received for the INVITE sent with `cseq`. Returns
    /// `false` when one was already recorded, i.e. this is a retransmission.
    pub fn record_invite_ok(&mut self, cseq: u32) -> bool {
        if self.last_invite_ok.map_or(false, |last| last >= cseq) {
            return false;
        }
        self.last_invite_ok = Some(cseq);
        true
    }

    /// Stores the 2xx being retransmitted until the ACK for `cseq` arrives.
    pub fn set_pending_ok(&mut self, cseq: u32, response: Response) {
        self.pending_ok = Some((cseq, response));
    }

    pub fn pending_ok(&self) -> Option<&Response> {
        self.pending_ok.as_ref().map(|(_, response)| response)
    }

    /// Clears the pending 2xx when `cseq` acknowledges it. Returns whether
    /// this ACK was the first one for a pending 2xx.
    pub fn on_ack_received(&mut self, cseq: u32) -> bool {
        match &self.pending_ok {
            Some((pending, _)) if *pending == cseq => {
                self.pending_ok = None;
                true
            }
            _ => false,
        }
    }

    /// Marks the dialog as shutting down through `transaction`.
    pub fn on_bye(&mut self, transaction: TransactionKey) {
        if self.state != DialogState::Terminated {
            self.state = DialogState::Completed;
        }
        self.pending_ok = None;
        self.transactions.insert(transaction.clone());
        self.bye_transaction = Some(transaction);
    }

    /// Forgets a finished transaction. Returns `true` when it was the BYE
    /// transaction and the dialog is now terminated.
    pub fn on_transaction_terminated(&mut self, key: &TransactionKey) -> bool {
        self.transactions.remove(key);
        if self.bye_transaction.as_ref() == Some(key) {
            self.state = DialogState::Terminated;
            return true;
        }
        false
    }

    /// Forces the dialog to `Terminated`.
    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
        self.pending_ok = None;
    }

    fn refresh_target(&mut self, headers: &Headers) {
        if let Some(target) = contact_uri(headers) {
            self.remote_target = target;
        }
    }

    fn route_headers(&self) -> Vec<SmolStr> {
        self.route_set
            .iter()
            .map(|uri| SmolStr::new(format!("<{}>", uri)))
            .collect()
    }

    fn build_request(&self, method: Method, cseq: u32) -> Result<Request, DialogError> {
        // Strict routing (RFC 3261 §12.2.1.1): the first route becomes the
        // Request-URI and the remote target is appended to the Route set.
        let strict = self
            .route_set
            .first()
            .map(|first| first.as_sip().map_or(true, |sip| !sip.is_loose_route()))
            .unwrap_or(false);

        let mut headers = Headers::new();
        let target = if strict {
            for route in self.route_set.iter().skip(1) {
                headers.push("Route", format!("<{}>", route));
            }
            headers.push("Route", format!("<{}>", self.remote_target));
            self.route_set[0].clone()
        } else {
            for route in self.route_headers() {
                headers.push("Route", route);
            }
            self.remote_target.clone()
        };
        headers.push("Max-Forwards", "70");
        headers.push("From", self.local_party.clone());
        headers.push("To", self.remote_party.clone());
        headers.push("Call-ID", self.id.call_id.clone());
        headers.push("CSeq", CSeq::new(cseq, method.clone()).to_string());
        headers.push("Content-Length", "0");

        Request::new(RequestLine::new(method, target), headers, Bytes::new())
            .map_err(|_| DialogError::MissingHeader("Request-Line"))
    }
}

fn creating_state(response: &Response) -> Result<DialogState, DialogError> {
    match response.code() {
        101..=199 => Ok(DialogState::Early),
        200..=299 => Ok(DialogState::Confirmed),
        code => Err(DialogError::NotDialogCreating(code)),
    }
}

fn contact_uri(headers: &Headers) -> Option<Uri> {
    let contact = headers.values("Contact").into_iter().next()?;
    NameAddr::parse(&contact).map(|addr| addr.uri)
}

fn route_set(headers: &Headers) -> Vec<Uri> {
    headers
        .values("Record-Route")
        .iter()
        .filter_map(|value| NameAddr::parse(value))
        .map(|addr| addr.uri)
        .collect()
}
