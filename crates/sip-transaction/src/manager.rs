// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use sip_core::{
    CSeq, HeaderAccess, Headers, MessageError, Method, Request, RequestLine, Response, SipMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{
    fsm::{
        ClientAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent,
        ClientNonInviteFsm, ServerAction, ServerInviteEvent, ServerInviteFsm,
        ServerNonInviteEvent, ServerNonInviteFsm,
    },
    metrics::{TransactionMetrics, TransactionOutcome, TransactionRole},
    scheduler::{TimerHandle, TimerService},
    table::{TableEntry, TransactionTable},
    timers::{TimerDefaults, TransportAwareTimers},
    ServerInviteState, TimeoutKind, TransactionError, TransactionKey, TransactionState,
    TransactionTimer, TransportKind,
};

/// Transaction limits for DoS protection.
///
/// Without limits, an attacker can exhaust server memory by creating unlimited
/// transactions with unique branch IDs. When the server table is full new
/// requests are answered 503 without creating state.
///
/// ```
/// use sip_transaction::TransactionLimits;
///
/// let small = TransactionLimits::small();
/// assert_eq!(small.max_server_transactions, 1_000);
///
/// let custom = TransactionLimits::new(5_000, 2_000);
/// assert_eq!(custom.max_client_transactions, 2_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLimits {
    /// Maximum number of server transactions (incoming requests)
    pub max_server_transactions: usize,
    /// Maximum number of client transactions (outgoing requests)
    pub max_client_transactions: usize,
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self {
            max_server_transactions: 10_000,
            max_client_transactions: 10_000,
        }
    }
}

impl TransactionLimits {
    pub fn new(max_server: usize, max_client: usize) -> Self {
        Self {
            max_server_transactions: max_server,
            max_client_transactions: max_client,
        }
    }

    /// Unlimited transactions (use only for testing).
    pub fn unlimited() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }

    /// Small server preset (1-10 concurrent calls).
    pub fn small() -> Self {
        Self::new(1_000, 1_000)
    }

    /// Large server preset (100-1000 concurrent calls).
    pub fn large() -> Self {
        Self::new(100_000, 100_000)
    }
}

/// Sends messages produced by the transaction layer.
#[async_trait]
pub trait TransportDispatcher: Send + Sync + 'static {
    /// Serializes and sends `message` to the peer described by `ctx`.
    async fn send_message(&self, ctx: &TransportContext, message: &SipMessage) -> Result<()>;
}

/// Receives everything the transaction layer surfaces upward.
///
/// Callbacks for one transaction are issued in the order the underlying
/// events happened; the manager never holds a table lock while calling out.
#[async_trait]
pub trait TransactionUser: Send + Sync + 'static {
    /// A request reached the TU. `transaction` is `None` for requests that
    /// have no server transaction: ACKs for 2xx responses and CANCELs that
    /// match nothing. A CANCEL matching an INVITE still in Proceeding arrives
    /// with the INVITE's handle.
    async fn on_request(
        &self,
        request: Request,
        transaction: Option<ServerTransactionHandle>,
        ctx: TransportContext,
    );

    /// A response matched a client transaction.
    async fn on_response(&self, key: &TransactionKey, response: Response);

    /// A response matched no client transaction (e.g. a 2xx retransmission
    /// after the INVITE record was purged).
    async fn on_stray_response(&self, response: Response, ctx: TransportContext);

    async fn on_timeout(&self, key: &TransactionKey, kind: TimeoutKind);

    async fn on_transport_error(&self, key: &TransactionKey, reason: &str);

    /// The transaction has been removed from the table.
    async fn on_terminated(&self, key: &TransactionKey);
}

/// Where a transaction's messages go. Retransmissions reuse the same context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportContext {
    pub transport: TransportKind,
    pub peer: SocketAddr,
}

impl TransportContext {
    pub fn new(transport: TransportKind, peer: SocketAddr) -> Self {
        Self { transport, peer }
    }

    pub fn udp(peer: SocketAddr) -> Self {
        Self::new(TransportKind::Udp, peer)
    }
}

/// Builds a CANCEL for `invite` (RFC 3261 §9.1).
///
/// The CANCEL shares the INVITE's Request-URI, Call-ID, From, To, CSeq
/// number and top Via (hence its branch), and copies its Route headers.
pub fn build_cancel(invite: &Request) -> Result<Request, MessageError> {
    if invite.method() != &Method::Invite {
        return Err(MessageError::CSeqMethodMismatch {
            request: Method::Invite,
            cseq: invite.method().clone(),
        });
    }
    let via = invite
        .headers()
        .values("Via")
        .into_iter()
        .next()
        .ok_or(MessageError::MissingHeader("Via"))?;
    let cseq = invite.cseq().ok_or(MessageError::MissingHeader("CSeq"))?;

    let mut headers = Headers::new();
    headers.push("Via", via);
    for route in invite.headers().get_all("Route") {
        headers.push("Route", route.clone());
    }
    headers.push("Max-Forwards", "70");
    for name in ["From", "To", "Call-ID"] {
        let value = invite
            .headers()
            .get(name)
            .ok_or(MessageError::MissingHeader(name))?;
        headers.push(name, value.clone());
    }
    headers.push("CSeq", CSeq::new(cseq.number, Method::Cancel).to_string());
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Cancel, invite.uri().clone()),
        headers,
        Bytes::new(),
    )
}

enum ManagerCommand {
    TimerFired {
        key: TransactionKey,
        timer: TransactionTimer,
        generation: u64,
    },
    TransportError {
        key: TransactionKey,
        reason: String,
    },
    Shutdown,
}

struct ScheduledTimer {
    _handle: TimerHandle,
    generation: u64,
}

/// Entry stored for each active server-side transaction.
struct ServerEntry {
    kind: ServerKind,
    ctx: TransportContext,
    timers: HashMap<TransactionTimer, ScheduledTimer>,
    start_time: Instant,
    outcome: Option<TransactionOutcome>,
}

enum ServerKind {
    Invite(ServerInviteFsm),
    NonInvite(ServerNonInviteFsm),
}

struct ClientEntry {
    kind: ClientKind,
    ctx: TransportContext,
    timers: HashMap<TransactionTimer, ScheduledTimer>,
    start_time: Instant,
    outcome: Option<TransactionOutcome>,
}

enum ClientKind {
    Invite(ClientInviteFsm),
    NonInvite(ClientNonInviteFsm),
}

impl ServerEntry {
    fn new(method: &Method, ctx: TransportContext, defaults: TimerDefaults) -> Self {
        let timers = TransportAwareTimers::with_defaults(ctx.transport, defaults);
        Self {
            kind: match method {
                Method::Invite => ServerKind::Invite(ServerInviteFsm::new(timers)),
                _ => ServerKind::NonInvite(ServerNonInviteFsm::new(timers)),
            },
            ctx,
            timers: HashMap::new(),
            start_time: Instant::now(),
            outcome: None,
        }
    }

    fn state(&self) -> TransactionState {
        match &self.kind {
            ServerKind::Invite(fsm) => fsm.state.into(),
            ServerKind::NonInvite(fsm) => fsm.state.into(),
        }
    }

    fn request(&self) -> Option<&Request> {
        match &self.kind {
            ServerKind::Invite(fsm) => fsm.request(),
            ServerKind::NonInvite(fsm) => fsm.request(),
        }
    }

    fn can_respond(&self) -> bool {
        match &self.kind {
            ServerKind::Invite(fsm) => fsm.can_respond(),
            ServerKind::NonInvite(fsm) => fsm.can_respond(),
        }
    }

    fn on_request(&mut self, request: Request) -> Vec<ServerAction> {
        match &mut self.kind {
            ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::ReceiveInvite(request)),
            ServerKind::NonInvite(fsm) => {
                fsm.on_event(ServerNonInviteEvent::ReceiveRequest(request))
            }
        }
    }

    fn on_response(&mut self, response: Response) -> Vec<ServerAction> {
        let provisional = response.is_informational();
        match &mut self.kind {
            ServerKind::Invite(fsm) if provisional => {
                fsm.on_event(ServerInviteEvent::SendProvisional(response))
            }
            ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::SendFinal(response)),
            ServerKind::NonInvite(fsm) if provisional => {
                fsm.on_event(ServerNonInviteEvent::SendProvisional(response))
            }
            ServerKind::NonInvite(fsm) => fsm.on_event(ServerNonInviteEvent::SendFinal(response)),
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<ServerAction> {
        match &mut self.kind {
            ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::TimerFired(timer)),
            ServerKind::NonInvite(fsm) => fsm.on_event(ServerNonInviteEvent::TimerFired(timer)),
        }
    }

    fn on_transport_error(&mut self) -> Vec<ServerAction> {
        match &mut self.kind {
            ServerKind::Invite(fsm) => fsm.on_event(ServerInviteEvent::TransportError),
            ServerKind::NonInvite(fsm) => fsm.on_event(ServerNonInviteEvent::TransportError),
        }
    }

    fn cancel_timer(&mut self, timer: TransactionTimer) {
        self.timers.remove(&timer);
    }
}

impl TableEntry for ServerEntry {
    fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }
}

impl ClientEntry {
    fn state(&self) -> TransactionState {
        match &self.kind {
            ClientKind::Invite(fsm) => fsm.state.into(),
            ClientKind::NonInvite(fsm) => fsm.state.into(),
        }
    }

    fn request(&self) -> Option<&Request> {
        match &self.kind {
            ClientKind::Invite(fsm) => fsm.request(),
            ClientKind::NonInvite(fsm) => fsm.request(),
        }
    }

    fn on_response(&mut self, response: Response) -> Vec<ClientAction> {
        let provisional = response.is_informational();
        match &mut self.kind {
            ClientKind::Invite(fsm) if provisional => {
                fsm.on_event(ClientInviteEvent::ReceiveProvisional(response))
            }
            ClientKind::Invite(fsm) => fsm.on_event(ClientInviteEvent::ReceiveFinal(response)),
            ClientKind::NonInvite(fsm) if provisional => {
                fsm.on_event(ClientNonInviteEvent::ReceiveProvisional(response))
            }
            ClientKind::NonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::ReceiveFinal(response)),
        }
    }

    fn on_timer(&mut self, timer: TransactionTimer) -> Vec<ClientAction> {
        match &mut self.kind {
            ClientKind::Invite(fsm) => fsm.on_event(ClientInviteEvent::TimerFired(timer)),
            ClientKind::NonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::TimerFired(timer)),
        }
    }

    fn on_transport_error(&mut self) -> Vec<ClientAction> {
        match &mut self.kind {
            ClientKind::Invite(fsm) => fsm.on_event(ClientInviteEvent::TransportError),
            ClientKind::NonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::TransportError),
        }
    }

    fn cancel_timer(&mut self, timer: TransactionTimer) {
        self.timers.remove(&timer);
    }
}

impl TableEntry for ClientEntry {
    fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }
}

/// Owns SIP transactions and manages timers/actions.
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
    cmd_tx: mpsc::UnboundedSender<ManagerCommand>,
}

struct ManagerInner {
    dispatcher: Arc<dyn TransportDispatcher>,
    tu: Arc<dyn TransactionUser>,
    server: TransactionTable<ServerEntry>,
    client: TransactionTable<ClientEntry>,
    timer_defaults: TimerDefaults,
    scheduler: TimerService,
    generation: AtomicU64,
    metrics: TransactionMetrics,
}

impl TransactionManager {
    /// Creates a manager with RFC 3261 default timers and default limits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(dispatcher: Arc<dyn TransportDispatcher>, tu: Arc<dyn TransactionUser>) -> Self {
        Self::with_config(
            dispatcher,
            tu,
            TimerDefaults::default(),
            TransactionLimits::default(),
        )
    }

    /// Creates a manager with custom timers and limits.
    pub fn with_config(
        dispatcher: Arc<dyn TransportDispatcher>,
        tu: Arc<dyn TransactionUser>,
        timer_defaults: TimerDefaults,
        limits: TransactionLimits,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(ManagerInner {
                dispatcher,
                tu,
                server: TransactionTable::new(limits.max_server_transactions),
                client: TransactionTable::new(limits.max_client_transactions),
                timer_defaults,
                scheduler: TimerService::new(),
                generation: AtomicU64::new(0),
                metrics: TransactionMetrics::new(),
            }),
            cmd_tx,
        };
        manager.spawn_command_loop(cmd_rx);
        manager
    }

    pub fn metrics(&self) -> &TransactionMetrics {
        &self.inner.metrics
    }

    pub fn timer_defaults(&self) -> TimerDefaults {
        self.inner.timer_defaults
    }

    pub fn server_count(&self) -> usize {
        self.inner.server.len()
    }

    pub fn client_count(&self) -> usize {
        self.inner.client.len()
    }

    fn spawn_command_loop(&self, mut rx: mpsc::UnboundedReceiver<ManagerCommand>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    ManagerCommand::TimerFired {
                        key,
                        timer,
                        generation,
                    } => {
                        manager.handle_timer(key, timer, generation).await;
                    }
                    ManagerCommand::TransportError { key, reason } => {
                        manager.handle_transport_error(key, reason).await;
                    }
                    ManagerCommand::Shutdown => break,
                }
            }
            debug!("transaction manager command loop stopped");
        });
    }

    /// Drops every transaction (cancelling its timers) and stops the command loop.
    pub fn shutdown(&self) {
        for key in self.inner.server.keys() {
            self.inner.server.remove(&key);
        }
        for key in self.inner.client.keys() {
            self.inner.client.remove(&key);
        }
        let _ = self.cmd_tx.send(ManagerCommand::Shutdown);
    }

    /// Feeds an inbound request into the transaction layer.
    ///
    /// New requests create a server transaction and reach the TU once;
    /// retransmissions are absorbed by the existing transaction. When the
    /// server table is full the request is answered 503 statelessly and
    /// `ResourcesExhausted` is returned.
    pub async fn receive_request(
        &self,
        request: Request,
        ctx: TransportContext,
    ) -> Result<(), TransactionError> {
        request.validate_transactional()?;
        let key = TransactionKey::from_request(&request, true)
            .ok_or(TransactionError::InvalidMessage(MessageError::MissingBranch))?;

        match request.method() {
            Method::Ack => {
                self.receive_ack(key, request, ctx).await;
                return Ok(());
            }
            Method::Cancel => return self.receive_cancel(key, request, ctx).await,
            _ => {}
        }

        if self.inner.server.contains(&key) {
            return self.absorb_retransmission(&key, request).await;
        }

        let entry = ServerEntry::new(request.method(), ctx.clone(), self.inner.timer_defaults);
        match self.inner.server.insert_new(key.clone(), entry) {
            Ok(()) => {}
            Err(TransactionError::DuplicateTransaction(_)) => {
                return self.absorb_retransmission(&key, request).await;
            }
            Err(err) => {
                warn!(key = %key, %err, "rejecting request, server transaction table full");
                self.send_stateless(&request, 503, "Service Unavailable", &ctx)
                    .await;
                return Err(err);
            }
        }

        debug!(
            key = %key,
            method = %request.method(),
            transport = ctx.transport.as_str(),
            "created server transaction"
        );
        self.inner
            .metrics
            .record_start(TransactionRole::Server, request.method());
        let actions = self
            .with_server(&key, |entry| entry.on_request(request))
            .unwrap_or_default();
        self.apply_server_actions(&key, actions).await;
        Ok(())
    }

    async fn absorb_retransmission(
        &self,
        key: &TransactionKey,
        request: Request,
    ) -> Result<(), TransactionError> {
        debug!(key = %key, "request retransmission matched server transaction");
        self.inner.metrics.record_retransmission();
        let actions = self
            .with_server(key, |entry| entry.on_request(request))
            .unwrap_or_default();
        self.apply_server_actions(key, actions).await;
        Ok(())
    }

    async fn receive_ack(&self, key: TransactionKey, ack: Request, ctx: TransportContext) {
        let actions = self
            .with_server(&key, |entry| match &mut entry.kind {
                ServerKind::Invite(fsm)
                    if matches!(
                        fsm.state,
                        ServerInviteState::Completed | ServerInviteState::Confirmed
                    ) =>
                {
                    Some(fsm.on_event(ServerInviteEvent::ReceiveAck))
                }
                _ => None,
            })
            .flatten();

        match actions {
            Some(actions) => {
                debug!(key = %key, "ACK absorbed by INVITE server transaction");
                self.apply_server_actions(&key, actions).await;
            }
            None => {
                // ACK for a 2xx belongs to the dialog layer.
                self.inner.tu.on_request(ack, None, ctx).await;
            }
        }
    }

    async fn receive_cancel(
        &self,
        key: TransactionKey,
        cancel: Request,
        ctx: TransportContext,
    ) -> Result<(), TransactionError> {
        if self.inner.server.contains(&key) {
            return self.absorb_retransmission(&key, cancel).await;
        }

        let invite_key = key.invite_key();
        let invite_state = self.inner.server.get(&invite_key).map(|entry| entry.state());
        let Some(invite_state) = invite_state else {
            debug!(key = %key, "CANCEL matches no INVITE transaction");
            self.inner.tu.on_request(cancel, None, ctx).await;
            return Ok(());
        };

        let mut entry = ServerEntry::new(&Method::Cancel, ctx.clone(), self.inner.timer_defaults);
        // The CANCEL itself is surfaced below together with the INVITE handle.
        entry.on_request(cancel.clone());
        match self.inner.server.insert_new(key.clone(), entry) {
            Ok(()) => {}
            Err(TransactionError::DuplicateTransaction(_)) => {
                return self.absorb_retransmission(&key, cancel).await;
            }
            Err(err) => {
                self.send_stateless(&cancel, 503, "Service Unavailable", &ctx)
                    .await;
                return Err(err);
            }
        }
        self.inner
            .metrics
            .record_start(TransactionRole::Server, &Method::Cancel);

        let ok = Response::for_request(&cancel, 200, "OK")?;
        self.send_response(&key, ok).await?;

        if invite_state == TransactionState::Proceeding {
            debug!(key = %invite_key, "CANCEL matched INVITE in Proceeding");
            let handle = ServerTransactionHandle {
                manager: self.clone(),
                key: invite_key,
            };
            self.inner.tu.on_request(cancel, Some(handle), ctx).await;
        } else {
            debug!(
                key = %invite_key,
                state = ?invite_state,
                "CANCEL after final response, INVITE left alone"
            );
        }
        Ok(())
    }

    /// Creates a server transaction for a request the TU received without one.
    ///
    /// The request is not delivered again. Fails with `DuplicateTransaction`
    /// when a live transaction already owns the request's key.
    pub async fn create_server_transaction(
        &self,
        request: Request,
        ctx: TransportContext,
    ) -> Result<ServerTransactionHandle, TransactionError> {
        request.validate_transactional()?;
        let key = TransactionKey::from_request(&request, true)
            .ok_or(TransactionError::InvalidMessage(MessageError::MissingBranch))?;
        if request.method() == &Method::Ack {
            return Err(TransactionError::InvalidState {
                key,
                operation: "create a transaction for ACK",
            });
        }

        let mut entry = ServerEntry::new(request.method(), ctx, self.inner.timer_defaults);
        let actions: Vec<ServerAction> = entry
            .on_request(request.clone())
            .into_iter()
            .filter(|action| !matches!(action, ServerAction::Deliver(_)))
            .collect();
        self.inner.server.insert_new(key.clone(), entry)?;
        self.inner
            .metrics
            .record_start(TransactionRole::Server, request.method());
        self.apply_server_actions(&key, actions).await;

        Ok(ServerTransactionHandle {
            manager: self.clone(),
            key,
        })
    }

    /// Starts a client transaction and transmits the initial request.
    ///
    /// The request must carry a top Via with an RFC 3261 branch.
    pub async fn start_client_transaction(
        &self,
        request: Request,
        ctx: TransportContext,
    ) -> Result<TransactionKey, TransactionError> {
        request.validate_transactional()?;
        let key = TransactionKey::from_request(&request, false)
            .filter(|key| key.branch().is_some())
            .ok_or(TransactionError::InvalidMessage(MessageError::MissingBranch))?;
        if request.method() == &Method::Ack {
            return Err(TransactionError::InvalidState {
                key,
                operation: "send ACK in a client transaction",
            });
        }

        let timers = TransportAwareTimers::with_defaults(ctx.transport, self.inner.timer_defaults);
        let (kind, actions) = if request.method() == &Method::Invite {
            let mut fsm = ClientInviteFsm::new(timers);
            let actions = fsm.on_event(ClientInviteEvent::SendInvite(request.clone()));
            (ClientKind::Invite(fsm), actions)
        } else {
            let mut fsm = ClientNonInviteFsm::new(timers);
            let actions = fsm.on_event(ClientNonInviteEvent::SendRequest(request.clone()));
            (ClientKind::NonInvite(fsm), actions)
        };

        let entry = ClientEntry {
            kind,
            ctx: ctx.clone(),
            timers: HashMap::new(),
            start_time: Instant::now(),
            outcome: None,
        };
        self.inner.client.insert_new(key.clone(), entry)?;

        debug!(
            key = %key,
            call_id = ?request.call_id(),
            transport = ctx.transport.as_str(),
            "starting client transaction"
        );
        self.inner
            .metrics
            .record_start(TransactionRole::Client, request.method());
        self.apply_client_actions(&key, actions).await;
        Ok(key)
    }

    /// Feeds a network response into the matching client transaction, or to
    /// the TU as a stray response when none matches.
    pub async fn receive_response(&self, response: Response, ctx: TransportContext) {
        let Some(key) = TransactionKey::from_response(&response) else {
            warn!(status = response.code(), "response without usable Via/CSeq dropped");
            return;
        };

        if !self.inner.client.contains(&key) {
            debug!(key = %key, status = response.code(), "no matching client transaction");
            self.inner.tu.on_stray_response(response, ctx).await;
            return;
        }

        debug!(key = %key, status = response.code(), "response matched client transaction");
        let actions = self
            .with_client(&key, |entry| entry.on_response(response))
            .unwrap_or_default();
        self.apply_client_actions(&key, actions).await;
    }

    /// Sends a response through the server transaction `key`.
    pub async fn send_response(
        &self,
        key: &TransactionKey,
        response: Response,
    ) -> Result<(), TransactionError> {
        let actions = self
            .with_server(key, |entry| {
                if entry.can_respond() {
                    Ok(entry.on_response(response))
                } else {
                    Err(TransactionError::InvalidState {
                        key: key.clone(),
                        operation: "send a response",
                    })
                }
            })
            .ok_or_else(|| TransactionError::NotFound(key.clone()))??;
        self.apply_server_actions(key, actions).await;
        Ok(())
    }

    /// Answers `request` without creating any transaction state.
    pub async fn send_stateless(
        &self,
        request: &Request,
        code: u16,
        reason: &str,
        ctx: &TransportContext,
    ) {
        if request.method() == &Method::Ack {
            return;
        }
        match Response::for_request(request, code, reason) {
            Ok(response) => {
                let message = SipMessage::Response(response);
                if let Err(e) = self.inner.dispatcher.send_message(ctx, &message).await {
                    error!(%e, status = code, "stateless response dispatch failed");
                }
            }
            Err(e) => error!(%e, status = code, "cannot build stateless response"),
        }
    }

    /// Finds the transaction a message belongs to.
    ///
    /// Requests are matched against server transactions (`is_server`) and
    /// responses against client transactions.
    pub fn find_transaction(&self, message: &SipMessage, is_server: bool) -> Option<TransactionKey> {
        let key = match message {
            SipMessage::Request(request) => TransactionKey::from_request(request, is_server)?,
            SipMessage::Response(response) if !is_server => TransactionKey::from_response(response)?,
            SipMessage::Response(_) => return None,
        };
        let found = if key.is_server {
            self.inner.server.contains(&key)
        } else {
            self.inner.client.contains(&key)
        };
        found.then_some(key)
    }

    /// Finds the INVITE server transaction a CANCEL targets.
    pub fn find_cancel_transaction(&self, cancel: &Request) -> Option<TransactionKey> {
        if cancel.method() != &Method::Cancel {
            return None;
        }
        let invite_key = TransactionKey::from_request(cancel, true)?.invite_key();
        self.inner.server.contains(&invite_key).then_some(invite_key)
    }

    /// Removes a transaction without running its state machine. Returns
    /// whether anything was removed.
    pub fn remove_transaction(&self, key: &TransactionKey) -> bool {
        let removed = if key.is_server {
            self.inner.server.remove(key).is_some()
        } else {
            self.inner.client.remove(key).is_some()
        };
        if removed {
            debug!(key = %key, "transaction removed");
        }
        removed
    }

    pub fn transaction_state(&self, key: &TransactionKey) -> Option<TransactionState> {
        if key.is_server {
            self.inner.server.get(key).map(|entry| entry.state())
        } else {
            self.inner.client.get(key).map(|entry| entry.state())
        }
    }

    /// The request that created the transaction.
    pub fn original_request(&self, key: &TransactionKey) -> Option<Request> {
        if key.is_server {
            self.inner.server.get(key)?.request().cloned()
        } else {
            self.inner.client.get(key)?.request().cloned()
        }
    }

    /// Transport context of the transaction.
    pub fn transport_context(&self, key: &TransactionKey) -> Option<TransportContext> {
        if key.is_server {
            self.inner.server.get(key).map(|entry| entry.ctx.clone())
        } else {
            self.inner.client.get(key).map(|entry| entry.ctx.clone())
        }
    }

    /// Returns a handle to a live server transaction.
    pub fn server_handle(&self, key: &TransactionKey) -> Option<ServerTransactionHandle> {
        (key.is_server && self.inner.server.contains(key)).then(|| ServerTransactionHandle {
            manager: self.clone(),
            key: key.clone(),
        })
    }

    /// Sends a message outside any transaction (ACK for 2xx, 2xx
    /// retransmissions driven by the dialog layer).
    pub async fn send_direct(&self, ctx: &TransportContext, message: SipMessage) -> Result<()> {
        self.inner.dispatcher.send_message(ctx, &message).await
    }

    fn with_server<R>(
        &self,
        key: &TransactionKey,
        f: impl FnOnce(&mut ServerEntry) -> R,
    ) -> Option<R> {
        let mut entry = self.inner.server.get_mut(key)?;
        Some(f(&mut entry))
    }

    fn with_client<R>(
        &self,
        key: &TransactionKey,
        f: impl FnOnce(&mut ClientEntry) -> R,
    ) -> Option<R> {
        let mut entry = self.inner.client.get_mut(key)?;
        Some(f(&mut entry))
    }

    async fn handle_timer(&self, key: TransactionKey, timer: TransactionTimer, generation: u64) {
        let actions = if key.is_server {
            self.with_server(&key, |entry| {
                if entry.timers.get(&timer).map(|t| t.generation) != Some(generation) {
                    return None;
                }
                entry.timers.remove(&timer);
                Some(entry.on_timer(timer))
            })
            .flatten()
            .map(Actions::Server)
        } else {
            self.with_client(&key, |entry| {
                if entry.timers.get(&timer).map(|t| t.generation) != Some(generation) {
                    return None;
                }
                entry.timers.remove(&timer);
                Some(entry.on_timer(timer))
            })
            .flatten()
            .map(Actions::Client)
        };

        let Some(actions) = actions else {
            debug!(key = %key, ?timer, "stale timer firing ignored");
            return;
        };
        self.inner.metrics.record_timer_fired(timer);
        match actions {
            Actions::Server(actions) => self.apply_server_actions(&key, actions).await,
            Actions::Client(actions) => self.apply_client_actions(&key, actions).await,
        }
    }

    async fn handle_transport_error(&self, key: TransactionKey, reason: String) {
        let failed = Some(TransactionOutcome::TransportError);
        let actions = if key.is_server {
            self.with_server(&key, |entry| {
                entry.outcome = failed;
                entry.on_transport_error()
            })
            .map(Actions::Server)
        } else {
            self.with_client(&key, |entry| {
                entry.outcome = failed;
                entry.on_transport_error()
            })
            .map(Actions::Client)
        };
        let Some(actions) = actions else {
            return;
        };
        self.inner.tu.on_transport_error(&key, &reason).await;
        match actions {
            Actions::Server(actions) => self.apply_server_actions(&key, actions).await,
            Actions::Client(actions) => self.apply_client_actions(&key, actions).await,
        }
    }

    fn schedule_timer(&self, key: &TransactionKey, timer: TransactionTimer, duration: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let cmd_tx = self.cmd_tx.clone();
        let timer_key = key.clone();
        let handle = self.inner.scheduler.schedule_once(duration, move || {
            let _ = cmd_tx.send(ManagerCommand::TimerFired {
                key: timer_key,
                timer,
                generation,
            });
        });
        let scheduled = ScheduledTimer {
            _handle: handle,
            generation,
        };
        // Replacing an existing entry drops (and so cancels) the old timer.
        if key.is_server {
            self.with_server(key, |entry| entry.timers.insert(timer, scheduled));
        } else {
            self.with_client(key, |entry| entry.timers.insert(timer, scheduled));
        }
    }

    async fn transmit(&self, key: &TransactionKey, ctx: TransportContext, message: SipMessage) {
        if let Err(e) = self.inner.dispatcher.send_message(&ctx, &message).await {
            error!(%e, key = %key, "transport dispatch failed");
            let _ = self.cmd_tx.send(ManagerCommand::TransportError {
                key: key.clone(),
                reason: e.to_string(),
            });
        }
    }

    async fn apply_server_actions(&self, key: &TransactionKey, actions: Vec<ServerAction>) {
        for action in actions {
            match action {
                ServerAction::Deliver(request) => {
                    let Some(ctx) = self.inner.server.get(key).map(|e| e.ctx.clone()) else {
                        continue;
                    };
                    let handle = ServerTransactionHandle {
                        manager: self.clone(),
                        key: key.clone(),
                    };
                    self.inner.tu.on_request(request, Some(handle), ctx).await;
                }
                ServerAction::Transmit(response) => {
                    let Some(ctx) = self.inner.server.get(key).map(|e| e.ctx.clone()) else {
                        continue;
                    };
                    self.transmit(key, ctx, SipMessage::Response(response)).await;
                }
                ServerAction::Schedule { timer, duration } => {
                    self.schedule_timer(key, timer, duration);
                }
                ServerAction::Cancel(timer) => {
                    self.with_server(key, |entry| entry.cancel_timer(timer));
                }
                ServerAction::Timeout(kind) => {
                    self.with_server(key, |entry| entry.outcome = Some(TransactionOutcome::Timeout));
                    warn!(key = %key, ?kind, "server transaction timed out");
                    self.inner.tu.on_timeout(key, kind).await;
                }
                ServerAction::Terminate { reason } => {
                    if let Some(entry) = self.inner.server.remove(key) {
                        debug!(key = %key, %reason, "server transaction terminated");
                        self.record_end(entry.outcome, entry.start_time);
                        drop(entry);
                        self.inner.tu.on_terminated(key).await;
                    }
                }
            }
        }
    }

    async fn apply_client_actions(&self, key: &TransactionKey, actions: Vec<ClientAction>) {
        for action in actions {
            match action {
                ClientAction::Transmit(request) => {
                    let Some(ctx) = self.inner.client.get(key).map(|e| e.ctx.clone()) else {
                        continue;
                    };
                    self.transmit(key, ctx, SipMessage::Request(request)).await;
                }
                ClientAction::Deliver(response) => {
                    self.inner.tu.on_response(key, response).await;
                }
                ClientAction::Schedule { timer, duration } => {
                    self.schedule_timer(key, timer, duration);
                }
                ClientAction::Cancel(timer) => {
                    self.with_client(key, |entry| entry.cancel_timer(timer));
                }
                ClientAction::Timeout(kind) => {
                    self.with_client(key, |entry| entry.outcome = Some(TransactionOutcome::Timeout));
                    warn!(key = %key, ?kind, "client transaction timed out");
                    self.inner.tu.on_timeout(key, kind).await;
                }
                ClientAction::Terminate { reason } => {
                    if let Some(entry) = self.inner.client.remove(key) {
                        debug!(key = %key, %reason, "client transaction terminated");
                        self.record_end(entry.outcome, entry.start_time);
                        drop(entry);
                        self.inner.tu.on_terminated(key).await;
                    }
                }
            }
        }
    }

    fn record_end(&self, outcome: Option<TransactionOutcome>, started: Instant) {
        self.inner
            .metrics
            .record_outcome(outcome.unwrap_or(TransactionOutcome::Completed));
        self.inner.metrics.record_duration(started.elapsed());
    }
}

enum Actions {
    Server(Vec<ServerAction>),
    Client(Vec<ClientAction>),
}

/// Handle the TU uses to answer a server transaction.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    manager: TransactionManager,
    key: TransactionKey,
}

impl ServerTransactionHandle {
    /// Sends a provisional or final response on this transaction.
    pub async fn send_response(&self, response: Response) -> Result<(), TransactionError> {
        self.manager.send_response(&self.key, response).await
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Current state, or `None` once the transaction has been purged.
    pub fn state(&self) -> Option<TransactionState> {
        self.manager.transaction_state(&self.key)
    }

    /// The request that created this transaction.
    pub fn request(&self) -> Option<Request> {
        self.manager.original_request(&self.key)
    }
}

impl fmt::Debug for ServerTransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransactionHandle")
            .field("key", &self.key)
            .finish()
    }
}

impl PartialEq for ServerTransactionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
