// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The stack context: transactions, dialogs and event delivery behind one
//! handle.
//!
//! [`SipStack`] owns a [`TransactionManager`] and a [`DialogManager`] and
//! acts as the transaction user for the former. Everything the application
//! needs to see is turned into a [`SipEvent`] and pushed through the
//! [`EventDispatcher`], so the listener observes one ordered stream.
//!
//! The stack answers a few requests on its own:
//! - 481 to an in-dialog request whose dialog is unknown
//! - 500 to an in-dialog request whose CSeq is lower than the last one seen
//! - 503 when the server transaction table is full (done by the manager)
//!
//! 2xx responses to INVITE are retransmitted here, not by the transaction,
//! until the ACK arrives or 64*T1 passes. With the retransmission filter off
//! the stack reports each interval as a `Retransmit` timeout and leaves the
//! sending to the application.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sip_core::{with_tag, HeaderAccess, MessageError, Method, Request, Response, SipMessage};
use sip_dialog::{is_dialog_creating, Dialog, DialogError, DialogId, DialogManager, DialogState};
use sip_transaction::{
    build_cancel, generate_branch_id, ServerTransactionHandle, TimeoutKind, TimerHandle,
    TimerService, TransactionError, TransactionKey, TransactionManager, TransactionState,
    TransactionUser, TransportContext, TransportDispatcher,
};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StackConfig;
use crate::dispatcher::EventDispatcher;
use crate::event::{SipEvent, SipListener};
use crate::router::{build_router, Router};
use crate::StackError;

/// Handle to a running stack. Clones share the same state.
#[derive(Clone)]
pub struct SipStack {
    core: Arc<StackCore>,
}

struct StackCore {
    config: StackConfig,
    transactions: TransactionManager,
    dialogs: DialogManager,
    dispatcher: EventDispatcher,
    router: Arc<dyn Router>,
    timers: TimerService,
    ok_jobs: DashMap<DialogId, OkRetransmission>,
    cmd_tx: mpsc::UnboundedSender<StackCommand>,
}

/// A 2xx waiting for its ACK. Dropping the job cancels both timers.
struct OkRetransmission {
    response: Response,
    ctx: TransportContext,
    _retransmit: Option<TimerHandle>,
    _deadline: TimerHandle,
}

#[derive(Debug)]
enum StackCommand {
    RetransmitOk(DialogId),
    OkTimedOut(DialogId),
    Shutdown,
}

/// Dialog state touched by a response that has not been sent yet.
#[derive(Default)]
struct DialogUndo {
    restore: Vec<Dialog>,
    created: Option<DialogId>,
    ok_job: Option<DialogId>,
}

/// Transaction user adapter. Holds the core weakly because the core owns
/// the transaction manager that owns this adapter.
struct StackUser {
    core: Weak<StackCore>,
}

impl SipStack {
    /// Builds the stack and starts its worker tasks. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: StackConfig,
        transport: Arc<dyn TransportDispatcher>,
        listener: Arc<dyn SipListener>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let core = Arc::new_cyclic(|weak: &Weak<StackCore>| {
            let user = Arc::new(StackUser { core: weak.clone() });
            StackCore {
                transactions: TransactionManager::with_config(
                    transport,
                    user,
                    config.timers,
                    config.limits,
                ),
                dialogs: DialogManager::new(),
                dispatcher: EventDispatcher::spawn(listener, config.delivery),
                router: build_router(&config.router),
                timers: TimerService::new(),
                ok_jobs: DashMap::new(),
                cmd_tx,
                config,
            }
        });
        spawn_command_loop(Arc::downgrade(&core), cmd_rx);
        info!(
            t1_ms = core.config.timers.t1.as_millis() as u64,
            filter = core.config.retransmission_filter,
            "SIP stack started"
        );
        Self { core }
    }

    pub fn config(&self) -> &StackConfig {
        &self.core.config
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.core.transactions
    }

    pub fn dialogs(&self) -> &DialogManager {
        &self.core.dialogs
    }

    /// Entry point for the transport: feeds one parsed message in.
    ///
    /// Returns an error only for requests the transaction layer refused
    /// (malformed, or rejected with 503 because the table is full).
    pub async fn on_message_received(
        &self,
        message: SipMessage,
        ctx: TransportContext,
    ) -> Result<(), StackError> {
        match message {
            SipMessage::Request(request) => {
                self.core.transactions.receive_request(request, ctx).await?;
            }
            SipMessage::Response(response) => {
                self.core.transactions.receive_response(response, ctx).await;
            }
        }
        Ok(())
    }

    /// Sends `request` in a new client transaction.
    ///
    /// A Via with a fresh branch is added when the request has none. Without
    /// `ctx` the router picks the destination.
    pub async fn create_client_transaction(
        &self,
        mut request: Request,
        ctx: Option<TransportContext>,
    ) -> Result<TransactionKey, StackError> {
        self.core.ensure_via(&mut request);
        let ctx = match ctx {
            Some(ctx) => ctx,
            None => self.core.route(&request)?,
        };
        let dialog = outgoing_dialog_id(&request).filter(|id| self.core.dialogs.contains(id));
        let key = self
            .core
            .transactions
            .start_client_transaction(request, ctx)
            .await?;
        if let Some(id) = dialog {
            self.core.dialogs.associate(key.clone(), &id);
        }
        Ok(key)
    }

    /// Handles statefully a request that was delivered without a
    /// transaction.
    pub async fn create_server_transaction(
        &self,
        request: Request,
        ctx: TransportContext,
    ) -> Result<ServerTransactionHandle, StackError> {
        let dialog = self.core.dialogs.find_for_request(&request);
        let handle = self
            .core
            .transactions
            .create_server_transaction(request, ctx)
            .await?;
        if let Some(id) = dialog {
            self.core.dialogs.associate(handle.key().clone(), &id);
        }
        Ok(handle)
    }

    /// Sends a response on a server transaction and keeps dialogs in step.
    ///
    /// Every response but 100 to a request without a To tag gets one,
    /// reused from an earlier provisional when there was one. A 101-299 to a
    /// dialog-creating request creates or advances the dialog, and a 2xx to
    /// INVITE is then retransmitted until its ACK arrives.
    pub async fn send_response(
        &self,
        handle: &ServerTransactionHandle,
        mut response: Response,
    ) -> Result<(), StackError> {
        let core = &self.core;
        let key = handle.key().clone();
        let request = handle
            .request()
            .ok_or_else(|| TransactionError::NotFound(key.clone()))?;
        let code = response.code();
        let creates_dialog = request.to_tag().is_none()
            && core.is_dialog_creating(request.method())
            && (101..300).contains(&code);

        if request.to_tag().is_none() && code > 100 && response.to_tag().is_none() {
            let tag = core
                .dialogs
                .dialogs_for_transaction(&key)
                .first()
                .map(|id| id.local_tag.clone())
                .unwrap_or_else(generate_tag);
            let to = response
                .headers()
                .get("To")
                .map(|to| with_tag(to, &tag))
                .ok_or(MessageError::MissingHeader("To"))?;
            response.headers_mut().set("To", to);
        }

        // Dialog and 2xx bookkeeping go in before the response is sent so an
        // ACK that races back finds them.
        let mut undo = DialogUndo::default();
        let mut ended = Vec::new();
        let dialog = if creates_dialog {
            let id = DialogId::for_uas_response(&response)
                .ok_or(DialogError::NotDialogCreating(code))?;
            match core.dialogs.get(&id) {
                Some(before) => undo.restore.push(before),
                None => undo.created = Some(id),
            }
            Some(core.establish_uas_dialog(&request, &response, &key)?)
        } else {
            let mut found = None;
            if code >= 200 {
                for id in core.dialogs.dialogs_for_transaction(&key) {
                    let terminated = core
                        .dialogs
                        .update(&id, |dialog| {
                            undo.restore.push(dialog.clone());
                            dialog.on_response(&key, &response);
                            dialog.is_terminated()
                        })
                        .unwrap_or(false);
                    if terminated {
                        ended.push(id.clone());
                    }
                    found.get_or_insert(id);
                }
            }
            found.or_else(|| core.dialogs.find_for_request(&request))
        };

        if let (Some(id), true) = (&dialog, response.is_success()) {
            if request.method() == &Method::Invite && !ended.contains(id) {
                let started = request
                    .cseq()
                    .ok_or(MessageError::MissingHeader("CSeq"))
                    .map_err(StackError::from)
                    .and_then(|cseq| {
                        let ctx = core
                            .transactions
                            .transport_context(&key)
                            .ok_or_else(|| TransactionError::NotFound(key.clone()))?;
                        Ok((cseq.number, ctx))
                    });
                match started {
                    Ok((cseq, ctx)) => {
                        core.start_ok_retransmission(id.clone(), cseq, response.clone(), ctx);
                        undo.ok_job = Some(id.clone());
                    }
                    Err(err) => {
                        core.undo_dialogs(undo);
                        return Err(err);
                    }
                }
            }
        }

        if let Err(err) = handle.send_response(response).await {
            warn!(transaction = %key, status = code, %err, "response not sent, dialog changes undone");
            core.undo_dialogs(undo);
            return Err(err.into());
        }
        for id in ended {
            core.end_dialog(&id);
        }
        Ok(())
    }

    /// Builds the next request inside a dialog (not yet sent).
    pub fn create_request(&self, dialog: &DialogId, method: Method) -> Result<Request, StackError> {
        let request = self
            .core
            .dialogs
            .update(dialog, |d| d.create_request(method))
            .ok_or(DialogError::NotFound)??;
        Ok(request)
    }

    /// Sends a request inside a dialog in a new client transaction.
    ///
    /// Missing dialog headers are filled in and the local CSeq advanced. ACK
    /// is not sent this way; see [`SipStack::send_ack`].
    pub async fn send_request_via_dialog(
        &self,
        dialog: &DialogId,
        mut request: Request,
    ) -> Result<TransactionKey, StackError> {
        if request.method() == &Method::Ack {
            return Err(DialogError::InvalidMethod(Method::Ack).into());
        }
        let core = &self.core;
        core.ensure_via(&mut request);
        let key = TransactionKey::from_request(&request, false)
            .ok_or(MessageError::MissingBranch)?;
        let cseq = core
            .dialogs
            .update(dialog, |d| d.prepare_request(&mut request, key.clone()))
            .ok_or(DialogError::NotFound)??;
        let ctx = core.route(&request)?;
        debug!(dialog = %dialog, method = %request.method(), cseq, "sending in-dialog request");
        Ok(core
            .transactions
            .start_client_transaction(request, ctx)
            .await?)
    }

    /// Builds the ACK for the 2xx to the INVITE sent with `cseq`.
    pub fn create_ack(&self, dialog: &DialogId, cseq: u32) -> Result<Request, StackError> {
        let ack = self
            .core
            .dialogs
            .update(dialog, |d| d.create_ack(cseq))
            .ok_or(DialogError::NotFound)??;
        Ok(ack)
    }

    /// Sends an ACK for a 2xx and remembers it so retransmitted 2xx
    /// responses can be answered without the application.
    pub async fn send_ack(&self, dialog: &DialogId, mut ack: Request) -> Result<(), StackError> {
        if ack.method() != &Method::Ack {
            return Err(DialogError::InvalidMethod(ack.method().clone()).into());
        }
        let cseq = ack.cseq().ok_or(MessageError::MissingHeader("CSeq"))?.number;
        self.core.ensure_via(&mut ack);
        self.core
            .dialogs
            .update(dialog, |d| d.record_ack(cseq, ack.clone()))
            .ok_or(DialogError::NotFound)?;
        self.core.send_outside_transaction(ack).await
    }

    /// Builds a CANCEL for the client INVITE transaction `key`.
    pub fn create_cancel(&self, key: &TransactionKey) -> Result<Request, StackError> {
        let invite = self
            .core
            .transactions
            .original_request(key)
            .filter(|_| !key.is_server)
            .ok_or_else(|| TransactionError::NotFound(key.clone()))?;
        Ok(build_cancel(&invite)?)
    }

    /// Sends the pending 2xx of `dialog` once more. Used when the
    /// retransmission filter is off.
    pub async fn retransmit_ok(&self, dialog: &DialogId) -> Result<(), StackError> {
        let (response, ctx) = match self.core.ok_jobs.get(dialog) {
            Some(job) => (job.response.clone(), job.ctx.clone()),
            None => {
                let state = self
                    .core
                    .dialogs
                    .update(dialog, |d| d.state)
                    .ok_or(DialogError::NotFound)?;
                return Err(DialogError::InvalidState(state).into());
            }
        };
        self.core
            .transactions
            .send_direct(&ctx, SipMessage::Response(response))
            .await
            .map_err(|err| StackError::Transport(err.to_string()))
    }

    pub fn dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.core.dialogs.get(id)
    }

    pub fn transaction_state(&self, key: &TransactionKey) -> Option<TransactionState> {
        self.core.transactions.transaction_state(key)
    }

    /// Stops timers, drops all transactions and drains the event queue.
    /// Events queued before the call are still delivered.
    pub async fn shutdown(&self) {
        info!("SIP stack shutting down");
        self.core.ok_jobs.clear();
        self.core.transactions.shutdown();
        let _ = self.core.cmd_tx.send(StackCommand::Shutdown);
        self.core.dispatcher.shutdown();
        self.core.dispatcher.join().await;
    }
}

impl StackCore {
    fn emit(&self, event: SipEvent) {
        // A stopped dispatcher logs the drop itself.
        let _ = self.dispatcher.enqueue(event);
    }

    fn is_dialog_creating(&self, method: &Method) -> bool {
        is_dialog_creating(method, &self.config.dialog_methods)
    }

    fn ensure_via(&self, request: &mut Request) {
        if request.headers().contains("Via") {
            return;
        }
        let via = format!(
            "SIP/2.0/{} {};branch={}",
            self.config.via_transport.as_str(),
            self.config.sent_by,
            generate_branch_id()
        );
        request.headers_mut().push_front("Via", via);
    }

    fn route(&self, request: &Request) -> Result<TransportContext, StackError> {
        self.router
            .next_hops(request)?
            .first()
            .map(|hop| hop.context())
            .ok_or_else(|| StackError::Routing("router returned no hops".into()))
    }

    async fn send_outside_transaction(&self, request: Request) -> Result<(), StackError> {
        let ctx = self.route(&request)?;
        self.transactions
            .send_direct(&ctx, SipMessage::Request(request))
            .await
            .map_err(|err| StackError::Transport(err.to_string()))
    }

    async fn reply(&self, handle: &ServerTransactionHandle, request: &Request, code: u16, reason: &str) {
        let response = match Response::for_request(request, code, reason) {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, status = code, "cannot build local response");
                return;
            }
        };
        if let Err(err) = handle.send_response(response).await {
            warn!(key = %handle.key(), %err, status = code, "local response not sent");
        }
    }

    async fn handle_request(
        &self,
        request: Request,
        transaction: Option<ServerTransactionHandle>,
        ctx: TransportContext,
    ) {
        match request.method() {
            Method::Ack => self.handle_ack(request, ctx),
            Method::Cancel => {
                let dialog = transaction.as_ref().and_then(|handle| {
                    self.dialogs
                        .dialogs_for_transaction(handle.key())
                        .into_iter()
                        .next()
                });
                if transaction.is_none() {
                    debug!(call_id = ?request.call_id(), "delivering CANCEL without transaction");
                }
                self.emit(SipEvent::Request {
                    request,
                    transaction,
                    dialog,
                    ctx,
                });
            }
            _ => self.handle_new_request(request, transaction, ctx).await,
        }
    }

    async fn handle_new_request(
        &self,
        request: Request,
        transaction: Option<ServerTransactionHandle>,
        ctx: TransportContext,
    ) {
        let Some(handle) = transaction else {
            self.emit(SipEvent::Request {
                request,
                transaction: None,
                dialog: None,
                ctx,
            });
            return;
        };
        if request.to_tag().is_none() {
            self.emit(SipEvent::Request {
                request,
                transaction: Some(handle),
                dialog: None,
                ctx,
            });
            return;
        }

        let Some(id) = self.dialogs.find_for_request(&request) else {
            debug!(method = %request.method(), call_id = ?request.call_id(), "request for unknown dialog");
            self.reply(&handle, &request, 481, "Call/Transaction Does Not Exist")
                .await;
            return;
        };

        let key = handle.key().clone();
        let is_bye = request.method() == &Method::Bye;
        let checked = self.dialogs.update(&id, |dialog| -> Result<(), DialogError> {
            if dialog.is_terminated() {
                return Err(DialogError::InvalidState(dialog.state));
            }
            dialog.validate_remote_request(&request)?;
            if is_bye {
                dialog.on_bye(key.clone());
            } else {
                dialog.track_transaction(key.clone());
            }
            Ok(())
        });

        match checked {
            Some(Ok(())) => {
                if is_bye {
                    self.stop_ok_retransmission(&id);
                }
                self.emit(SipEvent::Request {
                    request,
                    transaction: Some(handle),
                    dialog: Some(id),
                    ctx,
                });
            }
            Some(Err(DialogError::OutOfOrder { last, received })) => {
                self.dialogs.metrics().record_out_of_order();
                warn!(dialog = %id, last, received, "out-of-order CSeq, answering 500");
                self.reply(&handle, &request, 500, "Server Internal Error")
                    .await;
            }
            Some(Err(err)) => {
                debug!(dialog = %id, %err, "request for ended dialog");
                self.reply(&handle, &request, 481, "Call/Transaction Does Not Exist")
                    .await;
            }
            None => {
                self.reply(&handle, &request, 481, "Call/Transaction Does Not Exist")
                    .await;
            }
        }
    }

    fn handle_ack(&self, ack: Request, ctx: TransportContext) {
        let Some(id) = self.dialogs.find_for_request(&ack) else {
            warn!(call_id = ?ack.call_id(), "late ACK matches no transaction or dialog, dropped");
            return;
        };
        let first = ack
            .cseq()
            .and_then(|cseq| {
                self.dialogs
                    .update(&id, |dialog| dialog.on_ack_received(cseq.number))
            })
            .unwrap_or(false);
        if first {
            self.stop_ok_retransmission(&id);
        } else if self.config.retransmission_filter {
            debug!(dialog = %id, "duplicate ACK absorbed");
            return;
        }
        self.emit(SipEvent::Request {
            request: ack,
            transaction: None,
            dialog: Some(id),
            ctx,
        });
    }

    async fn handle_response(&self, key: TransactionKey, response: Response) {
        let code = response.code();
        let invite_ok = key.method == Method::Invite && response.is_success();
        let cseq = response.cseq().map(|cseq| cseq.number).unwrap_or_default();
        let mut ended = Vec::new();
        let mut dialog = None;

        let known = DialogId::for_uac_response(&response).filter(|id| self.dialogs.contains(id));
        if let Some(id) = known {
            let (first, terminated) = self
                .dialogs
                .update(&id, |d| {
                    d.track_transaction(key.clone());
                    if invite_ok && !d.record_invite_ok(cseq) {
                        return (false, false);
                    }
                    d.on_response(&key, &response);
                    (true, d.is_terminated())
                })
                .unwrap_or((true, false));
            if !first && self.absorb_ok_retransmission(&id, &response).await {
                return;
            }
            if terminated {
                ended.push(id.clone());
            }
            dialog = Some(id);
        } else if self.is_dialog_creating(&key.method)
            && (101..300).contains(&code)
            && response.to_tag().is_some()
        {
            dialog = self.establish_uac_dialog(&key, &response, invite_ok.then_some(cseq));
        }

        if code >= 300 {
            for id in self.dialogs.dialogs_for_transaction(&key) {
                if dialog.as_ref() == Some(&id) {
                    continue;
                }
                let terminated = self
                    .dialogs
                    .update(&id, |d| {
                        d.on_response(&key, &response);
                        d.is_terminated()
                    })
                    .unwrap_or(false);
                if terminated {
                    ended.push(id.clone());
                }
                dialog.get_or_insert(id);
            }
        }

        self.emit(SipEvent::Response {
            response,
            transaction: Some(key),
            dialog,
        });
        for id in ended {
            self.end_dialog(&id);
        }
    }

    fn establish_uac_dialog(
        &self,
        key: &TransactionKey,
        response: &Response,
        invite_ok: Option<u32>,
    ) -> Option<DialogId> {
        let Some(request) = self.transactions.original_request(key) else {
            warn!(key = %key, "dialog-creating response without its request");
            return None;
        };
        match Dialog::new_uac(&request, response, key.clone()) {
            Ok(mut dialog) => {
                if let Some(cseq) = invite_ok {
                    dialog.record_invite_ok(cseq);
                }
                let id = dialog.id.clone();
                self.dialogs.insert(dialog);
                Some(id)
            }
            Err(err) => {
                warn!(key = %key, %err, "cannot create UAC dialog");
                None
            }
        }
    }

    fn establish_uas_dialog(
        &self,
        request: &Request,
        response: &Response,
        key: &TransactionKey,
    ) -> Result<DialogId, StackError> {
        let id = DialogId::for_uas_response(response)
            .ok_or(DialogError::NotDialogCreating(response.code()))?;
        let updated = self.dialogs.update(&id, |dialog| {
            dialog.on_response(key, response);
        });
        if updated.is_none() {
            self.dialogs
                .insert(Dialog::new_uas(request, response, key.clone())?);
        }
        Ok(id)
    }

    /// Handles a 2xx to INVITE already seen for this dialog. Returns `true`
    /// when the stack dealt with it and the application must not see it.
    async fn absorb_ok_retransmission(&self, id: &DialogId, response: &Response) -> bool {
        if !self.config.retransmission_filter {
            return false;
        }
        let ack = self
            .dialogs
            .update(id, |dialog| dialog.ack_for(response).cloned())
            .flatten();
        match ack {
            Some(ack) => {
                debug!(dialog = %id, "2xx retransmission, resending ACK");
                if let Err(err) = self.send_outside_transaction(ack).await {
                    warn!(dialog = %id, %err, "ACK resend failed");
                }
            }
            None => debug!(dialog = %id, "2xx retransmission absorbed before ACK was sent"),
        }
        true
    }

    async fn handle_stray_response(&self, response: Response, ctx: TransportContext) {
        let invite_ok = response.is_success()
            && response
                .cseq()
                .map_or(false, |cseq| cseq.method == Method::Invite);
        if !invite_ok {
            debug!(status = response.code(), peer = %ctx.peer, "stray response dropped");
            return;
        }
        let cseq = response.cseq().map(|cseq| cseq.number).unwrap_or_default();
        let dialog = DialogId::for_uac_response(&response).filter(|id| self.dialogs.contains(id));
        if let Some(id) = &dialog {
            let first = self
                .dialogs
                .update(id, |d| d.record_invite_ok(cseq))
                .unwrap_or(true);
            if !first && self.absorb_ok_retransmission(id, &response).await {
                return;
            }
        }
        self.emit(SipEvent::Response {
            response,
            transaction: None,
            dialog,
        });
    }

    async fn handle_terminated(&self, key: TransactionKey) {
        let mut ended = Vec::new();
        for id in self.dialogs.dialogs_for_transaction(&key) {
            let terminated = self
                .dialogs
                .update(&id, |dialog| {
                    let bye_done = dialog.on_transaction_terminated(&key);
                    if dialog.state == DialogState::Early && dialog.creating_transaction == key {
                        dialog.terminate();
                        return true;
                    }
                    bye_done
                })
                .unwrap_or(false);
            if terminated {
                ended.push(id);
            }
        }
        self.dialogs.forget_transaction(&key);
        self.emit(SipEvent::TransactionTerminated { transaction: key });
        for id in ended {
            self.end_dialog(&id);
        }
    }

    fn undo_dialogs(&self, undo: DialogUndo) {
        if let Some(id) = &undo.ok_job {
            self.stop_ok_retransmission(id);
        }
        if let Some(id) = &undo.created {
            self.dialogs.remove(id);
        }
        for before in undo.restore {
            let id = before.id.clone();
            self.dialogs.update(&id, |dialog| *dialog = before);
        }
    }

    fn end_dialog(&self, id: &DialogId) {
        self.stop_ok_retransmission(id);
        if self.dialogs.remove(id).is_some() {
            debug!(dialog = %id, "dialog terminated");
            self.emit(SipEvent::DialogTerminated { dialog: id.clone() });
        }
    }

    fn start_ok_retransmission(
        &self,
        id: DialogId,
        cseq: u32,
        response: Response,
        ctx: TransportContext,
    ) {
        self.dialogs
            .update(&id, |dialog| dialog.set_pending_ok(cseq, response.clone()));
        let t1 = self.config.timers.t1;
        let retransmit = (!ctx.transport.is_reliable()).then(|| {
            let tx = self.cmd_tx.clone();
            let dialog = id.clone();
            self.timers
                .schedule_backoff(t1, Some(self.config.timers.t2), move || {
                    let _ = tx.send(StackCommand::RetransmitOk(dialog.clone()));
                })
        });
        let deadline = {
            let tx = self.cmd_tx.clone();
            let dialog = id.clone();
            self.timers.schedule_once(t1.saturating_mul(64), move || {
                let _ = tx.send(StackCommand::OkTimedOut(dialog));
            })
        };
        debug!(dialog = %id, cseq, "waiting for ACK to 2xx");
        self.ok_jobs.insert(
            id,
            OkRetransmission {
                response,
                ctx,
                _retransmit: retransmit,
                _deadline: deadline,
            },
        );
    }

    fn stop_ok_retransmission(&self, id: &DialogId) {
        if self.ok_jobs.remove(id).is_some() {
            debug!(dialog = %id, "2xx retransmission stopped");
        }
    }

    async fn on_ok_timer(&self, id: &DialogId) {
        let job = self
            .ok_jobs
            .get(id)
            .map(|job| (job.response.clone(), job.ctx.clone()));
        let Some((response, ctx)) = job else {
            return;
        };
        if !self.config.retransmission_filter {
            self.emit(SipEvent::Timeout {
                kind: TimeoutKind::Retransmit,
                transaction: None,
                dialog: Some(id.clone()),
            });
            return;
        }
        debug!(dialog = %id, "retransmitting 2xx");
        if let Err(err) = self
            .transactions
            .send_direct(&ctx, SipMessage::Response(response))
            .await
        {
            warn!(dialog = %id, %err, "2xx retransmission failed");
        }
    }

    fn on_ok_deadline(&self, id: &DialogId) {
        if self.ok_jobs.remove(id).is_none() {
            return;
        }
        warn!(dialog = %id, "no ACK for 2xx within 64*T1, terminating dialog");
        self.dialogs.update(id, |dialog| dialog.terminate());
        self.emit(SipEvent::Timeout {
            kind: TimeoutKind::Transaction,
            transaction: None,
            dialog: Some(id.clone()),
        });
        self.end_dialog(id);
    }
}

fn spawn_command_loop(core: Weak<StackCore>, mut rx: mpsc::UnboundedReceiver<StackCommand>) {
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            let Some(stack) = core.upgrade() else {
                break;
            };
            match cmd {
                StackCommand::RetransmitOk(id) => stack.on_ok_timer(&id).await,
                StackCommand::OkTimedOut(id) => stack.on_ok_deadline(&id),
                StackCommand::Shutdown => break,
            }
        }
        debug!("stack command loop stopped");
    });
}

#[async_trait]
impl TransactionUser for StackUser {
    async fn on_request(
        &self,
        request: Request,
        transaction: Option<ServerTransactionHandle>,
        ctx: TransportContext,
    ) {
        if let Some(core) = self.core.upgrade() {
            core.handle_request(request, transaction, ctx).await;
        }
    }

    async fn on_response(&self, key: &TransactionKey, response: Response) {
        if let Some(core) = self.core.upgrade() {
            core.handle_response(key.clone(), response).await;
        }
    }

    async fn on_stray_response(&self, response: Response, ctx: TransportContext) {
        if let Some(core) = self.core.upgrade() {
            core.handle_stray_response(response, ctx).await;
        }
    }

    async fn on_timeout(&self, key: &TransactionKey, kind: TimeoutKind) {
        if let Some(core) = self.core.upgrade() {
            core.emit(SipEvent::Timeout {
                kind,
                transaction: Some(key.clone()),
                dialog: None,
            });
        }
    }

    async fn on_transport_error(&self, key: &TransactionKey, reason: &str) {
        if let Some(core) = self.core.upgrade() {
            core.emit(SipEvent::TransactionError {
                transaction: key.clone(),
                reason: reason.to_string(),
            });
        }
    }

    async fn on_terminated(&self, key: &TransactionKey) {
        if let Some(core) = self.core.upgrade() {
            core.handle_terminated(key.clone()).await;
        }
    }
}

/// Dialog an outgoing request belongs to, judged by its tags.
fn outgoing_dialog_id(request: &Request) -> Option<DialogId> {
    Some(DialogId::new(
        request.call_id()?,
        request.from_tag()?,
        request.to_tag()?,
    ))
}

fn generate_tag() -> SmolStr {
    let tag: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    SmolStr::new(tag)
}
