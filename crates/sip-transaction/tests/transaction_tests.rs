// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end transaction flows through `TransactionManager` on paused time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sip_core::{Method, Request, Response, SipMessage};
use sip_testkit::{build_invite, build_legacy_request, build_options, build_request, build_response};
use sip_transaction::{
    build_cancel, ServerTransactionHandle, TimeoutKind, TransactionKey, TransactionManager,
    TransactionState, TransactionUser, TransportContext, TransportDispatcher, TransportKind,
};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Request(Method, bool),
    Response(u16),
    Stray(u16),
    Timeout(TimeoutKind),
    TransportError,
    Terminated(Method),
}

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<(Duration, SipMessage)>>,
    fail: AtomicBool,
    start: Mutex<Option<Instant>>,
}

impl RecordingDispatcher {
    async fn requests(&self, method: Method) -> Vec<Duration> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(_, m)| m.as_request().map(|r| r.method() == &method).unwrap_or(false))
            .map(|(at, _)| *at)
            .collect()
    }

    async fn responses(&self, code: u16) -> Vec<Duration> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(_, m)| m.as_response().map(|r| r.code() == code).unwrap_or(false))
            .map(|(at, _)| *at)
            .collect()
    }
}

#[async_trait]
impl TransportDispatcher for RecordingDispatcher {
    async fn send_message(&self, _ctx: &TransportContext, message: &SipMessage) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let start = *self.start.lock().await.get_or_insert_with(Instant::now);
        self.sent.lock().await.push((start.elapsed(), message.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingTu {
    seen: Mutex<Vec<Seen>>,
    handles: Mutex<Vec<(Request, Option<ServerTransactionHandle>)>>,
}

impl RecordingTu {
    async fn seen(&self) -> Vec<Seen> {
        self.seen.lock().await.clone()
    }

    async fn last_handle(&self) -> ServerTransactionHandle {
        self.handles
            .lock()
            .await
            .iter()
            .rev()
            .find_map(|(_, h)| h.clone())
            .expect("a delivered server transaction")
    }
}

#[async_trait]
impl TransactionUser for RecordingTu {
    async fn on_request(
        &self,
        request: Request,
        transaction: Option<ServerTransactionHandle>,
        _ctx: TransportContext,
    ) {
        self.seen
            .lock()
            .await
            .push(Seen::Request(request.method().clone(), transaction.is_some()));
        self.handles.lock().await.push((request, transaction));
    }

    async fn on_response(&self, _key: &TransactionKey, response: Response) {
        self.seen.lock().await.push(Seen::Response(response.code()));
    }

    async fn on_stray_response(&self, response: Response, _ctx: TransportContext) {
        self.seen.lock().await.push(Seen::Stray(response.code()));
    }

    async fn on_timeout(&self, _key: &TransactionKey, kind: TimeoutKind) {
        self.seen.lock().await.push(Seen::Timeout(kind));
    }

    async fn on_transport_error(&self, _key: &TransactionKey, _reason: &str) {
        self.seen.lock().await.push(Seen::TransportError);
    }

    async fn on_terminated(&self, key: &TransactionKey) {
        self.seen.lock().await.push(Seen::Terminated(key.method.clone()));
    }
}

fn setup() -> (TransactionManager, Arc<RecordingDispatcher>, Arc<RecordingTu>) {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let tu = Arc::new(RecordingTu::default());
    let manager = TransactionManager::new(dispatcher.clone(), tu.clone());
    (manager, dispatcher, tu)
}

fn udp() -> TransportContext {
    TransportContext::udp("192.0.2.1:5060".parse().unwrap())
}

fn tcp() -> TransportContext {
    TransportContext::new(TransportKind::Tcp, "192.0.2.1:5060".parse().unwrap())
}

fn ms(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_millis).collect()
}

#[tokio::test(start_paused = true)]
async fn client_invite_without_answer_times_out_after_timer_b() {
    let (manager, dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKnoanswer", "b-call");

    let key = manager.start_client_transaction(invite, udp()).await.unwrap();
    assert_eq!(manager.transaction_state(&key), Some(TransactionState::Calling));

    sleep(Duration::from_millis(32_010)).await;

    assert_eq!(
        dispatcher.requests(Method::Invite).await,
        ms(&[0, 500, 1_500, 3_500, 7_500, 15_500, 31_500])
    );
    assert_eq!(
        tu.seen().await,
        vec![
            Seen::Timeout(TimeoutKind::Transaction),
            Seen::Terminated(Method::Invite)
        ]
    );
    assert_eq!(manager.transaction_state(&key), None);
    assert_eq!(manager.client_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn client_non_invite_backs_off_to_t2_then_times_out() {
    let (manager, dispatcher, tu) = setup();
    let options = build_options("sip:bob@example.com");

    manager.start_client_transaction(options, udp()).await.unwrap();
    sleep(Duration::from_millis(32_010)).await;

    assert_eq!(
        dispatcher.requests(Method::Options).await,
        ms(&[
            0, 500, 1_500, 3_500, 7_500, 11_500, 15_500, 19_500, 23_500, 27_500, 31_500
        ])
    );
    assert_eq!(
        tu.seen().await,
        vec![
            Seen::Timeout(TimeoutKind::Transaction),
            Seen::Terminated(Method::Options)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn provisional_stops_invite_retransmission() {
    let (manager, dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKringing", "ring-call");
    let key = manager
        .start_client_transaction(invite.clone(), udp())
        .await
        .unwrap();

    sleep(Duration::from_millis(600)).await;
    manager
        .receive_response(build_response(&invite, 180, "Ringing", Some("b")), udp())
        .await;
    // Past 64*T1: Timer B no longer runs once the call is ringing.
    sleep(Duration::from_secs(40)).await;

    assert_eq!(dispatcher.requests(Method::Invite).await, ms(&[0, 500]));
    assert_eq!(manager.transaction_state(&key), Some(TransactionState::Proceeding));
    assert_eq!(tu.seen().await, vec![Seen::Response(180)]);
}

#[tokio::test(start_paused = true)]
async fn trying_response_moves_non_invite_retransmission_to_t2() {
    let (manager, dispatcher, tu) = setup();
    let options = build_options("sip:bob@example.com");
    manager
        .start_client_transaction(options.clone(), udp())
        .await
        .unwrap();

    sleep(Duration::from_millis(600)).await;
    manager
        .receive_response(build_response(&options, 100, "Trying", None), udp())
        .await;
    sleep(Duration::from_secs(9)).await;

    assert_eq!(
        dispatcher.requests(Method::Options).await,
        ms(&[0, 500, 4_600, 8_600])
    );
    assert_eq!(tu.seen().await, vec![Seen::Response(100)]);
}

#[tokio::test(start_paused = true)]
async fn client_invite_failure_is_acked_and_retransmissions_reack() {
    let (manager, dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKbusy", "busy-call");
    let key = manager
        .start_client_transaction(invite.clone(), udp())
        .await
        .unwrap();

    let busy = build_response(&invite, 486, "Busy Here", Some("b"));
    manager.receive_response(busy.clone(), udp()).await;
    manager.receive_response(busy, udp()).await;

    assert_eq!(dispatcher.requests(Method::Ack).await.len(), 2);
    assert_eq!(tu.seen().await, vec![Seen::Response(486)]);
    assert_eq!(manager.transaction_state(&key), Some(TransactionState::Completed));

    sleep(Duration::from_millis(32_010)).await;
    assert_eq!(manager.transaction_state(&key), None);
    assert_eq!(
        tu.seen().await,
        vec![Seen::Response(486), Seen::Terminated(Method::Invite)]
    );
}

#[tokio::test(start_paused = true)]
async fn client_invite_2xx_lingers_then_goes_stray() {
    let (manager, _dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKok", "ok-call");
    let key = manager
        .start_client_transaction(invite.clone(), udp())
        .await
        .unwrap();

    let ok = build_response(&invite, 200, "OK", Some("b"));
    manager.receive_response(ok.clone(), udp()).await;
    manager.receive_response(ok.clone(), udp()).await;
    assert_eq!(manager.transaction_state(&key), Some(TransactionState::Terminated));

    sleep(Duration::from_secs(2)).await;
    manager.receive_response(ok, udp()).await;

    assert_eq!(
        tu.seen().await,
        vec![
            Seen::Response(200),
            Seen::Response(200),
            Seen::Terminated(Method::Invite),
            Seen::Stray(200)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn server_non_invite_absorbs_retransmissions() {
    let (manager, dispatcher, tu) = setup();
    let options = build_options("sip:bob@example.com");

    manager.receive_request(options.clone(), udp()).await.unwrap();
    let handle = tu.last_handle().await;
    handle
        .send_response(build_response(&options, 200, "OK", Some("b")))
        .await
        .unwrap();

    sleep(Duration::from_secs(1)).await;
    manager.receive_request(options.clone(), udp()).await.unwrap();

    assert_eq!(tu.seen().await, vec![Seen::Request(Method::Options, true)]);
    assert_eq!(dispatcher.responses(200).await, ms(&[0, 1_000]));
    assert_eq!(handle.state(), Some(TransactionState::Completed));

    // Timer J (64*T1) purges the record.
    sleep(Duration::from_secs(32)).await;
    assert_eq!(handle.state(), None);
    assert_eq!(
        tu.seen().await,
        vec![
            Seen::Request(Method::Options, true),
            Seen::Terminated(Method::Options)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn server_non_invite_over_tcp_terminates_on_final_response() {
    let (manager, _dispatcher, tu) = setup();
    let options = build_options("sip:bob@example.com");

    manager.receive_request(options.clone(), tcp()).await.unwrap();
    let handle = tu.last_handle().await;
    handle
        .send_response(build_response(&options, 200, "OK", None))
        .await
        .unwrap();

    assert_eq!(handle.state(), None);
    assert_eq!(manager.server_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn server_invite_sends_trying_and_retransmits_failure_until_ack() {
    let (manager, dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKsrv", "srv-call");

    manager.receive_request(invite.clone(), udp()).await.unwrap();
    sleep(Duration::from_millis(250)).await;
    assert_eq!(dispatcher.responses(100).await.len(), 1);

    let handle = tu.last_handle().await;
    handle
        .send_response(build_response(&invite, 486, "Busy Here", Some("b")))
        .await
        .unwrap();

    // Timer G: 500ms, 1s, 2s
    sleep(Duration::from_millis(3_600)).await;
    assert_eq!(dispatcher.responses(486).await.len(), 4);

    let mut ack = build_request(Method::Ack, "sip:bob@example.com", "z9hG4bKsrv", "srv-call", 1);
    ack.headers_mut()
        .set("To", "<sip:bob@example.com>;tag=b");
    manager.receive_request(ack, udp()).await.unwrap();
    assert_eq!(handle.state(), Some(TransactionState::Confirmed));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(dispatcher.responses(486).await.len(), 4);
    assert_eq!(handle.state(), None);
    assert_eq!(
        tu.seen().await,
        vec![
            Seen::Request(Method::Invite, true),
            Seen::Terminated(Method::Invite)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn server_invite_without_ack_times_out_after_timer_h() {
    let (manager, _dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKnoack", "noack-call");

    manager.receive_request(invite.clone(), udp()).await.unwrap();
    tu.last_handle()
        .await
        .send_response(build_response(&invite, 404, "Not Found", Some("b")))
        .await
        .unwrap();

    sleep(Duration::from_millis(32_010)).await;
    assert_eq!(
        tu.seen().await,
        vec![
            Seen::Request(Method::Invite, true),
            Seen::Timeout(TimeoutKind::Transaction),
            Seen::Terminated(Method::Invite)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn server_invite_2xx_record_absorbs_duplicates_and_passes_ack_up() {
    let (manager, dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKans", "ans-call");

    manager.receive_request(invite.clone(), udp()).await.unwrap();
    let handle = tu.last_handle().await;
    handle
        .send_response(build_response(&invite, 200, "OK", Some("b")))
        .await
        .unwrap();
    assert_eq!(handle.state(), Some(TransactionState::Terminated));

    manager.receive_request(invite.clone(), udp()).await.unwrap();
    let ack = build_request(Method::Ack, "sip:bob@example.com", "z9hG4bKack2xx", "ans-call", 1);
    manager.receive_request(ack, udp()).await.unwrap();

    assert_eq!(dispatcher.responses(200).await.len(), 1);
    assert_eq!(
        tu.seen().await,
        vec![
            Seen::Request(Method::Invite, true),
            Seen::Request(Method::Ack, false)
        ]
    );

    sleep(Duration::from_secs(2)).await;
    assert_eq!(handle.state(), None);
}

#[tokio::test(start_paused = true)]
async fn cancel_reaches_tu_with_invite_handle() {
    let (manager, dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKcxl", "cxl-call");

    manager.receive_request(invite.clone(), udp()).await.unwrap();
    let cancel = build_cancel(&invite).unwrap();
    manager.receive_request(cancel.clone(), udp()).await.unwrap();

    assert_eq!(dispatcher.responses(200).await.len(), 1);
    assert_eq!(
        tu.seen().await,
        vec![
            Seen::Request(Method::Invite, true),
            Seen::Request(Method::Cancel, true)
        ]
    );
    let handle = tu.last_handle().await;
    assert_eq!(handle.key().method, Method::Invite);
    handle
        .send_response(build_response(&invite, 487, "Request Terminated", Some("b")))
        .await
        .unwrap();
    assert_eq!(dispatcher.responses(487).await.len(), 1);

    // A retransmitted CANCEL is answered again but not delivered.
    manager.receive_request(cancel, udp()).await.unwrap();
    assert_eq!(dispatcher.responses(200).await.len(), 2);
    assert_eq!(tu.seen().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_final_response_leaves_invite_alone() {
    let (manager, dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKlate", "late-call");

    manager.receive_request(invite.clone(), udp()).await.unwrap();
    let handle = tu.last_handle().await;
    handle
        .send_response(build_response(&invite, 486, "Busy Here", Some("b")))
        .await
        .unwrap();

    manager
        .receive_request(build_cancel(&invite).unwrap(), udp())
        .await
        .unwrap();

    assert_eq!(dispatcher.responses(200).await.len(), 1);
    assert_eq!(handle.state(), Some(TransactionState::Completed));
    assert_eq!(tu.seen().await, vec![Seen::Request(Method::Invite, true)]);
}

#[tokio::test(start_paused = true)]
async fn unmatched_cancel_is_delivered_without_transaction() {
    let (manager, dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKghost", "ghost-call");

    let cancel = build_cancel(&invite).unwrap();
    assert!(manager.find_cancel_transaction(&cancel).is_none());
    manager.receive_request(cancel, udp()).await.unwrap();

    assert!(dispatcher.sent.lock().await.is_empty());
    assert_eq!(tu.seen().await, vec![Seen::Request(Method::Cancel, false)]);
    assert_eq!(manager.server_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn legacy_requests_match_without_branch() {
    let (manager, _dispatcher, tu) = setup();
    let request = build_legacy_request(Method::Options, "sip:bob@example.com", "legacy", 4);

    manager.receive_request(request.clone(), udp()).await.unwrap();
    manager.receive_request(request.clone(), udp()).await.unwrap();

    assert_eq!(tu.seen().await, vec![Seen::Request(Method::Options, true)]);
    let key = manager
        .find_transaction(&SipMessage::Request(request), true)
        .expect("legacy transaction");
    assert!(key.branch().is_none());
}

#[tokio::test(start_paused = true)]
async fn client_start_requires_rfc3261_branch() {
    let (manager, _dispatcher, _tu) = setup();
    let request = build_legacy_request(Method::Options, "sip:bob@example.com", "nobranch", 1);
    assert!(manager.start_client_transaction(request, udp()).await.is_err());
    assert_eq!(manager.client_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_terminates_client_transaction() {
    let (manager, dispatcher, tu) = setup();
    dispatcher.fail.store(true, Ordering::SeqCst);

    let options = build_options("sip:bob@example.com");
    let key = manager.start_client_transaction(options, tcp()).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(
        tu.seen().await,
        vec![Seen::TransportError, Seen::Terminated(Method::Options)]
    );
    assert!(!manager.remove_transaction(&key));
}

#[tokio::test(start_paused = true)]
async fn duplicate_client_branch_is_rejected() {
    let (manager, _dispatcher, _tu) = setup();
    let options = build_options("sip:bob@example.com");
    manager
        .start_client_transaction(options.clone(), udp())
        .await
        .unwrap();
    let err = manager.start_client_transaction(options, udp()).await.unwrap_err();
    assert!(matches!(
        err,
        sip_transaction::TransactionError::DuplicateTransaction(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn removed_transaction_ignores_its_pending_timers() {
    let (manager, dispatcher, tu) = setup();
    let invite = build_invite("sip:bob@example.com", "z9hG4bKremoved", "rm-call");
    let key = manager.start_client_transaction(invite, udp()).await.unwrap();

    assert!(manager.remove_transaction(&key));
    sleep(Duration::from_secs(40)).await;

    assert_eq!(dispatcher.requests(Method::Invite).await.len(), 1);
    assert!(tu.seen().await.is_empty());
}
