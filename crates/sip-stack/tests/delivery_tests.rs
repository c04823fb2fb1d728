// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! What the application does and does not get to see: duplicates, late
//! messages, out-of-order requests, overload and shutdown.

mod common;

use std::time::Duration;

use common::{udp, wait, Harness};
use sip_core::{HeaderAccess, Method};
use sip_dialog::DialogId;
use sip_stack::{StackConfig, StackError};
use sip_testkit::{build_in_dialog, build_invite, build_options, build_request, build_response, ALICE_TAG};
use sip_transaction::{TransactionError, TransactionLimits};

const URI: &str = "sip:bob@192.0.2.20";

/// Receives an INVITE, answers 200 and ACKs it. Returns the dialog id.
async fn answered_call(h: &Harness, call_id: &str) -> DialogId {
    let invite = build_invite(URI, &format!("z9hG4bK{call_id}"), call_id);
    h.receive(invite.clone()).await;
    let handle = h.listener.requests().await[0].1.clone().unwrap();
    h.stack
        .send_response(&handle, build_response(&invite, 200, "OK", None))
        .await
        .unwrap();
    let tag = h.transport.responses(200).await[0].to_tag().unwrap();
    h.receive(build_in_dialog(
        Method::Ack,
        URI,
        &format!("z9hG4bK{call_id}ack"),
        call_id,
        1,
        ALICE_TAG,
        &tag,
    ))
    .await;
    h.listener.clear().await;
    DialogId::new(call_id, tag, ALICE_TAG)
}

#[tokio::test(start_paused = true)]
async fn retransmitted_request_is_delivered_once() {
    let h = Harness::new(StackConfig::default());
    let invite = build_invite(URI, "z9hG4bKonce", "once-1");
    for _ in 0..3 {
        h.receive(invite.clone()).await;
    }
    assert_eq!(h.listener.requests().await.len(), 1);

    wait(Duration::from_millis(250)).await;
    h.receive(invite).await;
    // The copy arriving after the 100 Trying gets the 100 again.
    assert_eq!(h.transport.responses(100).await.len(), 2);
    assert_eq!(h.listener.requests().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn nothing_arrives_for_a_terminated_transaction() {
    let h = Harness::to_peer();
    let options = build_options(URI);
    h.stack
        .create_client_transaction(options.clone(), None)
        .await
        .unwrap();

    // Timer F.
    wait(Duration::from_secs(33)).await;
    assert_eq!(h.listener.kinds().await, vec!["timeout", "transaction-terminated"]);

    h.receive(build_response(&options, 200, "OK", Some("late"))).await;
    assert_eq!(h.listener.kinds().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn lower_cseq_is_refused_with_500() {
    let h = Harness::new(StackConfig::default());
    let id = answered_call(&h, "order-1").await;

    h.receive(build_in_dialog(
        Method::Info,
        URI,
        "z9hG4bKinfo5",
        "order-1",
        5,
        ALICE_TAG,
        &id.local_tag,
    ))
    .await;
    h.receive(build_in_dialog(
        Method::Info,
        URI,
        "z9hG4bKinfo3",
        "order-1",
        3,
        ALICE_TAG,
        &id.local_tag,
    ))
    .await;

    let delivered = h.listener.requests().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0.cseq().unwrap().number, 5);
    assert_eq!(delivered[0].2, Some(id.clone()));
    assert_eq!(h.transport.responses(500).await.len(), 1);
    assert_eq!(h.stack.dialogs().metrics().snapshot().out_of_order, 1);
    assert_eq!(h.stack.dialog(&id).unwrap().remote_cseq, Some(5));
}

#[tokio::test(start_paused = true)]
async fn unknown_dialog_is_refused_with_481() {
    let h = Harness::new(StackConfig::default());
    h.receive(build_in_dialog(
        Method::Bye,
        URI,
        "z9hG4bKghost",
        "ghost-1",
        2,
        ALICE_TAG,
        "nobody",
    ))
    .await;

    assert!(h.listener.requests().await.is_empty());
    assert_eq!(h.transport.responses(481).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_table_answers_503() {
    let h = Harness::new(StackConfig::default().with_limits(TransactionLimits::new(1, 10)));
    h.receive(build_invite(URI, "z9hG4bKfirst", "full-1")).await;

    let second = build_request(Method::Options, URI, "z9hG4bKsecond", "full-2", 1);
    let result = h.stack.on_message_received(second.into(), udp()).await;
    assert!(matches!(
        result,
        Err(StackError::Transaction(TransactionError::ResourcesExhausted { limit: 1 }))
    ));
    assert_eq!(h.transport.responses(503).await.len(), 1);
    assert_eq!(h.listener.requests().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_delivers_what_was_queued() {
    let h = Harness::new(StackConfig::default());
    for n in 0..3 {
        let options = build_request(Method::Options, URI, &format!("z9hG4bKdrain{n}"), "drain", n + 1);
        h.stack
            .on_message_received(options.into(), udp())
            .await
            .unwrap();
    }
    h.stack.shutdown().await;

    assert_eq!(h.listener.requests().await.len(), 3);
    assert_eq!(h.stack.transactions().server_count(), 0);
    // Timers were dropped with their transactions.
    wait(Duration::from_secs(40)).await;
    assert_eq!(h.listener.kinds().await, vec!["request", "request", "request"]);
}

#[tokio::test(start_paused = true)]
async fn unmatched_cancel_can_be_answered_statefully() {
    let h = Harness::new(StackConfig::default());
    let cancel = sip_transaction::build_cancel(&build_invite(URI, "z9hG4bKlost", "lost-1")).unwrap();
    h.receive(cancel.clone()).await;

    let (delivered, transaction, dialog) = h.listener.requests().await.remove(0);
    assert_eq!(delivered.method(), &Method::Cancel);
    assert!(transaction.is_none());
    assert!(dialog.is_none());

    let handle = h.stack.create_server_transaction(delivered, udp()).await.unwrap();
    h.stack
        .send_response(&handle, build_response(&cancel, 481, "Call/Transaction Does Not Exist", None))
        .await
        .unwrap();
    assert_eq!(h.transport.responses(481).await.len(), 1);
    // The request is not delivered a second time.
    assert_eq!(h.listener.requests().await.len(), 1);
}
