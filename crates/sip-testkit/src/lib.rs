// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Request and response builders for tests.
//!
//! Every builder produces a message that passes
//! [`Request::validate_transactional`], so it can be fed straight into the
//! transaction manager or the stack.
//!
//! # Example
//! ```
//! use sip_testkit::{build_invite, build_response};
//! let invite = build_invite("sip:bob@example.com", "z9hG4bKtest", "call-1");
//! let ringing = build_response(&invite, 180, "Ringing", Some("uas-tag"));
//! assert_eq!(ringing.code(), 180);
//! ```

use bytes::Bytes;
use sip_core::{with_tag, Headers, Method, Request, RequestLine, Response, SipUri};
use smol_str::SmolStr;

pub const CLIENT_VIA_HOST: &str = "client.example.com:5060";
pub const ALICE: &str = "<sip:alice@example.com>";
pub const BOB: &str = "<sip:bob@example.com>";
pub const ALICE_TAG: &str = "1234";

/// Builds an out-of-dialog request from Alice to Bob.
pub fn build_request(method: Method, uri: &str, branch: &str, call_id: &str, cseq: u32) -> Request {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        format!("SIP/2.0/UDP {};branch={}", CLIENT_VIA_HOST, branch),
    );
    headers.push("Max-Forwards", "70");
    headers.push("From", format!("{};tag={}", ALICE, ALICE_TAG));
    headers.push("To", BOB);
    headers.push("Call-ID", call_id);
    headers.push("CSeq", format!("{} {}", cseq, method));
    if matches!(method, Method::Invite | Method::Subscribe | Method::Refer) {
        headers.push("Contact", "<sip:alice@client.example.com:5060>");
    }
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(method, SipUri::parse(uri).unwrap()),
        headers,
        Bytes::new(),
    )
    .unwrap()
}

/// Constructs a minimal OPTIONS request for the provided URI string.
pub fn build_options(uri: &str) -> Request {
    build_request(Method::Options, uri, "z9hG4bKtest", "test-callid@example.com", 1)
}

/// Constructs a minimal INVITE request for the provided URI string.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Request {
    build_request(Method::Invite, uri, branch, call_id, 1)
}

/// Builds a request inside an established dialog, with both tags set.
///
/// `from_tag` belongs to the sender and `to_tag` to the receiver.
pub fn build_in_dialog(
    method: Method,
    uri: &str,
    branch: &str,
    call_id: &str,
    cseq: u32,
    from_tag: &str,
    to_tag: &str,
) -> Request {
    let mut request = build_request(method, uri, branch, call_id, cseq);
    request
        .headers_mut()
        .set("From", with_tag(ALICE, from_tag));
    request.headers_mut().set("To", with_tag(BOB, to_tag));
    request
}

/// Builds a request from an RFC 2543 peer: the Via carries no branch.
pub fn build_legacy_request(method: Method, uri: &str, call_id: &str, cseq: u32) -> Request {
    let mut request = build_request(method, uri, "unused", call_id, cseq);
    request
        .headers_mut()
        .set("Via", format!("SIP/2.0/UDP {}", CLIENT_VIA_HOST));
    request
}

/// Builds a response to `request`, tagging the To header when `to_tag` is given.
pub fn build_response(request: &Request, code: u16, reason: &str, to_tag: Option<&str>) -> Response {
    let mut response = Response::for_request(request, code, reason).unwrap();
    if let Some(tag) = to_tag {
        let to = request
            .headers()
            .get("To")
            .cloned()
            .unwrap_or_else(|| SmolStr::new(BOB));
        response.headers_mut().set("To", with_tag(&to, tag));
    }
    if code / 100 == 2 && request.method() == &Method::Invite {
        response
            .headers_mut()
            .push("Contact", "<sip:bob@server.example.com:5060>");
    }
    response
}

/// The three messages of a basic call setup: INVITE, its 200 OK and the
/// 2xx ACK (which carries its own branch).
pub fn scenario_invite_ok_ack(target: &str, call_id: &str) -> (Request, Response, Request) {
    let invite = build_invite(target, "z9hG4bKinvite", call_id);
    let ok = build_response(&invite, 200, "OK", Some("5678"));
    let ack = build_in_dialog(
        Method::Ack,
        "sip:bob@server.example.com:5060",
        "z9hG4bKack",
        call_id,
        1,
        ALICE_TAG,
        "5678",
    );
    (invite, ok, ack)
}
