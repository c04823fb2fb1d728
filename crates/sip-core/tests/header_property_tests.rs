// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use proptest::prelude::*;
use sip_core::{
    extract_tag, CSeq, HeaderAccess, Headers, Method, Request, RequestLine, SipUri, ViaHeader,
};

proptest! {
    /// Branch parameters survive Via parsing whatever the surrounding params.
    #[test]
    fn via_branch_is_recovered(
        transport in prop::sample::select(vec!["UDP", "tcp", "TLS"]),
        host in "[a-z][a-z0-9]{0,10}\\.example\\.com",
        port in proptest::option::of(1024u16..65535),
        suffix in "[A-Za-z0-9]{4,16}",
        rport in prop::bool::ANY,
    ) {
        let port_part = port.map(|p| format!(":{}", p)).unwrap_or_default();
        let rport_part = if rport { ";rport" } else { "" };
        let raw = format!("SIP/2.0/{} {}{}{};branch=z9hG4bK{}", transport, host, port_part, rport_part, suffix);

        let via = ViaHeader::parse(&raw).expect("valid Via");
        let expected = format!("z9hG4bK{}", suffix);
        prop_assert_eq!(via.branch(), Some(expected.as_str()));
        prop_assert!(via.has_rfc3261_branch());
        prop_assert_eq!(via.transport(), transport.to_ascii_uppercase());
        prop_assert!(via.sent_by.starts_with(&host));
    }

    /// Any 32-bit sequence number parses and prints back unchanged.
    #[test]
    fn cseq_numbers_round_trip(number in any::<u32>(), method in prop::sample::select(vec!["INVITE", "BYE", "OPTIONS", "PUBLISH"])) {
        let raw = format!("{} {}", number, method);
        let cseq = CSeq::parse(&raw).expect("valid CSeq");
        prop_assert_eq!(cseq.number, number);
        prop_assert_eq!(cseq.to_string(), raw);
    }

    /// Tags are found in both name-addr and addr-spec forms.
    #[test]
    fn tags_are_extracted(tag in "[a-zA-Z0-9.~-]{1,20}", bracketed in prop::bool::ANY) {
        let raw = if bracketed {
            format!("\"Bob\" <sip:bob@example.com>;tag={}", tag)
        } else {
            format!("sip:bob@example.com;tag={}", tag)
        };
        let extracted = extract_tag(&raw);
        prop_assert_eq!(extracted.as_deref(), Some(tag.as_str()));
    }
}

#[test]
fn legacy_request_without_branch_still_validates() {
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP old.example.com:5060");
    headers.push("From", "<sip:carol@example.com>;tag=88");
    headers.push("To", "<sip:dave@example.com>");
    headers.push("Call-ID", "legacy-1@old.example.com");
    headers.push("CSeq", "7 OPTIONS");
    let request = Request::new(
        RequestLine::new(Method::Options, SipUri::parse("sip:dave@example.com").unwrap()),
        headers,
        Bytes::new(),
    )
    .unwrap();

    assert!(request.validate_transactional().is_ok());
    assert_eq!(request.top_via().unwrap().branch(), None);
}

#[test]
fn uri_reject_invalid() {
    let invalid_uris = vec![
        "",
        "example.com",
        "http://example.com",
        "sip:",
        "sip:user@",
        "sip:example.com:99999",
    ];

    for uri_str in invalid_uris {
        assert!(
            SipUri::parse(uri_str).is_none(),
            "Should reject invalid URI: {}",
            uri_str
        );
    }
}
