// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types: messages, headers and URIs.
//!
//! This crate provides the message model consumed by the transaction and
//! dialog layers:
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **Matching accessors**: [`HeaderAccess`] (Call-ID, CSeq, top Via, From/To tags)
//! - **URIs**: [`SipUri`] (sip/sips) and [`Uri`]
//! - **Headers**: [`Headers`] container plus parsed [`ViaHeader`], [`CSeq`] and [`NameAddr`]
//! - **Methods**: [`Method`] enum (INVITE, ACK, CANCEL, extension methods, ...)
//!
//! Wire parsing and serialization live outside this crate; values here are
//! already parsed. Strings use [`SmolStr`](smol_str::SmolStr) and bodies use
//! [`Bytes`](bytes::Bytes).
//!
//! # Examples
//!
//! ```
//! # use sip_core::*;
//! let via = ViaHeader::parse("SIP/2.0/UDP host.example.com;branch=z9hG4bK74bf9").unwrap();
//! assert!(via.has_rfc3261_branch());
//!
//! let uri = SipUri::parse("sip:alice@example.com").unwrap();
//! assert_eq!(uri.host.as_str(), "example.com");
//! ```

pub mod cseq;
pub mod headers;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod uri;
pub mod via;

pub use cseq::CSeq;
pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{
    HeaderAccess, MessageError, Request, RequestLine, Response, SipMessage, SipVersion, StatusLine,
};
pub use name_addr::{extract_tag, with_tag, NameAddr};
pub use uri::{SipUri, Uri};
pub use via::{ViaHeader, MAGIC_COOKIE};
