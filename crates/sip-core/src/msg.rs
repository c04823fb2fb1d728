// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{
    cseq::CSeq,
    headers::Headers,
    method::Method,
    name_addr::extract_tag,
    uri::Uri,
    via::ViaHeader,
};

const MAX_REASON_LENGTH: usize = 256;
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    InvalidStatusCode { code: u16 },
    ReasonTooLong { max: usize, actual: usize },
    InvalidReason(String),
    BodyTooLarge { max: usize, actual: usize },
    MissingHeader(&'static str),
    InvalidHeader { name: &'static str, value: String },
    MissingBranch,
    CSeqMethodMismatch { request: Method, cseq: Method },
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStatusCode { code } => {
                write!(f, "invalid SIP status code: {} (must be 100-699)", code)
            }
            Self::ReasonTooLong { max, actual } => {
                write!(f, "reason phrase too long (max {}, got {})", max, actual)
            }
            Self::InvalidReason(msg) => write!(f, "invalid reason phrase: {}", msg),
            Self::BodyTooLarge { max, actual } => {
                write!(f, "body too large (max {}, got {})", max, actual)
            }
            Self::MissingHeader(name) => write!(f, "missing {} header", name),
            Self::InvalidHeader { name, value } => {
                write!(f, "malformed {} header: {}", name, value)
            }
            Self::MissingBranch => write!(f, "top Via carries no branch parameter"),
            Self::CSeqMethodMismatch { request, cseq } => write!(
                f,
                "CSeq method {} does not match request method {}",
                cseq, request
            ),
        }
    }
}

impl std::error::Error for MessageError {}

/// Protocol version on the start line; only SIP/2.0 exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SipVersion {
    #[default]
    V2,
}

impl std::fmt::Display for SipVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SIP/2.0")
    }
}

/// `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    uri: Uri,
    version: SipVersion,
}

impl RequestLine {
    pub fn new(method: Method, uri: impl Into<Uri>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: SipVersion::V2,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> &SipVersion {
        &self.version
    }
}

/// `SIP-Version SP Status-Code SP Reason-Phrase`.
///
/// The code must lie in 100-699 and the reason phrase may not carry control
/// characters, so a status line can always be written back out verbatim.
///
/// ```
/// use sip_core::StatusLine;
///
/// assert_eq!(StatusLine::new(180, "Ringing").unwrap().code(), 180);
/// assert!(StatusLine::new(99, "Nope").is_err());
/// assert!(StatusLine::new(200, "OK\r\nX: y").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    version: SipVersion,
    code: u16,
    reason: SmolStr,
}

impl StatusLine {
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }
        let reason = reason.as_ref();
        validate_reason_phrase(reason)?;
        Ok(Self {
            version: SipVersion::V2,
            code,
            reason: SmolStr::new(reason),
        })
    }

    pub fn version(&self) -> &SipVersion {
        &self.version
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A SIP request: request line, headers and an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    start: RequestLine,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Fails when the body exceeds the 10 MiB limit.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;
        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn method(&self) -> &Method {
        self.start.method()
    }

    pub fn uri(&self) -> &Uri {
        self.start.uri()
    }

    pub fn version(&self) -> &SipVersion {
        self.start.version()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// A SIP response: status line, headers and an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    start: StatusLine,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Fails when the body exceeds the 10 MiB limit.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;
        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn version(&self) -> &SipVersion {
        self.start.version()
    }

    pub fn code(&self) -> u16 {
        self.start.code()
    }

    pub fn reason(&self) -> &str {
        self.start.reason()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// 1xx.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code())
    }

    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            Self::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(res) => Some(res),
            Self::Request(_) => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => req.headers(),
            Self::Response(res) => res.headers(),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(request: Request) -> Self {
        SipMessage::Request(request)
    }
}

impl From<Response> for SipMessage {
    fn from(response: Response) -> Self {
        SipMessage::Response(response)
    }
}

/// Header accessors used to match messages to transactions and dialogs.
///
/// Implemented for [`Request`], [`Response`] and [`SipMessage`]; every
/// accessor is a pure read of the header collection.
pub trait HeaderAccess {
    /// Returns the header collection.
    fn header_map(&self) -> &Headers;

    /// Returns the Call-ID header value.
    fn call_id(&self) -> Option<&str> {
        self.header_map()
            .get("Call-ID")
            .or_else(|| self.header_map().get("i"))
            .map(|v| v.as_str().trim())
    }

    /// Returns the parsed CSeq header.
    fn cseq(&self) -> Option<CSeq> {
        self.header_map().get("CSeq").and_then(|v| CSeq::parse(v))
    }

    /// Returns the parsed top-most Via header.
    fn top_via(&self) -> Option<ViaHeader> {
        self.header_map()
            .values("Via")
            .into_iter()
            .chain(self.header_map().values("v"))
            .next()
            .and_then(|v| ViaHeader::parse(&v))
    }

    /// Returns the tag parameter of the From header.
    fn from_tag(&self) -> Option<SmolStr> {
        self.header_map()
            .get("From")
            .or_else(|| self.header_map().get("f"))
            .and_then(|v| extract_tag(v))
    }

    /// Returns the tag parameter of the To header.
    fn to_tag(&self) -> Option<SmolStr> {
        self.header_map()
            .get("To")
            .or_else(|| self.header_map().get("t"))
            .and_then(|v| extract_tag(v))
    }
}

impl HeaderAccess for Request {
    fn header_map(&self) -> &Headers {
        &self.headers
    }
}

impl HeaderAccess for Response {
    fn header_map(&self) -> &Headers {
        &self.headers
    }
}

impl HeaderAccess for SipMessage {
    fn header_map(&self) -> &Headers {
        self.headers()
    }
}

impl Request {
    /// Checks the headers every transactional request must carry.
    ///
    /// The parser collaborator rejects malformed messages before they reach
    /// the transaction layer; this is the last line of that check.
    pub fn validate_transactional(&self) -> Result<(), MessageError> {
        if self.call_id().map_or(true, str::is_empty) {
            return Err(MessageError::MissingHeader("Call-ID"));
        }
        let cseq = match self.headers.get("CSeq") {
            Some(value) => CSeq::parse(value).ok_or_else(|| MessageError::InvalidHeader {
                name: "CSeq",
                value: value.to_string(),
            })?,
            None => return Err(MessageError::MissingHeader("CSeq")),
        };
        if &cseq.method != self.method() {
            return Err(MessageError::CSeqMethodMismatch {
                request: self.method().clone(),
                cseq: cseq.method,
            });
        }
        let via = match self.headers.values("Via").first() {
            Some(raw) => ViaHeader::parse(raw).ok_or_else(|| MessageError::InvalidHeader {
                name: "Via",
                value: raw.to_string(),
            })?,
            None => return Err(MessageError::MissingHeader("Via")),
        };
        // RFC 2543 peers may omit the branch; their transactions are keyed by
        // Call-ID, CSeq, sent-by and the From tag instead.
        if via.branch().is_none() && !self.headers.contains("From") {
            return Err(MessageError::MissingBranch);
        }
        Ok(())
    }
}

impl Response {
    /// Builds a response to `request` copying the headers RFC 3261 §8.2.6.2
    /// requires: every Via, From, To, Call-ID and CSeq.
    pub fn for_request(request: &Request, code: u16, reason: &str) -> Result<Self, MessageError> {
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via", via.clone());
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.headers.get(name) {
                headers.push(name, value.clone());
            }
        }
        headers.push("Content-Length", "0");
        Response::new(StatusLine::new(code, reason)?, headers, Bytes::new())
    }
}

// Validation functions

fn validate_reason_phrase(reason: &str) -> Result<(), MessageError> {
    if reason.len() > MAX_REASON_LENGTH {
        return Err(MessageError::ReasonTooLong {
            max: MAX_REASON_LENGTH,
            actual: reason.len(),
        });
    }

    // Check for control characters (including CRLF)
    // Per RFC 3261, reason phrase is UTF8-TEXT which excludes control characters
    if reason.chars().any(|c| c.is_ascii_control()) {
        return Err(MessageError::InvalidReason(
            "contains control characters".to_string(),
        ));
    }

    Ok(())
}

fn validate_body_size(body: &Bytes) -> Result<(), MessageError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(MessageError::BodyTooLarge {
            max: MAX_BODY_SIZE,
            actual: body.len(),
        });
    }
    Ok(())
}
