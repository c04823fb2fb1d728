// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

/// Parsed representation of a SIP URI (RFC 3261 §19).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub raw: SmolStr,
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl SipUri {
    /// Attempts to parse a SIP or SIPS URI from the provided string.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (scheme, rest) = input.split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        // URI headers (`?name=value`) never take part in matching.
        let addr_part = rest.split_once('?').map_or(rest, |(addr, _)| addr);

        let mut params = BTreeMap::new();
        let mut addr_iter = addr_part.split(';');
        let base = addr_iter.next()?.trim();
        for param in addr_iter.map(str::trim).filter(|p| !p.is_empty()) {
            match param.split_once('=') {
                Some((k, v)) => {
                    params.insert(
                        SmolStr::new(k.trim().to_ascii_lowercase()),
                        Some(SmolStr::new(v.trim())),
                    );
                }
                None => {
                    params.insert(SmolStr::new(param.to_ascii_lowercase()), None);
                }
            }
        }

        let (user, host_port) = match base.split_once('@') {
            Some((user, host)) => (
                percent_decode_str(user.trim())
                    .decode_utf8()
                    .ok()
                    .map(|s| SmolStr::new(s.as_ref())),
                host.trim(),
            ),
            None => (None, base),
        };

        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return None;
        }

        Some(Self {
            raw: SmolStr::new(input),
            sips,
            user,
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
            params,
        })
    }

    /// Returns the original textual representation of the URI.
    pub fn as_str(&self) -> &str {
        self.raw.as_str()
    }

    /// Looks up a URI parameter ignoring ASCII case.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(name.to_ascii_lowercase().as_str())
    }

    /// Returns `true` when the URI carries the loose-routing `lr` parameter.
    pub fn is_loose_route(&self) -> bool {
        self.params.contains_key("lr")
    }

    /// Returns the `transport=` URI parameter, lower-cased.
    pub fn transport_param(&self) -> Option<SmolStr> {
        self.param("transport")
            .and_then(|v| v.as_ref())
            .map(|v| SmolStr::new(v.to_ascii_lowercase()))
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URI carried in a request line or name-addr.
///
/// Only SIP/SIPS URIs are interpreted; anything else is kept verbatim so
/// it can be echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Uri {
    /// SIP or SIPS URI (e.g., sip:user@example.com)
    Sip(SipUri),
    /// Absolute URI of another scheme (e.g., tel:+15551234567)
    Absolute(SmolStr),
}

impl Uri {
    /// Parses a URI string, interpreting `sip:`/`sips:` and keeping other schemes raw.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let (scheme, _) = trimmed.split_once(':')?;
        if scheme.eq_ignore_ascii_case("sip") || scheme.eq_ignore_ascii_case("sips") {
            SipUri::parse(trimmed).map(Uri::Sip)
        } else {
            parse_absolute_uri(trimmed).map(Uri::Absolute)
        }
    }

    /// Returns the URI as a string.
    pub fn as_str(&self) -> &str {
        match self {
            Uri::Sip(uri) => uri.as_str(),
            Uri::Absolute(uri) => uri.as_str(),
        }
    }

    /// Returns true if this is a SIP or SIPS URI.
    pub fn is_sip(&self) -> bool {
        matches!(self, Uri::Sip(_))
    }

    /// Returns true if this is a SIPS URI.
    pub fn is_sips(&self) -> bool {
        matches!(self, Uri::Sip(uri) if uri.sips)
    }

    /// Returns the inner SipUri if this is a SIP URI, None otherwise.
    pub fn as_sip(&self) -> Option<&SipUri> {
        match self {
            Uri::Sip(uri) => Some(uri),
            Uri::Absolute(_) => None,
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SipUri> for Uri {
    fn from(uri: SipUri) -> Self {
        Uri::Sip(uri)
    }
}

fn parse_absolute_uri(input: &str) -> Option<SmolStr> {
    let (scheme, remainder) = input.split_once(':')?;
    let mut chars = scheme.chars();
    if !chars.next()?.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.')) {
        return None;
    }
    if remainder.is_empty() {
        return None;
    }
    Some(SmolStr::new(input))
}

/// Splits a host[:port] or IPv6 literal "[host]:port" string.
pub(crate) fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if input.starts_with('[') {
        let end = input.find(']')?;
        let host = &input[1..end];
        let remainder = &input[end + 1..];
        match remainder.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if remainder.is_empty() => Some((host, None)),
            None => None,
        }
    } else if let Some(idx) = input.rfind(':') {
        if input.matches(':').count() > 1 {
            return None;
        }
        let (host, port_str) = input.split_at(idx);
        let port = port_str[1..].parse().ok()?;
        Some((host, Some(port)))
    } else {
        Some((input, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sip_uri_via_uri_enum() {
        let uri = Uri::parse("sip:alice@example.com").unwrap();
        assert!(uri.is_sip());

        let sip_uri = uri.as_sip().unwrap();
        assert_eq!(sip_uri.host.as_str(), "example.com");
        assert_eq!(sip_uri.user.as_ref().unwrap().as_str(), "alice");
    }

    #[test]
    fn keeps_other_schemes_verbatim() {
        let uri = Uri::parse("tel:+1-555-123-4567").unwrap();
        assert!(!uri.is_sip());
        assert_eq!(uri.to_string(), "tel:+1-555-123-4567");
    }

    #[test]
    fn parses_route_params() {
        let uri = SipUri::parse("sip:proxy.example.com:5070;lr;transport=TCP").unwrap();
        assert_eq!(uri.port, Some(5070));
        assert!(uri.is_loose_route());
        assert_eq!(uri.transport_param().as_deref(), Some("tcp"));
    }

    #[test]
    fn parses_bracketed_ipv6_host() {
        let uri = SipUri::parse("sips:[2001:db8::1]:5061").unwrap();
        assert!(uri.sips);
        assert_eq!(uri.host.as_str(), "2001:db8::1");
        assert_eq!(uri.port, Some(5061));
    }

    #[test]
    fn rejects_unbracketed_ipv6_host() {
        assert!(SipUri::parse("sip:2001:db8::1").is_none());
    }

    #[test]
    fn rejects_bad_port() {
        assert!(SipUri::parse("sip:example.com:notaport").is_none());
    }
}
