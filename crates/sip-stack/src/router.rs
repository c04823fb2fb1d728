// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Next-hop selection for requests the stack sends.
//!
//! The stack does no DNS. [`DefaultRouter`] sends to the top Route URI (or
//! the Request-URI when there is no Route) and requires that URI to name an
//! IP address. [`StaticRouter`] ignores the request and returns a fixed list,
//! which is what an outbound proxy setup wants.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use sip_core::{NameAddr, Request, SipUri, Uri};
use sip_transaction::{TransportContext, TransportKind};

use crate::StackError;

/// A transport and address to send a request to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hop {
    pub transport: TransportKind,
    pub addr: SocketAddr,
}

impl Hop {
    pub fn new(transport: TransportKind, addr: SocketAddr) -> Self {
        Self { transport, addr }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(TransportKind::Udp, addr)
    }

    pub fn context(&self) -> TransportContext {
        TransportContext::new(self.transport, self.addr)
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport.as_str().to_ascii_lowercase(), self.addr)
    }
}

/// Parses `udp:192.0.2.10:5060`, `tcp:[2001:db8::1]:5060` or a bare socket
/// address (UDP).
impl FromStr for Hop {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (transport, addr) = match s.split_once(':') {
            Some((token, rest))
                if ["udp", "tcp", "tls"]
                    .iter()
                    .any(|t| token.eq_ignore_ascii_case(t)) =>
            {
                (TransportKind::from_token(token), rest)
            }
            _ => (TransportKind::Udp, s),
        };
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|_| StackError::Routing(format!("invalid hop '{}'", s)))?;
        Ok(Hop::new(transport, addr))
    }
}

/// Chooses where an outgoing request goes.
pub trait Router: Send + Sync + 'static {
    /// Returns candidate hops in preference order; never empty on success.
    fn next_hops(&self, request: &Request) -> Result<Vec<Hop>, StackError>;
}

/// Routing strategy selected in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RouterKind {
    #[default]
    Default,
    Static(Vec<Hop>),
}

/// Builds the router for `kind`.
pub fn build_router(kind: &RouterKind) -> Arc<dyn Router> {
    match kind {
        RouterKind::Default => Arc::new(DefaultRouter),
        RouterKind::Static(hops) => Arc::new(StaticRouter::new(hops.clone())),
    }
}

/// Routes by the top Route header, falling back to the Request-URI.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRouter;

impl Router for DefaultRouter {
    fn next_hops(&self, request: &Request) -> Result<Vec<Hop>, StackError> {
        let target = match request.headers().values("Route").first() {
            Some(route) => NameAddr::parse(route)
                .map(|name_addr| name_addr.uri)
                .ok_or_else(|| StackError::Routing(format!("unparsable Route '{}'", route)))?,
            None => request.uri().clone(),
        };
        let uri = match &target {
            Uri::Sip(uri) => uri,
            Uri::Absolute(raw) => {
                return Err(StackError::Routing(format!(
                    "cannot route to non-SIP URI {}",
                    raw
                )))
            }
        };
        Ok(vec![hop_for_uri(uri)?])
    }
}

/// Always returns the configured hops.
#[derive(Debug, Clone)]
pub struct StaticRouter {
    hops: Vec<Hop>,
}

impl StaticRouter {
    pub fn new(hops: Vec<Hop>) -> Self {
        Self { hops }
    }
}

impl Router for StaticRouter {
    fn next_hops(&self, _request: &Request) -> Result<Vec<Hop>, StackError> {
        if self.hops.is_empty() {
            return Err(StackError::Routing("no static hops configured".into()));
        }
        Ok(self.hops.clone())
    }
}

fn hop_for_uri(uri: &SipUri) -> Result<Hop, StackError> {
    let ip: IpAddr = uri.host.parse().map_err(|_| {
        StackError::Routing(format!("host '{}' is not an IP address", uri.host))
    })?;
    let transport = match uri.transport_param() {
        Some(token) => TransportKind::from_token(&token),
        None if uri.sips => TransportKind::Tls,
        None => TransportKind::Udp,
    };
    let default_port = if uri.sips || transport == TransportKind::Tls {
        5061
    } else {
        5060
    };
    Ok(Hop::new(
        transport,
        SocketAddr::new(ip, uri.port.unwrap_or(default_port)),
    ))
}
