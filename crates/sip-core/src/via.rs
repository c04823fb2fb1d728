// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;

use smol_str::SmolStr;

/// Branch prefix identifying RFC 3261 compliant transaction identifiers.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// Parsed representation of a Via header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub transport: SmolStr,
    pub sent_by: SmolStr,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl ViaHeader {
    /// Parses a single Via value such as `SIP/2.0/UDP host:5060;branch=z9hG4bK1`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split(';');
        let sent = parts.next()?.trim();
        let (protocol, sent_by) = sent.split_once(char::is_whitespace)?;

        let mut protocol_parts = protocol.trim().split('/');
        let name = protocol_parts.next()?;
        let version = protocol_parts.next()?;
        let transport = protocol_parts.next()?;
        if !name.eq_ignore_ascii_case("SIP") || version != "2.0" || transport.is_empty() {
            return None;
        }

        let sent_by = sent_by.trim();
        if sent_by.is_empty() {
            return None;
        }

        let mut params = BTreeMap::new();
        for param in parts.map(str::trim).filter(|p| !p.is_empty()) {
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

        Some(Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            sent_by: SmolStr::new(sent_by.to_ascii_lowercase()),
            params,
        })
    }

    /// Returns the transport token (e.g. UDP/TCP/TLS) associated with this Via.
    pub fn transport(&self) -> &str {
        self.transport.as_str()
    }

    /// Looks up the provided parameter ignoring ASCII case.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(name.to_ascii_lowercase().as_str())
    }

    /// Returns the `branch` parameter value, if any.
    pub fn branch(&self) -> Option<&str> {
        self.param("branch")
            .and_then(|v| v.as_deref())
            .filter(|v| !v.is_empty())
    }

    /// Returns `true` if the branch starts with the RFC 3261 magic cookie.
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch()
            .map(|b| b.starts_with(MAGIC_COOKIE))
            .unwrap_or(false)
    }
}
