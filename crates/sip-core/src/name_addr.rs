// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;

use smol_str::SmolStr;

use crate::{SipUri, Uri};

/// Generic SIP name-addr structure used by From/To/Contact/Route headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<SmolStr>,
    pub uri: Uri,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl NameAddr {
    /// Parses `"Display" <uri>;params` or the bare `uri;params` form.
    ///
    /// In the bare form every `;param` belongs to the header, not the URI
    /// (RFC 3261 §20.10).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (display_name, uri_str, rest) = match value.find('<') {
            Some(open) => {
                let close = open + value[open..].find('>')?;
                let display = value[..open].trim().trim_matches('"').trim();
                let display = (!display.is_empty()).then(|| SmolStr::new(display));
                (display, &value[open + 1..close], &value[close + 1..])
            }
            None => match value.find(';') {
                Some(idx) => (None, &value[..idx], &value[idx..]),
                None => (None, value, ""),
            },
        };

        let uri = Uri::parse(uri_str.trim())?;
        let mut params = BTreeMap::new();
        for param in rest.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            match param.split_once('=') {
                Some((k, v)) => {
                    params.insert(
                        SmolStr::new(k.trim().to_ascii_lowercase()),
                        Some(SmolStr::new(v.trim().trim_matches('"'))),
                    );
                }
                None => {
                    params.insert(SmolStr::new(param.to_ascii_lowercase()), None);
                }
            }
        }

        Some(Self {
            display_name,
            uri,
            params,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn sip_uri(&self) -> Option<&SipUri> {
        self.uri.as_sip()
    }

    pub fn get_param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(name.to_ascii_lowercase().as_str())
    }

    /// Returns the `tag` parameter (From/To headers).
    pub fn tag(&self) -> Option<&str> {
        self.get_param("tag")
            .and_then(|v| v.as_deref())
            .filter(|v| !v.is_empty())
    }
}

/// Extracts the `tag` parameter from a raw From/To header value.
pub fn extract_tag(value: &str) -> Option<SmolStr> {
    NameAddr::parse(value)
        .and_then(|addr| addr.tag().map(SmolStr::new))
        .or_else(|| {
            // Fall back to a plain scan for values whose URI we cannot interpret.
            value.split(';').skip(1).find_map(|part| {
                let (name, tag) = part.split_once('=')?;
                (name.trim().eq_ignore_ascii_case("tag") && !tag.trim().is_empty())
                    .then(|| SmolStr::new(tag.trim()))
            })
        })
}

/// Returns the header value with `;tag=<tag>` appended unless a tag is present.
pub fn with_tag(value: &str, tag: &str) -> SmolStr {
    if extract_tag(value).is_some() {
        SmolStr::new(value)
    } else {
        SmolStr::new(format!("{};tag={}", value.trim_end(), tag))
    }
}
