// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::slice::{Iter, IterMut};

use smol_str::SmolStr;

/// Represents a single SIP header field as a name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmolStr,
    pub value: SmolStr,
}

/// Collection of SIP headers preserving insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a header collection from the given vector without additional cloning.
    pub fn from_vec(headers: Vec<Header>) -> Self {
        Self(headers)
    }

    /// Appends a header to the collection.
    pub fn push(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Inserts a header before every other header (used for Via and Route).
    pub fn push_front(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.0.insert(
            0,
            Header {
                name: name.into(),
                value: value.into(),
            },
        );
    }

    /// Replaces the first header with this name, appending when absent.
    pub fn set(&mut self, name: &str, value: impl Into<SmolStr>) {
        let value = value.into();
        match self.0.iter_mut().find(|h| h.name.eq_ignore_ascii_case(name)) {
            Some(header) => header.value = value,
            None => self.push(SmolStr::new(name), value),
        }
    }

    /// Removes every header with this name, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    /// Returns an iterator over the stored headers.
    pub fn iter(&self) -> Iter<'_, Header> {
        self.0.iter()
    }

    /// Returns a mutable iterator over the stored headers.
    pub fn iter_mut(&mut self) -> IterMut<'_, Header> {
        self.0.iter_mut()
    }

    /// Returns the number of headers present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when the collection does not contain any headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` when at least one header with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Finds the first header whose name matches ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&SmolStr> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// Returns all headers with the given name, preserving original order.
    ///
    /// Comma-joined values are returned as stored; use [`Headers::values`]
    /// when each list element is needed individually.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SmolStr> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value)
    }

    /// Returns every element of a list-valued header (Via, Route, Record-Route),
    /// splitting comma-joined values outside of quotes and angle brackets.
    pub fn values(&self, name: &str) -> Vec<SmolStr> {
        self.get_all(name)
            .flat_map(|value| split_list(value))
            .collect()
    }

    /// Consumes the collection returning the underlying vector.
    pub fn into_inner(self) -> Vec<Header> {
        self.0
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn split_list(value: &str) -> Vec<SmolStr> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut in_angle = false;

    for (idx, ch) in value.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                let part = value[start..idx].trim();
                if !part.is_empty() {
                    parts.push(SmolStr::new(part));
                }
                start = idx + 1;
            }
            _ => {}
        }
    }

    let tail = value[start..].trim();
    if !tail.is_empty() {
        parts.push(SmolStr::new(tail));
    }
    parts
}
