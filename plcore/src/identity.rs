use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid"));

/// Separator placed between the two escaped identities of a pair.
pub const PAIR_SEPARATOR: char = '_';

/// A participant, identified by a case-sensitive string (an email address in
/// practice).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Whether the identity has the `local@domain.tld` shape.
    pub fn is_email_like(&self) -> bool {
        EMAIL_RE.is_match(&self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Order-independent key naming everything two participants share in the
/// store (`calls/{pair}`, `chats/{pair}`).
///
/// Both identities are escaped so the result is a single legal path segment:
/// `%`, `_` and the path-reserved characters `. $ # [ ] /` become `%XX`.
/// Because `_` is always escaped inside an identity, the separator is
/// unambiguous and distinct pairs never map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairId(String);

impl PairId {
    pub fn new(a: &Identity, b: &Identity) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut key = escape_segment(first.as_str());
        key.push(PAIR_SEPARATOR);
        key.push_str(&escape_segment(second.as_str()));
        Self(key)
    }

    /// Wraps an already-derived key, e.g. a child key observed in the store.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recovers the two identities, lexicographically ordered.
    pub fn participants(&self) -> Option<(Identity, Identity)> {
        let (first, second) = self.0.split_once(PAIR_SEPARATOR)?;
        Some((
            Identity::new(unescape_segment(first)?),
            Identity::new(unescape_segment(second)?),
        ))
    }

    pub fn involves(&self, identity: &Identity) -> bool {
        self.participants()
            .is_some_and(|(a, b)| &a == identity || &b == identity)
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn needs_escape(c: char) -> bool {
    matches!(c, '%' | '_' | '.' | '$' | '#' | '[' | ']' | '/') || c.is_control()
}

fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if needs_escape(c) {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn unescape_segment(escaped: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(escaped.len());
    let mut iter = escaped.bytes();
    while let Some(b) = iter.next() {
        if b == b'%' {
            let hi = iter.next()?;
            let lo = iter.next()?;
            let pair = [hi, lo];
            let decoded = hex::decode(pair).ok()?;
            bytes.extend_from_slice(&decoded);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}
