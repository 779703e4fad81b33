//! Shared store path layout.
//!
//! ```text
//! calls/{pair}                      CallRecord
//! calls/{pair}/candidates/{key}     CandidateRecord
//! chats/{pair}/{key}                ChatMessage
//! ```

use crate::error::StoreError;
use crate::identity::PairId;
use std::fmt;

pub const CALLS_ROOT: &str = "calls";
pub const CANDIDATES: &str = "candidates";
pub const CHATS_ROOT: &str = "chats";

/// A slash-separated location in the shared store. The empty path is the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses `a/b/c`. Leading and trailing slashes are ignored.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let mut path = Self::root();
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            path = path.child(segment)?;
        }
        Ok(path)
    }

    pub fn child(&self, segment: &str) -> Result<Self, StoreError> {
        if segment.is_empty()
            || segment
                .chars()
                .any(|c| matches!(c, '/' | '.' | '$' | '#' | '[' | ']') || c.is_control())
        {
            return Err(StoreError::InvalidPath(format!("{self}/{segment}")));
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self {
            segments: rest.to_vec(),
        })
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Whether `self` equals `other` or lies underneath it.
    pub fn starts_with(&self, other: &StorePath) -> bool {
        self.segments.starts_with(&other.segments)
    }

    /// `calls`
    pub fn calls() -> Self {
        Self {
            segments: vec![CALLS_ROOT.to_string()],
        }
    }

    /// `calls/{pair}`
    pub fn call(pair: &PairId) -> Self {
        Self {
            segments: vec![CALLS_ROOT.to_string(), pair.as_str().to_string()],
        }
    }

    /// `calls/{pair}/candidates`
    pub fn candidates(pair: &PairId) -> Self {
        Self {
            segments: vec![
                CALLS_ROOT.to_string(),
                pair.as_str().to_string(),
                CANDIDATES.to_string(),
            ],
        }
    }

    /// `chats/{pair}`
    pub fn chat(pair: &PairId) -> Self {
        Self {
            segments: vec![CHATS_ROOT.to_string(), pair.as_str().to_string()],
        }
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}
