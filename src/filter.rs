//! Subscription filter: a predicate over `from`/`to`/broadcast header fields
//! (spec.md §3, §4.7).

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::header::Header;

/// A single match target: either an exact string or a regular expression.
#[derive(Debug, Clone)]
pub enum Acceptor {
    Literal(String),
    Pattern(Regex),
}

impl Acceptor {
    pub fn literal(s: impl Into<String>) -> Self {
        Self::Literal(s.into())
    }

    /// Build a pattern acceptor. Returns an argument error for malformed
    /// patterns, per spec.md §4.7's "malformed filters raise an argument
    /// error synchronously".
    pub fn pattern(pat: &str) -> crate::error::Result<Self> {
        Regex::new(pat)
            .map(Self::Pattern)
            .map_err(|e| Error::Argument(format!("invalid filter pattern '{pat}': {e}")))
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Acceptor::Literal(s) => s == value,
            Acceptor::Pattern(re) => re.is_match(value),
        }
    }
}

impl PartialEq for Acceptor {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Acceptor::Literal(a), Acceptor::Literal(b)) => a == b,
            (Acceptor::Pattern(a), Acceptor::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// Tri-state broadcast predicate (spec.md §3 Filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Broadcast {
    /// No constraint on the `to` field.
    #[default]
    Any,
    /// Only messages with no `to` (broadcast messages).
    Only,
    /// Only messages with a `to` present (directed messages).
    Never,
}

/// Predicate over a header's `from`/`to`/broadcast fields. An empty
/// acceptor set for a field means "no constraint on that field" (spec.md
/// §4.7a: "accepted if the filter is absent").
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub from: Vec<Acceptor>,
    pub to: Vec<Acceptor>,
    pub broadcast: Broadcast,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_from(mut self, acceptor: Acceptor) -> Self {
        self.from.push(acceptor);
        self
    }

    pub fn with_to(mut self, acceptor: Acceptor) -> Self {
        self.to.push(acceptor);
        self
    }

    pub fn with_broadcast(mut self, broadcast: Broadcast) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Evaluate this filter against a header. All three components must
    /// pass (spec.md §4.7a).
    pub fn matches(&self, header: &Header) -> bool {
        let from_ok = self.from.is_empty() || self.from.iter().any(|a| a.matches(&header.from));
        let to_ok = self.to.is_empty()
            || header
                .to
                .as_deref()
                .map(|to| self.to.iter().any(|a| a.matches(to)))
                .unwrap_or(false);
        let broadcast_ok = match self.broadcast {
            Broadcast::Any => true,
            Broadcast::Only => header.to.is_none(),
            Broadcast::Never => header.to.is_some(),
        };
        from_ok && to_ok && broadcast_ok
    }
}
