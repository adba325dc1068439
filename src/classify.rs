//! Failure classification
//!
//! Every retrying caller maps a failure into an [`ErrorKind`] with
//! [`classify`]. Matching runs over the failure's timeout flag, its name and
//! its message text, in a fixed precedence order. Later keyword sets overlap
//! earlier ones (a "transaction timeout" is transient, not network, and a
//! torn-down channel is permanent even though its message mentions the
//! connection), so the order of the checks below must not change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Short-lived contention (busy store, aborted transaction)
    Transient,
    /// The call exceeded its deadline
    Timeout,
    /// Storage quota exhausted
    QuotaExceeded,
    /// Access denied by the host
    Permission,
    /// Stored or received data is unreadable
    Corruption,
    /// The channel could not deliver the message
    Network,
    /// Anything that will not improve by retrying
    Permanent,
}

impl ErrorKind {
    /// Whether the default retry predicate retries this kind
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Network)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Permission => "permission",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Network => "network",
            ErrorKind::Permanent => "permanent",
        };
        write!(f, "{}", s)
    }
}

/// A raw failure as reported by a channel or store, before classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Error name, e.g. `TimeoutError` or `QuotaExceededError`
    pub name: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Set when the failure was produced by a local deadline
    pub timed_out: bool,
}

impl Failure {
    /// Create a failure from a message only
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            timed_out: false,
        }
    }

    /// Create a named failure
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: message.into(),
            timed_out: false,
        }
    }

    /// Create a failure produced by a local deadline
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            name: Some("TimeoutError".to_string()),
            message: message.into(),
            timed_out: true,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

const QUOTA_WORDS: &[&str] = &["quota"];
const TRANSIENT_WORDS: &[&str] = &["transaction", "busy", "abort"];
const INVALIDATED_WORDS: &[&str] = &["context invalidated"];
const NETWORK_WORDS: &[&str] = &[
    "network",
    "could not establish connection",
    "receiving end does not exist",
    "no receiver",
    "disconnected",
    "connection",
    "timeout",
];
const PERMISSION_WORDS: &[&str] = &["permission", "security", "notallowed", "not allowed"];
const CORRUPTION_WORDS: &[&str] = &["corrupt", "invalid data", "dataerror", "malformed"];

fn mentions(haystack: &str, words: &[&str]) -> bool {
    words.iter().any(|w| haystack.contains(w))
}

/// Classify a failure. Total and deterministic; `None` is `Permanent`.
pub fn classify(failure: Option<&Failure>) -> ErrorKind {
    let Some(failure) = failure else {
        return ErrorKind::Permanent;
    };

    let name = failure.name.as_deref().unwrap_or("").to_lowercase();
    let message = failure.message.to_lowercase();
    let text = format!("{} {}", name, message);

    if failure.timed_out || name == "timeouterror" {
        ErrorKind::Timeout
    } else if mentions(&text, QUOTA_WORDS) {
        ErrorKind::QuotaExceeded
    } else if mentions(&text, TRANSIENT_WORDS) {
        ErrorKind::Transient
    } else if mentions(&text, INVALIDATED_WORDS) {
        ErrorKind::Permanent
    } else if mentions(&text, NETWORK_WORDS) {
        ErrorKind::Network
    } else if mentions(&text, PERMISSION_WORDS) {
        ErrorKind::Permission
    } else if mentions(&text, CORRUPTION_WORDS) {
        ErrorKind::Corruption
    } else {
        ErrorKind::Permanent
    }
}
