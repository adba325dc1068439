//! Per-item state records
//!
//! A [`Record`] carries the non-normal state of one content identifier.
//! `Normal` is never stored: an id in the normal state simply has no record.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Display state of a content item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    #[default]
    Normal,
    Dimmed,
    Hidden,
}

impl ItemState {
    /// Whether this state is represented by a stored record
    pub fn is_stored(&self) -> bool {
        !matches!(self, ItemState::Normal)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Normal => write!(f, "normal"),
            ItemState::Dimmed => write!(f, "dimmed"),
            ItemState::Hidden => write!(f, "hidden"),
        }
    }
}

/// Stored state of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub state: ItemState,
    #[serde(default)]
    pub title: String,
    /// Milliseconds since the Unix epoch; `0` means "no usable timestamp"
    #[serde(default)]
    pub updated_at: i64,
}

impl Record {
    /// Create a record stamped with the current time
    pub fn new(id: impl Into<String>, state: ItemState, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state,
            title: title.into(),
            updated_at: now_millis(),
        }
    }

    /// Replace the timestamp
    pub fn with_updated_at(mut self, updated_at: i64) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// The timestamp if it is usable for ordering
    pub fn timestamp(&self) -> Option<i64> {
        (self.updated_at > 0).then_some(self.updated_at)
    }
}

/// Current wall-clock time in milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
