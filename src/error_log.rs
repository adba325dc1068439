//! Bounded diagnostic log of classified failures
//!
//! Entries are kept newest first and are only read by operators; nothing in
//! the control flow consults them.

use crate::classify::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Default number of retained entries
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 50;

/// One recorded failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    /// Where the failure happened, e.g. `send:get_many`
    pub context: String,
    /// Free-form details such as attempt numbers
    pub metadata: HashMap<String, String>,
}

/// Ring buffer of the last `capacity` failures
#[derive(Debug)]
pub struct ErrorLog {
    capacity: usize,
    entries: Mutex<VecDeque<ErrorLogEntry>>,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ErrorLogEntry>> {
        // A poisoned diagnostic log is still usable
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a failure
    pub fn record(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        context: impl Into<String>,
        metadata: HashMap<String, String>,
    ) {
        let entry = ErrorLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            context: context.into(),
            metadata,
        };

        let mut entries = self.lock();
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    /// Snapshot of all entries, newest first
    pub fn entries(&self) -> Vec<ErrorLogEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Most recent entry
    pub fn latest(&self) -> Option<ErrorLogEntry> {
        self.lock().front().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Count entries per kind
    pub fn summary(&self) -> HashMap<ErrorKind, usize> {
        let mut counts = HashMap::new();
        for entry in self.lock().iter() {
            *counts.entry(entry.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG_CAPACITY)
    }
}
