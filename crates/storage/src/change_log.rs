//! Change log for Ripple stores.
//!
//! The change log is an append-only, totally ordered record of writes. Every
//! entry carries a `Marker`; markers only grow, so a reader that remembers the
//! last marker it saw can resume without gaps or repeats.

use ripple_core::DocId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Position of an entry in the change log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Marker(pub u64);

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of write recorded by an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
    /// The whole collection was dropped.
    Drop,
}

/// A single change-log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub marker: Marker,
    pub collection: String,
    pub op: ChangeOp,
    /// Absent for `ChangeOp::Drop`.
    pub document_id: Option<DocId>,
}

impl ChangeLogEntry {
    /// Returns true if the entry invalidates a whole collection.
    pub fn is_drop(&self) -> bool {
        self.op == ChangeOp::Drop
    }
}

/// Bounded in-memory change log.
///
/// Once `capacity` entries are retained the oldest are discarded, like a
/// capped collection.
#[derive(Debug)]
pub struct ChangeLog {
    entries: VecDeque<ChangeLogEntry>,
    next_marker: u64,
    capacity: usize,
}

impl ChangeLog {
    /// Default number of retained entries.
    pub const DEFAULT_CAPACITY: usize = 100_000;

    /// Creates an empty log with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates an empty log that retains at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_marker: 1,
            capacity: capacity.max(1),
        }
    }

    /// Appends an entry and returns its marker.
    pub fn append(&mut self, collection: &str, op: ChangeOp, document_id: Option<DocId>) -> Marker {
        let marker = Marker(self.next_marker);
        self.next_marker += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ChangeLogEntry {
            marker,
            collection: collection.to_string(),
            op,
            document_id,
        });
        marker
    }

    /// Returns up to `limit` entries strictly after `after`.
    pub fn read_after(&self, after: Option<Marker>, limit: usize) -> Vec<ChangeLogEntry> {
        let start = match after {
            None => 0,
            Some(m) => self.entries.partition_point(|e| e.marker <= m),
        };
        self.entries.iter().skip(start).take(limit).cloned().collect()
    }

    /// Returns the newest marker, if any entry was ever appended.
    pub fn latest(&self) -> Option<Marker> {
        self.entries.back().map(|e| e.marker)
    }

    /// Returns the number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}
