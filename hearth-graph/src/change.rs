//! Ordered change log with independent reader cursors
//!
//! Every mutating store call appends one record. The runtime pump and
//! the persistence collaborator each read through their own cursor;
//! records are pruned once every open cursor has passed them, so a
//! tailing reader sees every record exactly once, in order.

use hearth_types::{Location, ResourcePath, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// What kind of mutation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Deleted,
    ValueChanged,
    Activated,
    Deactivated,
    ReferenceChanged,
}

/// One raw mutation of the resource graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Monotonic sequence number, unique per graph.
    pub seq: u64,
    /// Storage cell the change applies to.
    pub location: Location,
    /// Structural parent of the cell, if any. Creation and deletion
    /// records are matched against listeners and pattern footprints
    /// through the parent, since the cell itself is new or gone.
    pub parent: Option<Location>,
    /// Path of the cell at the time of the change (deletion records
    /// keep the pre-deletion path).
    pub path: ResourcePath,
    pub kind: ChangeKind,
    pub timestamp: Timestamp,
}

/// Identity of an open change-log cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorId(pub u64);

static CURSOR_COUNTER: AtomicU64 = AtomicU64::new(1);

impl CursorId {
    fn next() -> Self {
        Self(CURSOR_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor:{}", self.0)
    }
}

/// Append-only log of [`ChangeRecord`]s with pruning.
#[derive(Debug, Default)]
pub struct ChangeLog {
    records: VecDeque<ChangeRecord>,
    next_seq: u64,
    /// Per-cursor next sequence number to read.
    cursors: HashMap<CursorId, u64>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, returning its assigned sequence number.
    pub fn append(
        &mut self,
        location: Location,
        parent: Option<Location>,
        path: ResourcePath,
        kind: ChangeKind,
        timestamp: Timestamp,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.push_back(ChangeRecord {
            seq,
            location,
            parent,
            path,
            kind,
            timestamp,
        });
        seq
    }

    /// Open a cursor positioned after everything already logged.
    pub fn open_cursor(&mut self) -> CursorId {
        let id = CursorId::next();
        self.cursors.insert(id, self.next_seq);
        id
    }

    /// Open a cursor positioned at the oldest retained record.
    pub fn open_cursor_at_start(&mut self) -> CursorId {
        let id = CursorId::next();
        let start = self.records.front().map(|r| r.seq).unwrap_or(self.next_seq);
        self.cursors.insert(id, start);
        id
    }

    /// Read and advance a cursor, then prune fully-consumed records.
    /// Unknown cursors read nothing.
    pub fn read(&mut self, cursor: CursorId) -> Vec<ChangeRecord> {
        let Some(next) = self.cursors.get_mut(&cursor) else {
            return Vec::new();
        };
        let from = *next;
        let out: Vec<ChangeRecord> = self
            .records
            .iter()
            .filter(|r| r.seq >= from)
            .cloned()
            .collect();
        *next = self.next_seq;
        self.prune();
        out
    }

    /// Close a cursor, releasing its retention hold.
    pub fn close_cursor(&mut self, cursor: CursorId) -> bool {
        let removed = self.cursors.remove(&cursor).is_some();
        if removed {
            self.prune();
        }
        removed
    }

    /// Number of records currently retained.
    pub fn retained(&self) -> usize {
        self.records.len()
    }

    /// Whether any record is pending for the cursor.
    pub fn has_pending(&self, cursor: CursorId) -> bool {
        self.cursors
            .get(&cursor)
            .is_some_and(|next| *next < self.next_seq)
    }

    fn prune(&mut self) {
        let Some(min) = self.cursors.values().min().copied() else {
            // No readers: nothing retains records.
            self.records.clear();
            return;
        };
        while self.records.front().is_some_and(|r| r.seq < min) {
            self.records.pop_front();
        }
    }
}
