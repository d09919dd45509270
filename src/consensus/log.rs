// Raft log window
//
// Holds the entries above the snapshot base and maps absolute indices onto
// the in-memory window. The base sentinel (base_index, base_term) stands in
// for the last compacted entry, so consistency checks keep working right at
// the snapshot boundary.

use crate::consensus::messages::{LogEntry, LogIndex, Snapshot, Term};
use crate::error::{RaftError, Result};
use std::collections::VecDeque;

/// In-memory log window over a snapshot base
#[derive(Debug, Default)]
pub struct RaftLog {
    /// Entries with index > base_index, contiguous and sorted
    entries: VecDeque<LogEntry>,

    /// Index of the last compacted entry (0 when nothing was compacted)
    base_index: LogIndex,

    /// Term of the entry at base_index
    base_term: Term,

    /// Retained snapshot covering [1, base_index]
    snapshot: Option<Snapshot>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_index(&self) -> LogIndex {
        self.base_index
    }

    pub fn base_term(&self) -> Term {
        self.base_term
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Index of the last entry; falls back to the base sentinel when the
    /// window is empty (fresh log or just after a snapshot install).
    pub fn last_index(&self) -> LogIndex {
        self.entries.back().map(|e| e.index).unwrap_or(self.base_index)
    }

    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.base_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn offset_of(&self, index: LogIndex) -> Option<usize> {
        if index <= self.base_index || index > self.last_index() {
            return None;
        }
        Some((index - self.base_index - 1) as usize)
    }

    /// Entry at an absolute index; None below the base or above the tail.
    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        self.offset_of(index).and_then(|o| self.entries.get(o))
    }

    /// Term at an absolute index. The base sentinel answers for the last
    /// compacted entry; anything further below the base is unknowable.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.entry_at(index).map(|e| e.term)
    }

    /// Append a single entry; it must continue last_index by exactly one.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(RaftError::InvalidAppend {
                expected,
                got: entry.index,
            });
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Drop all entries with index >= the given one. No-op above the tail;
    /// refuses to cut into the compacted prefix.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.base_index {
            return Err(RaftError::LogCompacted(index));
        }
        if index > self.last_index() {
            return Ok(());
        }
        self.entries.truncate((index - self.base_index - 1) as usize);
        Ok(())
    }

    /// Clone up to `max` entries starting at the given absolute index.
    pub fn entries_from(&self, index: LogIndex, max: usize) -> Vec<LogEntry> {
        match self.offset_of(index) {
            Some(offset) => self.entries.iter().skip(offset).take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// First index in the window carrying the given term, for the follower's
    /// conflict hint.
    pub fn first_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries.iter().find(|e| e.term == term).map(|e| e.index)
    }

    /// Last index known to carry the given term (window or base sentinel),
    /// for the leader's conflict backtracking.
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        if let Some(entry) = self.entries.iter().rev().find(|e| e.term == term) {
            return Some(entry.index);
        }
        (self.base_index > 0 && self.base_term == term).then_some(self.base_index)
    }

    /// Any membership-change entry at or above the given index?
    pub fn has_membership_change_from(&self, index: LogIndex) -> bool {
        self.entries
            .iter()
            .any(|e| e.index >= index && e.command.is_membership_change())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// The whole window as a Vec, for the persistent record.
    pub fn window(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Drop all entries with index <= the snapshot's last included index and
    /// retain the snapshot; the base sentinel takes over for the prefix.
    pub fn compact_through(&mut self, snapshot: Snapshot) {
        let index = snapshot.last_included_index;
        while self
            .entries
            .front()
            .map(|e| e.index <= index)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
        self.base_index = index;
        self.base_term = snapshot.last_included_term;
        self.snapshot = Some(snapshot);
    }

    /// Replace the entire log with the snapshot's base sentinel.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) {
        self.entries.clear();
        self.base_index = snapshot.last_included_index;
        self.base_term = snapshot.last_included_term;
        self.snapshot = Some(snapshot);
    }
}
