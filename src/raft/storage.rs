//! In-memory log storage the engine reads from.
//!
//! The bootstrap fills a [`MemoryStorage`] from the durable log: snapshot first,
//! then hard state, then the entries that follow the snapshot. Entries always
//! start right after the snapshot index and are contiguous.

use super::{ConfState, HardState, LogEntry};
use crate::error::{Result, TesseraError};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Snapshot metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Membership at `index`.
    pub conf_state: ConfState,
    /// Last log index covered by the snapshot.
    pub index: LogIndex,
    /// Term of the entry at `index`.
    pub term: Term,
}

/// A point-in-time capture of the state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub metadata: SnapshotMeta,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}

/// Log storage kept in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStorage {
    hard_state: HardState,
    snapshot: Snapshot,
    /// Entries after `snapshot.metadata.index`.
    entries: VecDeque<LogEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The persisted hard state and the membership it was taken under.
    pub fn initial_state(&self) -> (HardState, ConfState) {
        (self.hard_state, self.snapshot.metadata.conf_state.clone())
    }

    pub fn hard_state(&self) -> HardState {
        self.hard_state
    }

    pub fn set_hard_state(&mut self, hs: HardState) {
        self.hard_state = hs;
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Index of the first entry still held.
    pub fn first_index(&self) -> LogIndex {
        self.snapshot.metadata.index + 1
    }

    /// Get the index of the last log entry.
    pub fn last_index(&self) -> LogIndex {
        self.snapshot.metadata.index + self.entries.len() as u64
    }

    /// Get the term at a specific index.
    pub fn term(&self, index: LogIndex) -> Result<Term> {
        let snap = &self.snapshot.metadata;
        if index == snap.index {
            return Ok(snap.term);
        }
        if index < snap.index {
            return Err(TesseraError::RaftLog(format!(
                "Index {} compacted into snapshot at {}",
                index, snap.index
            )));
        }
        self.get(index).map(|e| e.term).ok_or_else(|| {
            TesseraError::RaftLog(format!(
                "Index {} unavailable, last index is {}",
                index,
                self.last_index()
            ))
        })
    }

    /// Get an entry by index.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index() || index > self.last_index() {
            return None;
        }
        let offset = (index - self.first_index()) as usize;
        self.entries.get(offset)
    }

    /// Entries in `[lo, hi)`.
    pub fn entries(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<LogEntry>> {
        if lo < self.first_index() {
            return Err(TesseraError::RaftLog(format!(
                "Index {} compacted into snapshot at {}",
                lo, self.snapshot.metadata.index
            )));
        }
        if hi > self.last_index() + 1 {
            return Err(TesseraError::RaftLog(format!(
                "Entries up to {} requested, last index is {}",
                hi,
                self.last_index()
            )));
        }
        let start = (lo - self.first_index()) as usize;
        let end = (hi.max(lo) - self.first_index()) as usize;
        Ok(self.entries.range(start..end).cloned().collect())
    }

    /// Get the number of entries held after the snapshot.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the contents with a snapshot. Entries are discarded.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let current = self.snapshot.metadata.index;
        if current >= snapshot.metadata.index {
            return Err(TesseraError::RaftLog(format!(
                "Snapshot at {} is out of date, storage already at {}",
                snapshot.metadata.index, current
            )));
        }
        self.snapshot = snapshot;
        self.entries.clear();
        Ok(())
    }

    /// Append entries, overwriting any conflicting suffix.
    ///
    /// Entries already covered by the snapshot are ignored. A gap between the
    /// current tail and the first new entry is an error.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        let Some(head) = entries.first() else {
            return Ok(());
        };

        for pair in entries.windows(2) {
            if pair[1].index != pair[0].index + 1 {
                return Err(TesseraError::RaftLog(format!(
                    "Entries not contiguous: {} followed by {}",
                    pair[0].index, pair[1].index
                )));
            }
        }

        let first = self.first_index();
        let last_new = head.index + entries.len() as u64 - 1;
        if last_new < first {
            return Ok(());
        }

        let entries = if head.index < first {
            &entries[(first - head.index) as usize..]
        } else {
            entries
        };

        let offset = (entries[0].index - first) as usize;
        if offset > self.entries.len() {
            return Err(TesseraError::RaftLog(format!(
                "Missing log entry: last index {}, appending at {}",
                self.last_index(),
                entries[0].index
            )));
        }
        self.entries.truncate(offset);
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }
}
