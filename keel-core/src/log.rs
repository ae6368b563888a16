//! Replicated log: typed entries and the append-optimized store.
//!
//! Entries carry their own index and term. The store keeps the live
//! window in memory, writes through to a `LogStore` when one is attached,
//! and offers a staged backup/commit/restore window for compaction: after
//! `backup()` every mutation is memory-only until `commit()` rewrites the
//! durable file once, or `restore()` abandons the staged changes.

use crate::cluster::MemberId;
use crate::error::{ReplicaError, Result};
use crate::storage::LogStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

/// Election epoch. Monotonically non-decreasing along the log.
pub type Term = u64;

/// 1-based log position. Never reused.
pub type LogIndex = u64;

/// Entry payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EntryKind {
    /// Client command with opaque arguments.
    #[serde(rename = "COMMAND")]
    Command { name: String, args: serde_json::Value },

    /// Cluster membership after this entry commits.
    #[serde(rename = "CONFIG")]
    Configuration { members: BTreeSet<MemberId> },

    /// Start of a chunked snapshot; captures membership at snapshot time.
    #[serde(rename = "SNAPSHOT_START")]
    SnapshotStart { members: BTreeSet<MemberId> },

    /// One slice of the serialized state machine.
    #[serde(rename = "SNAPSHOT_CHUNK")]
    SnapshotChunk { data: Vec<u8> },

    /// End of a chunked snapshot; total payload length in bytes.
    #[serde(rename = "SNAPSHOT_END")]
    SnapshotEnd { total_len: u64 },

    /// Appended by a fresh leader to commit entries from earlier terms.
    #[serde(rename = "NOOP")]
    NoOp,
}

/// Single log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
}

impl Entry {
    pub fn command(index: LogIndex, term: Term, name: String, args: serde_json::Value) -> Self {
        Self { index, term, kind: EntryKind::Command { name, args } }
    }

    pub fn configuration(index: LogIndex, term: Term, members: BTreeSet<MemberId>) -> Self {
        Self { index, term, kind: EntryKind::Configuration { members } }
    }

    pub fn snapshot_start(index: LogIndex, term: Term, members: BTreeSet<MemberId>) -> Self {
        Self { index, term, kind: EntryKind::SnapshotStart { members } }
    }

    pub fn snapshot_chunk(index: LogIndex, term: Term, data: Vec<u8>) -> Self {
        Self { index, term, kind: EntryKind::SnapshotChunk { data } }
    }

    pub fn snapshot_end(index: LogIndex, term: Term, total_len: u64) -> Self {
        Self { index, term, kind: EntryKind::SnapshotEnd { total_len } }
    }

    pub fn noop(index: LogIndex, term: Term) -> Self {
        Self { index, term, kind: EntryKind::NoOp }
    }

    /// Serialized size plus the WAL newline, for log size accounting.
    pub fn encoded_len(&self) -> u64 {
        serde_json::to_vec(self).map(|b| b.len() as u64 + 1).unwrap_or(0)
    }
}

struct StagedLog {
    entries: VecDeque<Entry>,
    size_bytes: u64,
}

/// Ordered, gap-free entry store.
pub struct PersistentLog {
    entries: VecDeque<Entry>,
    size_bytes: u64,
    store: Option<LogStore>,
    staged: Option<StagedLog>,
}

impl PersistentLog {
    /// Log with no durable backing (tests and embedded use).
    pub fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            size_bytes: 0,
            store: None,
            staged: None,
        }
    }

    /// Log backed by `store`, seeded with the recovered entries.
    pub fn open(store: LogStore, recovered: Vec<Entry>) -> Result<Self> {
        Self::check_contiguous(&recovered, None)?;
        let size_bytes = recovered.iter().map(Entry::encoded_len).sum();
        Ok(Self {
            entries: recovered.into(),
            size_bytes,
            store: Some(store),
            staged: None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the first retained entry, 0 when empty.
    pub fn first_index(&self) -> LogIndex {
        self.entries.front().map(|e| e.index).unwrap_or(0)
    }

    /// Index of the last entry, 0 when empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries.back().map(|e| e.index).unwrap_or(0)
    }

    /// Term of the last entry, 0 when empty.
    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(0)
    }

    /// Total serialized size of the retained window.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn get_entry(&self, index: LogIndex) -> Option<&Entry> {
        let first = self.first_index();
        if first == 0 || index < first || index > self.last_index() {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    /// Entries in index order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    fn check_contiguous(entries: &[Entry], after: Option<LogIndex>) -> Result<()> {
        let mut expected = after;
        for entry in entries {
            if let Some(prev) = expected {
                if entry.index != prev + 1 {
                    return Err(ReplicaError::NonContiguous {
                        expected: prev + 1,
                        got: entry.index,
                    });
                }
            }
            expected = Some(entry.index);
        }
        Ok(())
    }

    /// Append `entries` at the tail. The first entry must continue the
    /// current last index; an empty log accepts any starting index.
    pub fn append_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let after = if self.entries.is_empty() { None } else { Some(self.last_index()) };
        Self::check_contiguous(&entries, after)?;

        for entry in entries {
            self.size_bytes += entry.encoded_len();
            if self.staged.is_none() {
                if let Some(store) = self.store.as_mut() {
                    store.append(&entry)?;
                }
            }
            debug!("Log: appended entry {} (term {})", entry.index, entry.term);
            self.entries.push_back(entry);
        }
        Ok(())
    }

    /// Truncate the suffix so the last index becomes `index`.
    pub fn remove_after(&mut self, index: LogIndex) -> Result<()> {
        let before = self.entries.len();
        while self.entries.back().map(|e| e.index > index).unwrap_or(false) {
            if let Some(dropped) = self.entries.pop_back() {
                self.size_bytes -= dropped.encoded_len();
            }
        }
        if self.entries.len() != before {
            debug!("Log: truncated suffix after {}", index);
            self.sync_rewrite()?;
        }
        Ok(())
    }

    /// Drop the prefix so the first index becomes `index`.
    pub fn remove_before(&mut self, index: LogIndex) -> Result<()> {
        let before = self.entries.len();
        while self.entries.front().map(|e| e.index < index).unwrap_or(false) {
            if let Some(dropped) = self.entries.pop_front() {
                self.size_bytes -= dropped.encoded_len();
            }
        }
        if self.entries.len() != before {
            debug!("Log: dropped prefix before {}", index);
            self.sync_rewrite()?;
        }
        Ok(())
    }

    /// Insert `entries` immediately before the current first index. On an
    /// empty log the sequence is installed as-is.
    pub fn prepend_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        Self::check_contiguous(&entries, None)?;
        if let Some(front) = self.entries.front() {
            let tail = entries.last().map(|e| e.index).unwrap_or(0);
            if tail + 1 != front.index {
                return Err(ReplicaError::NonContiguous {
                    expected: front.index.saturating_sub(1),
                    got: tail,
                });
            }
        }
        for entry in entries.into_iter().rev() {
            self.size_bytes += entry.encoded_len();
            self.entries.push_front(entry);
        }
        self.sync_rewrite()
    }

    /// Open the staged window. Mutations stop reaching disk until
    /// `commit()` or `restore()` closes it.
    pub fn backup(&mut self) {
        self.staged = Some(StagedLog {
            entries: self.entries.clone(),
            size_bytes: self.size_bytes,
        });
    }

    /// Close the staged window keeping the staged mutations, rewriting the
    /// durable file once. On rewrite failure the window stays open so
    /// `restore()` can still roll back.
    pub fn commit(&mut self) -> Result<()> {
        if self.staged.is_some() {
            if let Some(store) = self.store.as_mut() {
                store.rewrite(self.entries.iter())?;
            }
            self.staged = None;
        }
        Ok(())
    }

    /// Close the staged window discarding every mutation since `backup()`.
    pub fn restore(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.entries = staged.entries;
            self.size_bytes = staged.size_bytes;
        }
    }

    fn sync_rewrite(&mut self) -> Result<()> {
        if self.staged.is_none() {
            if let Some(store) = self.store.as_mut() {
                store.rewrite(self.entries.iter())?;
            }
        }
        Ok(())
    }
}
