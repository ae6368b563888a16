//! Snapshot construction and log compaction.
//!
//! Snapshots are ordinary log entries: a `SnapshotStart` carrying the
//! membership, a run of `SnapshotChunk` slices, and a `SnapshotEnd` with
//! the total byte length. They replicate like any other entry and replace
//! the applied log prefix during compaction.

use crate::cluster::MemberId;
use crate::context::ReplicaContext;
use crate::error::Result;
use crate::log::{Entry, EntryKind, LogIndex, Term};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// A reassembled snapshot ready to install.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedSnapshot {
    pub term: Term,
    pub members: BTreeSet<MemberId>,
    pub data: Vec<u8>,
}

impl CombinedSnapshot {
    /// Reassemble from `[Start, Chunks…, End]` in forward order. Returns
    /// `None` when the shape is wrong or the declared length mismatches.
    pub fn from_entries(entries: &[Entry]) -> Option<Self> {
        let (start, rest) = entries.split_first()?;
        let (end, chunks) = rest.split_last()?;

        let members = match &start.kind {
            EntryKind::SnapshotStart { members } => members.clone(),
            _ => return None,
        };
        let total_len = match &end.kind {
            EntryKind::SnapshotEnd { total_len } => *total_len,
            _ => return None,
        };

        let mut data = Vec::with_capacity(total_len as usize);
        for chunk in chunks {
            match &chunk.kind {
                EntryKind::SnapshotChunk { data: slice } => data.extend_from_slice(slice),
                _ => return None,
            }
        }
        if data.len() as u64 != total_len {
            warn!(
                "Snapshot: declared {} bytes but assembled {}",
                total_len,
                data.len()
            );
            return None;
        }

        Some(Self { term: start.term, members, data })
    }
}

/// Build the snapshot entry sequence for `data`, starting at `first_index`.
pub fn chunk_entries(
    data: &[u8],
    term: Term,
    members: BTreeSet<MemberId>,
    chunk_bytes: usize,
    first_index: LogIndex,
) -> Vec<Entry> {
    let mut entries = vec![Entry::snapshot_start(first_index, term, members)];
    let mut index = first_index + 1;
    for chunk in data.chunks(chunk_bytes) {
        entries.push(Entry::snapshot_chunk(index, term, chunk.to_vec()));
        index += 1;
    }
    entries.push(Entry::snapshot_end(index, term, data.len() as u64));
    entries
}

/// Compact the log if it exceeds the configured size threshold.
///
/// The applied prefix is replaced by freshly built snapshot entries under
/// the log's backup/commit/restore window; any failure rolls back to the
/// pre-compaction state and the engine continues.
pub fn maybe_compact(ctx: &mut ReplicaContext) {
    if ctx.log.size_bytes() <= ctx.config.max_log_bytes {
        return;
    }

    ctx.log.backup();
    match compact(ctx) {
        Ok(true) => {
            if let Err(e) = ctx.log.commit() {
                warn!("Snapshot: compaction commit failed, restoring: {}", e);
                ctx.log.restore();
            } else {
                info!(
                    "Snapshot: compacted log, first index now {} ({} bytes)",
                    ctx.log.first_index(),
                    ctx.log.size_bytes()
                );
            }
        }
        Ok(false) => ctx.log.restore(),
        Err(e) => {
            warn!("Snapshot: compaction failed, restoring: {}", e);
            ctx.log.restore();
        }
    }
}

fn compact(ctx: &mut ReplicaContext) -> Result<bool> {
    let data = ctx.machine.snapshot()?;
    let chunk_count = data.chunks(ctx.config.snapshot_chunk_bytes).count() as u64;
    let entry_count = chunk_count + 2;

    // Nothing worth replacing below the applied prefix.
    if ctx.last_applied <= entry_count {
        return Ok(false);
    }

    let first = ctx.last_applied - entry_count + 1;
    let entries = chunk_entries(
        &data,
        ctx.current_term,
        ctx.cluster.members(),
        ctx.config.snapshot_chunk_bytes,
        first,
    );

    ctx.log.remove_before(ctx.last_applied + 1)?;
    ctx.log.prepend_entries(entries)?;
    Ok(true)
}
