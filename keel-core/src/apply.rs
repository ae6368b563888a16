//! Committed-entry application.
//!
//! Entries are applied in strict index order. Command failures are
//! reported to the submitter but never stall the loop; snapshot install
//! failures are swallowed with `last_applied` still advancing so the log
//! cannot wedge. A missing entry at an applied index inside the retained
//! window is corruption and aborts the process.

use crate::context::{ReplicaContext, ReplicaEvent};
use crate::log::{Entry, EntryKind, LogIndex};
use crate::snapshot::CombinedSnapshot;
use tracing::{debug, info, warn};

/// Outcome of one applied command, for leader-side future completion.
#[derive(Debug)]
pub struct AppliedCommand {
    pub index: LogIndex,
    pub result: std::result::Result<serde_json::Value, String>,
}

/// Apply every committed entry past `last_applied`, in order.
pub fn apply_committed(ctx: &mut ReplicaContext) -> Vec<AppliedCommand> {
    let mut applied = Vec::new();
    while ctx.last_applied < ctx.commit_index {
        let next = ctx.last_applied + 1;
        let first = ctx.log.first_index();
        if first > 0 && next < first {
            // Everything below the retained window is covered by the
            // snapshot entries sitting at its head.
            ctx.last_applied = first - 1;
            continue;
        }
        apply_entry(ctx, next, &mut applied);
    }
    applied
}

fn apply_entry(ctx: &mut ReplicaContext, index: LogIndex, applied: &mut Vec<AppliedCommand>) {
    assert!(
        ctx.last_applied == index - 1,
        "entries must be applied in order: last_applied={} index={}",
        ctx.last_applied,
        index
    );

    let entry = match ctx.log.get_entry(index) {
        Some(entry) => entry.clone(),
        None => panic!("no entry at committed index {}", index),
    };

    match entry.kind {
        EntryKind::Command { name, args } => {
            let result = match ctx.machine.apply_command(&name, &args) {
                Ok(value) => Ok(value),
                Err(e) => {
                    warn!("Apply: command {} at {} failed: {}", name, index, e);
                    Err(e.to_string())
                }
            };
            ctx.last_applied = index;
            ctx.publish(ReplicaEvent::Applied {
                index,
                command: name,
            });
            applied.push(AppliedCommand { index, result });
        }
        EntryKind::Configuration { members } => {
            info!("Apply: configuration at {} ({} members)", index, members.len());
            ctx.cluster.replace_remotes(&members);
            ctx.last_applied = index;
        }
        EntryKind::SnapshotStart { .. } | EntryKind::SnapshotChunk { .. } => {
            // Meaningless alone; the terminating SnapshotEnd does the work.
            ctx.last_applied = index;
        }
        EntryKind::SnapshotEnd { .. } => match collect_snapshot_entries(ctx, index) {
            Some(entries) => apply_snapshot(ctx, index, entries),
            None => {
                debug!("Apply: snapshot end at {} without matching start", index);
                ctx.last_applied = index;
            }
        },
        EntryKind::NoOp => {
            ctx.last_applied = index;
        }
    }
}

/// Backward scan from `end_index - 1`, collecting contiguous chunks until
/// the matching start. Returns `[Start, Chunks…, End]` in forward order,
/// or `None` if a non-snapshot entry terminates the scan first.
fn collect_snapshot_entries(ctx: &ReplicaContext, end_index: LogIndex) -> Option<Vec<Entry>> {
    let first = ctx.log.first_index();
    if first == 0 || end_index <= first {
        return None;
    }

    let mut chunks: Vec<Entry> = Vec::new();
    let mut i = end_index - 1;
    while i >= first {
        let entry = ctx.log.get_entry(i)?;
        match &entry.kind {
            EntryKind::SnapshotChunk { .. } => chunks.push(entry.clone()),
            EntryKind::SnapshotStart { .. } => {
                let mut entries = Vec::with_capacity(chunks.len() + 2);
                entries.push(entry.clone());
                entries.extend(chunks.into_iter().rev());
                entries.push(ctx.log.get_entry(end_index)?.clone());
                return Some(entries);
            }
            _ => return None,
        }
        i -= 1;
    }
    None
}

/// Install a reassembled snapshot ending at `last_index` and drop the log
/// prefix it covers. `last_applied` advances regardless of failure.
pub fn apply_snapshot(ctx: &mut ReplicaContext, last_index: LogIndex, entries: Vec<Entry>) {
    let count = entries.len() as u64;
    match CombinedSnapshot::from_entries(&entries) {
        Some(snapshot) => {
            if let Err(e) = ctx.machine.install_snapshot(&snapshot.data) {
                warn!("Apply: snapshot install at {} failed: {}", last_index, e);
            } else {
                if let Err(e) = ctx.log.remove_before(last_index - count + 1) {
                    warn!("Apply: prefix removal after snapshot install failed: {}", e);
                }
                ctx.cluster.replace_remotes(&snapshot.members);
                if snapshot.term > ctx.current_term {
                    ctx.current_term = snapshot.term;
                    if let Err(e) = ctx.persist_vote() {
                        warn!("Apply: failed to persist snapshot term: {}", e);
                    }
                }
                info!(
                    "Apply: installed snapshot at {} ({} bytes)",
                    last_index,
                    snapshot.data.len()
                );
            }
        }
        None => warn!("Apply: malformed snapshot sequence ending at {}", last_index),
    }
    ctx.last_applied = last_index;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterView, MemberId};
    use crate::config::ReplicaConfig;
    use crate::log::PersistentLog;
    use crate::snapshot::chunk_entries;
    use crate::state_machine::KvStateMachine;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn members(ids: &[&str]) -> BTreeSet<MemberId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn context() -> ReplicaContext {
        ReplicaContext::new(
            ReplicaConfig::default(),
            ClusterView::new("a".to_string(), members(&["a", "b", "c"])),
            PersistentLog::in_memory(),
            Box::new(KvStateMachine::new()),
        )
    }

    fn kv_state(ctx: &ReplicaContext) -> serde_json::Value {
        serde_json::from_slice(&ctx.machine.snapshot().unwrap()).unwrap()
    }

    #[test]
    fn test_commands_applied_in_order() {
        let mut ctx = context();
        ctx.log
            .append_entries(vec![
                Entry::command(1, 1, "put".to_string(), json!({"key": "k", "value": 1})),
                Entry::command(2, 1, "put".to_string(), json!({"key": "k", "value": 2})),
                Entry::noop(3, 1),
            ])
            .unwrap();
        ctx.commit_index = 3;

        let applied = apply_committed(&mut ctx);

        assert_eq!(ctx.last_applied, 3);
        assert_eq!(applied.len(), 2);
        assert_eq!(kv_state(&ctx), json!({"k": 2}));
    }

    #[test]
    fn test_command_failure_still_advances() {
        let mut ctx = context();
        ctx.log
            .append_entries(vec![
                Entry::command(1, 1, "bogus".to_string(), json!({})),
                Entry::command(2, 1, "put".to_string(), json!({"key": "k", "value": 9})),
            ])
            .unwrap();
        ctx.commit_index = 2;

        let applied = apply_committed(&mut ctx);

        assert_eq!(ctx.last_applied, 2);
        assert!(applied[0].result.is_err());
        assert!(applied[1].result.is_ok());
        assert_eq!(kv_state(&ctx), json!({"k": 9}));
    }

    #[test]
    fn test_configuration_replaces_remotes() {
        let mut ctx = context();
        ctx.log
            .append_entries(vec![Entry::configuration(1, 1, members(&["a", "d", "e"]))])
            .unwrap();
        ctx.commit_index = 1;

        apply_committed(&mut ctx);

        assert_eq!(ctx.cluster.remotes(), &members(&["d", "e"]));
    }

    #[test]
    fn test_snapshot_end_installs() {
        // Snapshot entries at 10..13 over a live log; SnapshotEnd applies.
        let mut ctx = context();
        let payload = serde_json::to_vec(&json!({"k1": "ab", "k2": "cd"})).unwrap();
        let mut entries = vec![Entry::noop(9, 2)];
        entries.extend(chunk_entries(&payload, 3, members(&["a", "b", "c"]), 2, 10));
        let end_index = entries.last().unwrap().index;
        ctx.log.append_entries(entries).unwrap();
        ctx.last_applied = 8;
        ctx.commit_index = end_index;

        apply_committed(&mut ctx);

        assert_eq!(ctx.last_applied, end_index);
        assert_eq!(ctx.log.first_index(), 10);
        assert!(ctx.current_term >= 3);
        assert_eq!(kv_state(&ctx), json!({"k1": "ab", "k2": "cd"}));
    }

    #[test]
    fn test_snapshot_install_idempotent() {
        let mut ctx = context();
        let payload = serde_json::to_vec(&json!({"k": 1})).unwrap();
        let entries = chunk_entries(&payload, 2, members(&["a", "b"]), 4, 10);
        let end_index = entries.last().unwrap().index;
        ctx.log.append_entries(entries.clone()).unwrap();
        ctx.last_applied = end_index - 1;
        ctx.commit_index = end_index;

        apply_committed(&mut ctx);
        let state_once = kv_state(&ctx);
        let first_once = ctx.log.first_index();

        // Re-applying the same SnapshotEnd leaves the machine unchanged.
        apply_snapshot(&mut ctx, end_index, entries);
        assert_eq!(kv_state(&ctx), state_once);
        assert_eq!(ctx.log.first_index(), first_once);
    }

    #[test]
    fn test_snapshot_end_without_start_just_advances() {
        let mut ctx = context();
        ctx.log
            .append_entries(vec![
                Entry::noop(1, 1),
                Entry::snapshot_end(2, 1, 4),
            ])
            .unwrap();
        ctx.commit_index = 2;

        apply_committed(&mut ctx);

        assert_eq!(ctx.last_applied, 2);
        assert_eq!(ctx.log.first_index(), 1);
        assert_eq!(kv_state(&ctx), json!({}));
    }

    #[test]
    fn test_bad_snapshot_payload_swallowed() {
        let mut ctx = context();
        let entries = vec![
            Entry::snapshot_start(1, 1, members(&["a", "b"])),
            Entry::snapshot_chunk(2, 1, b"not json".to_vec()),
            Entry::snapshot_end(3, 1, 8),
        ];
        ctx.log.append_entries(entries).unwrap();
        ctx.commit_index = 3;

        apply_committed(&mut ctx);

        // Install failed but the loop did not wedge.
        assert_eq!(ctx.last_applied, 3);
        assert_eq!(ctx.log.first_index(), 1);
    }

    #[test]
    fn test_apply_skips_below_retained_window() {
        // A fresh replica whose log starts at a snapshot jumps straight to
        // the retained window instead of hunting for index 1.
        let mut ctx = context();
        let payload = serde_json::to_vec(&json!({"k": "v"})).unwrap();
        let entries = chunk_entries(&payload, 2, members(&["a", "b"]), 4, 20);
        let end_index = entries.last().unwrap().index;
        ctx.log.append_entries(entries).unwrap();
        ctx.commit_index = end_index;
        assert_eq!(ctx.last_applied, 0);

        apply_committed(&mut ctx);

        assert_eq!(ctx.last_applied, end_index);
        assert_eq!(kv_state(&ctx), json!({"k": "v"}));
    }

    #[test]
    #[should_panic(expected = "no entry at committed index")]
    fn test_missing_entry_is_fatal() {
        let mut ctx = context();
        ctx.log.append_entries(vec![Entry::noop(1, 1)]).unwrap();
        ctx.commit_index = 3; // beyond the log tail
        apply_committed(&mut ctx);
    }
}
