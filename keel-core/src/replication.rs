//! Incoming-request handlers: AppendEntries, RequestVote, SubmitCommand.
//!
//! Each handler mutates the context and returns its response together with
//! a flag arming a post-reply transition to Follower. The caller must send
//! the reply before firing the transition so the responding term is always
//! the term that decided the outcome.

use crate::apply;
use crate::context::{ReplicaContext, ReplicaEvent};
use crate::error::{ReplicaError, Result};
use crate::log::EntryKind;
use crate::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    SubmitCommandRequest, SubmitCommandResponse,
};
use crate::snapshot;
use tracing::{debug, error, info};

/// Handle an AppendEntries request. Returns the response and whether a
/// transition to Follower is armed to fire after the reply is sent.
pub fn handle_append_entries(
    ctx: &mut ReplicaContext,
    req: &AppendEntriesRequest,
) -> (AppendEntriesResponse, bool) {
    let mut step_down = false;

    // Term observation: adopt a newer term, or a newly revealed leader for
    // the current one. Fires even for a sitting Follower (no-op then).
    if req.term > ctx.current_term
        || (req.term == ctx.current_term && ctx.current_leader.is_none())
    {
        if req.term > ctx.current_term {
            ctx.voted_for = None;
        }
        ctx.current_term = req.term;
        ctx.current_leader = Some(req.leader_id.clone());
        if let Err(e) = ctx.persist_vote() {
            error!("Replication: failed to persist term {}: {}", req.term, e);
        }
        step_down = true;
    }

    // Stale leader.
    if req.term < ctx.current_term {
        debug!(
            "Replication: rejecting stale AppendEntries (term {} < {})",
            req.term, ctx.current_term
        );
        return (failure(ctx, req), step_down);
    }

    // Previous-entry consistency.
    if req.prev_log_index > 0 && req.prev_log_term > 0 {
        if req.prev_log_index > ctx.log.last_index() {
            debug!(
                "Replication: missing previous entry {} (last is {})",
                req.prev_log_index,
                ctx.log.last_index()
            );
            return (failure(ctx, req), step_down);
        }
        match ctx.log.get_entry(req.prev_log_index) {
            Some(entry) if entry.term == req.prev_log_term => {}
            _ => {
                debug!(
                    "Replication: previous entry {} does not match term {}",
                    req.prev_log_index, req.prev_log_term
                );
                return (failure(ctx, req), step_down);
            }
        }
    }

    // Append, truncating at the first term conflict.
    if let Err(e) = append_request_entries(ctx, req) {
        debug!("Replication: append rejected: {}", e);
        return (failure(ctx, req), step_down);
    }

    // Commit advance and apply; the max() guard doubles as a retry hook
    // after a failed earlier apply.
    ctx.commit_index = req
        .commit_index
        .max(ctx.commit_index)
        .min(ctx.log.last_index());
    apply::apply_committed(ctx);
    snapshot::maybe_compact(ctx);

    (
        AppendEntriesResponse {
            id: req.id,
            term: ctx.current_term,
            success: true,
            last_log_index: ctx.log.last_index(),
        },
        step_down,
    )
}

fn failure(ctx: &ReplicaContext, req: &AppendEntriesRequest) -> AppendEntriesResponse {
    AppendEntriesResponse {
        id: req.id,
        term: ctx.current_term,
        success: false,
        last_log_index: ctx.log.last_index(),
    }
}

fn append_request_entries(ctx: &mut ReplicaContext, req: &AppendEntriesRequest) -> Result<()> {
    for (k, entry) in req.entries.iter().enumerate() {
        let at = req.prev_log_index + k as u64 + 1;
        let first = ctx.log.first_index();
        if first > 0 && at < first {
            // Below the retained window: already covered by our snapshot.
            continue;
        }
        match ctx.log.get_entry(at) {
            Some(local) if local.term != entry.term => {
                ctx.log.remove_after(at - 1)?;
                ctx.log.append_entries(req.entries[k..].to_vec())?;
                return Ok(());
            }
            Some(_) => {} // already present and matching
            None => {
                let tail = req.entries[k..].to_vec();
                if !ctx.log.is_empty() && at > ctx.log.last_index() + 1 {
                    // A gap can only be bridged by a leader shipping its
                    // compacted head; the batch must open with a snapshot.
                    if matches!(tail[0].kind, EntryKind::SnapshotStart { .. }) {
                        ctx.log.remove_after(0)?;
                    } else {
                        return Err(ReplicaError::NonContiguous {
                            expected: ctx.log.last_index() + 1,
                            got: at,
                        });
                    }
                }
                ctx.log.append_entries(tail)?;
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Handle a RequestVote request. Returns the response and whether a
/// transition to Follower is armed (higher term observed).
pub fn handle_request_vote(
    ctx: &mut ReplicaContext,
    req: &RequestVoteRequest,
) -> (RequestVoteResponse, bool) {
    let mut step_down = false;

    if req.term > ctx.current_term {
        ctx.current_term = req.term;
        ctx.current_leader = None;
        ctx.voted_for = None;
        if let Err(e) = ctx.persist_vote() {
            error!("Replication: failed to persist term {}: {}", req.term, e);
        }
        step_down = true;
    }

    if req.term < ctx.current_term {
        debug!(
            "Replication: rejecting vote for {} (stale term {})",
            req.candidate, req.term
        );
        return (deny(ctx, req), step_down);
    }

    // The local candidate solicits itself through this handler.
    if req.candidate == *ctx.cluster.local() {
        return (grant(ctx, req), step_down);
    }

    if !ctx.cluster.contains(&req.candidate) {
        debug!("Replication: vote denied, {} is not a member", req.candidate);
        return (deny(ctx, req), step_down);
    }

    let can_vote =
        ctx.voted_for.is_none() || ctx.voted_for.as_ref() == Some(&req.candidate);
    if can_vote {
        let up_to_date = ctx.log.is_empty()
            || (req.last_log_index >= ctx.log.last_index()
                && req.last_log_term >= ctx.log.last_term());
        if up_to_date {
            return (grant(ctx, req), step_down);
        }
        debug!(
            "Replication: vote denied, {} log behind ({}, {}) < ({}, {})",
            req.candidate,
            req.last_log_term,
            req.last_log_index,
            ctx.log.last_term(),
            ctx.log.last_index()
        );
        return (deny(ctx, req), step_down);
    }

    debug!(
        "Replication: vote denied, already voted for {:?} in term {}",
        ctx.voted_for, ctx.current_term
    );
    (deny(ctx, req), step_down)
}

fn grant(ctx: &mut ReplicaContext, req: &RequestVoteRequest) -> RequestVoteResponse {
    ctx.voted_for = Some(req.candidate.clone());
    // The vote must be durable before the grant reply is emitted.
    if let Err(e) = ctx.persist_vote() {
        error!(
            "Replication: vote for {} not durable, denying: {}",
            req.candidate, e
        );
        ctx.voted_for = None;
        return deny(ctx, req);
    }
    info!(
        "Replication: granted vote to {} for term {}",
        req.candidate, ctx.current_term
    );
    ctx.publish(ReplicaEvent::VoteCast {
        term: ctx.current_term,
        candidate: req.candidate.clone(),
    });
    RequestVoteResponse {
        id: req.id,
        term: ctx.current_term,
        vote_granted: true,
    }
}

fn deny(ctx: &ReplicaContext, req: &RequestVoteRequest) -> RequestVoteResponse {
    RequestVoteResponse {
        id: req.id,
        term: ctx.current_term,
        vote_granted: false,
    }
}

/// Immediate response for a command submitted to a non-leader.
pub fn not_leader_response(req: &SubmitCommandRequest) -> SubmitCommandResponse {
    SubmitCommandResponse::err(req.id, ReplicaError::NotLeader.to_string())
}
