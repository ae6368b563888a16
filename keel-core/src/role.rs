//! Role state machine: Follower → Candidate → Leader.
//!
//! Drives election timeouts, vote solicitation, leader replication
//! cursors, and the completion of pending submit futures. Incoming-request
//! handling lives in `replication`; this module reacts to ticks and to
//! peer responses, and is the only place that moves the role.

use crate::apply::{self, AppliedCommand};
use crate::cluster::MemberId;
use crate::config::ReplicaConfig;
use crate::context::{ReplicaContext, ReplicaEvent};
use crate::error::ReplicaError;
use crate::log::{Entry, LogIndex};
use crate::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, Outbound, PeerMessage, RequestVoteRequest,
    RequestVoteResponse, SubmitCommandRequest, SubmitCommandResponse,
};
use crate::replication;
use crate::snapshot;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum entries per AppendEntries batch.
pub const MAX_APPEND_BATCH: usize = 8;

/// Role in the consensus cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Passive participant, accepts entries from the leader.
    Follower,
    /// Attempting to become leader.
    Candidate,
    /// Active leader, handles all client commands.
    Leader,
}

impl Default for Role {
    fn default() -> Self {
        Role::Follower
    }
}

/// Replication cursor for a single follower (leader side).
#[derive(Debug, Clone)]
pub struct FollowerCursor {
    /// Next index to send to this follower.
    pub next_index: LogIndex,
    /// Highest index known replicated on this follower.
    pub match_index: LogIndex,
    /// Last time this follower responded.
    pub last_contact: Instant,
}

struct PendingSubmit {
    request_id: Uuid,
    reply: oneshot::Sender<SubmitCommandResponse>,
}

/// The Follower/Candidate/Leader FSM.
pub struct RoleMachine {
    role: Role,
    election_deadline: Instant,
    votes: HashSet<MemberId>,
    cursors: HashMap<MemberId, FollowerCursor>,
    pending: BTreeMap<LogIndex, PendingSubmit>,
}

impl RoleMachine {
    pub fn new(config: &ReplicaConfig) -> Self {
        Self {
            role: Role::Follower,
            election_deadline: Instant::now() + random_election_timeout(config),
            votes: HashSet::new(),
            cursors: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// A valid leader was heard from (or a vote was granted); push the
    /// election deadline out.
    pub fn record_leader_contact(&mut self, ctx: &ReplicaContext) {
        self.election_deadline = Instant::now() + random_election_timeout(&ctx.config);
    }

    /// Periodic driver: fires elections on followers/candidates, pushes
    /// replication on leaders. Called at the heartbeat interval.
    pub fn tick(&mut self, ctx: &mut ReplicaContext) -> Vec<Outbound> {
        match self.role {
            Role::Follower | Role::Candidate => {
                if Instant::now() >= self.election_deadline {
                    return self.start_election(ctx);
                }
                Vec::new()
            }
            Role::Leader => self.replicate_all(ctx),
        }
    }

    /// Bump the term, vote for ourselves through the regular handler, and
    /// solicit the rest of the cluster.
    pub fn start_election(&mut self, ctx: &mut ReplicaContext) -> Vec<Outbound> {
        ctx.current_term += 1;
        ctx.current_leader = None;
        let old_role = self.role;
        self.role = Role::Candidate;
        self.votes.clear();
        self.election_deadline = Instant::now() + random_election_timeout(&ctx.config);

        info!(
            "Role: starting election for term {} (was {:?})",
            ctx.current_term, old_role
        );
        if old_role != Role::Candidate {
            ctx.publish(ReplicaEvent::RoleChanged {
                role: Role::Candidate,
                leader: None,
            });
        }

        let req = RequestVoteRequest {
            id: Uuid::new_v4(),
            term: ctx.current_term,
            candidate: ctx.cluster.local().clone(),
            last_log_index: ctx.log.last_index(),
            last_log_term: ctx.log.last_term(),
        };

        let (own, _) = replication::handle_request_vote(ctx, &req);
        if own.vote_granted {
            self.votes.insert(ctx.cluster.local().clone());
        }

        let mut out = vec![Outbound::Broadcast(PeerMessage::RequestVote(req))];
        if self.votes.len() >= ctx.cluster.quorum() {
            out.extend(self.become_leader(ctx));
        }
        out
    }

    /// Count a vote response; assume leadership on majority.
    pub fn handle_vote_response(
        &mut self,
        ctx: &mut ReplicaContext,
        from: &MemberId,
        resp: &RequestVoteResponse,
    ) -> Vec<Outbound> {
        if resp.term > ctx.current_term {
            self.observe_higher_term(ctx, resp.term);
            return Vec::new();
        }
        if self.role != Role::Candidate
            || resp.term != ctx.current_term
            || !resp.vote_granted
            || !ctx.cluster.contains(from)
        {
            return Vec::new();
        }

        self.votes.insert(from.clone());
        info!(
            "Role: vote from {} ({}/{})",
            from,
            self.votes.len(),
            ctx.cluster.members().len()
        );
        if self.votes.len() >= ctx.cluster.quorum() {
            return self.become_leader(ctx);
        }
        Vec::new()
    }

    fn become_leader(&mut self, ctx: &mut ReplicaContext) -> Vec<Outbound> {
        info!(
            "Role: won election for term {} with {}/{} votes",
            ctx.current_term,
            self.votes.len(),
            ctx.cluster.members().len()
        );
        self.role = Role::Leader;
        ctx.current_leader = Some(ctx.cluster.local().clone());

        let next = ctx.log.last_index() + 1;
        self.cursors = ctx
            .cluster
            .remotes()
            .iter()
            .map(|m| {
                (
                    m.clone(),
                    FollowerCursor {
                        next_index: next,
                        match_index: 0,
                        last_contact: Instant::now(),
                    },
                )
            })
            .collect();

        // No-op to commit entries from previous terms.
        let noop = Entry::noop(ctx.log.last_index() + 1, ctx.current_term);
        if let Err(e) = ctx.log.append_entries(vec![noop]) {
            warn!("Role: failed to append leader no-op: {}", e);
        }

        ctx.publish(ReplicaEvent::RoleChanged {
            role: Role::Leader,
            leader: ctx.current_leader.clone(),
        });

        // A single-replica cluster commits by itself.
        self.advance_commit(ctx);
        self.replicate_all(ctx)
    }

    /// Drop back to Follower, abandoning any pending submissions.
    pub fn step_down(&mut self, ctx: &mut ReplicaContext) {
        let old_role = self.role;
        self.role = Role::Follower;
        self.votes.clear();
        self.cursors.clear();
        self.abandon_pending(ReplicaError::LeadershipLost);
        self.election_deadline = Instant::now() + random_election_timeout(&ctx.config);

        if old_role != Role::Follower {
            info!(
                "Role: stepped down from {:?} (term {})",
                old_role, ctx.current_term
            );
            ctx.publish(ReplicaEvent::RoleChanged {
                role: Role::Follower,
                leader: ctx.current_leader.clone(),
            });
        }
    }

    fn observe_higher_term(&mut self, ctx: &mut ReplicaContext, term: u64) {
        debug!(
            "Role: observed higher term {} (current {}), stepping down",
            term, ctx.current_term
        );
        ctx.current_term = term;
        ctx.voted_for = None;
        ctx.current_leader = None;
        if let Err(e) = ctx.persist_vote() {
            warn!("Role: failed to persist term {}: {}", term, e);
        }
        self.step_down(ctx);
    }

    /// Leader-side command ingestion. Non-leaders answer immediately.
    pub fn submit(
        &mut self,
        ctx: &mut ReplicaContext,
        req: SubmitCommandRequest,
        reply: oneshot::Sender<SubmitCommandResponse>,
    ) -> Vec<Outbound> {
        if self.role != Role::Leader {
            let _ = reply.send(replication::not_leader_response(&req));
            return Vec::new();
        }

        let index = ctx.log.last_index() + 1;
        let entry = Entry::command(index, ctx.current_term, req.command.clone(), req.args.clone());
        if let Err(e) = ctx.log.append_entries(vec![entry]) {
            let _ = reply.send(SubmitCommandResponse::err(req.id, e.to_string()));
            return Vec::new();
        }

        debug!("Role: accepted command {} at index {}", req.command, index);
        self.pending.insert(
            index,
            PendingSubmit {
                request_id: req.id,
                reply,
            },
        );
        self.advance_commit(ctx);
        self.replicate_all(ctx)
    }

    /// Leader-side cursor maintenance: advance on accept, back up on
    /// reject, keep pushing while the follower is behind.
    pub fn handle_append_response(
        &mut self,
        ctx: &mut ReplicaContext,
        from: &MemberId,
        resp: &AppendEntriesResponse,
    ) -> Vec<Outbound> {
        if resp.term > ctx.current_term {
            self.observe_higher_term(ctx, resp.term);
            return Vec::new();
        }
        if self.role != Role::Leader {
            return Vec::new();
        }

        {
            let cursor = match self.cursors.get_mut(from) {
                Some(cursor) => cursor,
                None => return Vec::new(),
            };
            cursor.last_contact = Instant::now();

            if resp.success {
                cursor.match_index = resp.last_log_index;
                cursor.next_index = resp.last_log_index + 1;
                debug!(
                    "Role: {} match_index={}, next_index={}",
                    from, cursor.match_index, cursor.next_index
                );
            } else {
                let backed = cursor.next_index.saturating_sub(1).max(1);
                cursor.next_index = backed.min(resp.last_log_index + 1);
                debug!("Role: {} rejected, next_index now {}", from, cursor.next_index);
            }
        }

        if resp.success {
            self.advance_commit(ctx);
        }

        let behind = self
            .cursors
            .get(from)
            .map(|c| c.next_index <= ctx.log.last_index())
            .unwrap_or(false);
        if behind {
            if let Some(msg) = self.build_append_for(ctx, from) {
                return vec![Outbound::Send(from.clone(), msg)];
            }
        }
        Vec::new()
    }

    /// Commit every current-term index replicated on a majority, then
    /// apply and complete the submit futures that became visible.
    fn advance_commit(&mut self, ctx: &mut ReplicaContext) {
        let quorum = ctx.cluster.quorum();
        let mut advanced = false;
        for n in (ctx.commit_index + 1)..=ctx.log.last_index() {
            let entry_term = match ctx.log.get_entry(n) {
                Some(entry) => entry.term,
                None => continue,
            };
            if entry_term != ctx.current_term {
                continue;
            }
            let count = 1 + self.cursors.values().filter(|c| c.match_index >= n).count();
            if count >= quorum {
                ctx.commit_index = n;
                advanced = true;
            }
        }
        if advanced {
            info!("Role: advanced commit index to {}", ctx.commit_index);
        }

        let applied = apply::apply_committed(ctx);
        self.complete_pending(&applied);
        snapshot::maybe_compact(ctx);
    }

    fn complete_pending(&mut self, applied: &[AppliedCommand]) {
        for cmd in applied {
            if let Some(pending) = self.pending.remove(&cmd.index) {
                let resp = match &cmd.result {
                    Ok(value) => SubmitCommandResponse::ok(pending.request_id, value.clone()),
                    Err(message) => SubmitCommandResponse::err(pending.request_id, message.clone()),
                };
                let _ = pending.reply.send(resp);
            }
        }
    }

    fn abandon_pending(&mut self, reason: ReplicaError) {
        let message = reason.to_string();
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending
                .reply
                .send(SubmitCommandResponse::err(pending.request_id, message.clone()));
        }
    }

    fn replicate_all(&self, ctx: &ReplicaContext) -> Vec<Outbound> {
        ctx.cluster
            .remotes()
            .iter()
            .filter_map(|m| {
                self.build_append_for(ctx, m)
                    .map(|msg| Outbound::Send(m.clone(), msg))
            })
            .collect()
    }

    fn build_append_for(&self, ctx: &ReplicaContext, member: &MemberId) -> Option<PeerMessage> {
        let cursor = self.cursors.get(member)?;
        let first = ctx.log.first_index();
        let mut next = cursor.next_index;
        if first > 0 && next < first {
            // The follower is behind our compacted head; the snapshot
            // entries sitting there bring it forward.
            next = first;
        }

        let prev_index = next - 1;
        let prev_term = ctx.log.get_entry(prev_index).map(|e| e.term).unwrap_or(0);

        let mut entries = Vec::new();
        let mut i = next;
        while i <= ctx.log.last_index() && entries.len() < MAX_APPEND_BATCH {
            match ctx.log.get_entry(i) {
                Some(entry) => entries.push(entry.clone()),
                None => break,
            }
            i += 1;
        }

        Some(PeerMessage::AppendEntries(AppendEntriesRequest {
            id: Uuid::new_v4(),
            term: ctx.current_term,
            leader_id: ctx.cluster.local().clone(),
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries,
            commit_index: ctx.commit_index,
        }))
    }
}

/// Randomized timeout within the configured election range.
fn random_election_timeout(config: &ReplicaConfig) -> Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}
