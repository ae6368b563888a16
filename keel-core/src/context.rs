//! Replica context: the hub that owns consensus state.
//!
//! The context owns the log, the state machine, the cluster view, and the
//! scalar election/commit state. Role and replication logic receive a
//! mutable borrow per operation; nothing holds a reference back into the
//! context across operations.

use crate::cluster::{ClusterView, MemberId};
use crate::config::ReplicaConfig;
use crate::log::{LogIndex, PersistentLog, Term};
use crate::role::Role;
use crate::state_machine::StateMachine;
use crate::storage::{VoteState, VoteStore};
use std::io;
use tokio::sync::broadcast;

/// Capacity of the event bus; slow subscribers lose old events.
const EVENT_BUS_CAPACITY: usize = 64;

/// Notifications published on the replica event bus.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A vote was granted in `term` to `candidate` (self-votes included).
    VoteCast { term: Term, candidate: MemberId },
    /// The replica changed role.
    RoleChanged { role: Role, leader: Option<MemberId> },
    /// A command entry was applied to the state machine.
    Applied { index: LogIndex, command: String },
}

/// Per-replica state hub.
pub struct ReplicaContext {
    pub(crate) config: ReplicaConfig,
    pub(crate) cluster: ClusterView,
    pub(crate) log: PersistentLog,
    pub(crate) machine: Box<dyn StateMachine>,

    /// Durable: latest term seen.
    pub(crate) current_term: Term,
    /// Durable: candidate voted for in the current term.
    pub(crate) voted_for: Option<MemberId>,
    /// Volatile: leader observed for the current term.
    pub(crate) current_leader: Option<MemberId>,
    /// Volatile: highest index known committed.
    pub(crate) commit_index: LogIndex,
    /// Volatile: highest index applied to the state machine.
    pub(crate) last_applied: LogIndex,

    vote_store: Option<VoteStore>,
    events: broadcast::Sender<ReplicaEvent>,
}

impl ReplicaContext {
    pub fn new(
        config: ReplicaConfig,
        cluster: ClusterView,
        log: PersistentLog,
        machine: Box<dyn StateMachine>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            config,
            cluster,
            log,
            machine,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            commit_index: 0,
            last_applied: 0,
            vote_store: None,
            events,
        }
    }

    /// Attach a durable vote store and adopt its recovered state.
    pub fn with_vote_store(mut self, store: VoteStore, recovered: VoteState) -> Self {
        self.current_term = recovered.current_term;
        self.voted_for = recovered.voted_for;
        self.vote_store = Some(store);
        self
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&MemberId> {
        self.voted_for.as_ref()
    }

    pub fn leader(&self) -> Option<&MemberId> {
        self.current_leader.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn cluster(&self) -> &ClusterView {
        &self.cluster
    }

    pub fn log(&self) -> &PersistentLog {
        &self.log
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn machine(&self) -> &dyn StateMachine {
        &*self.machine
    }

    /// Subscribe to the replica event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: ReplicaEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Write `(current_term, voted_for)` to the vote store, if attached.
    /// Must succeed before a vote-grant reply is emitted.
    pub(crate) fn persist_vote(&self) -> io::Result<()> {
        if let Some(store) = &self.vote_store {
            store.save(&VoteState {
                current_term: self.current_term,
                voted_for: self.voted_for.clone(),
            })?;
        }
        Ok(())
    }
}
