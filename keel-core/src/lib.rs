//! Keel Core Library
//!
//! Replica state engine for a leader-based consensus protocol: log
//! replication with consistency checks, leader election, commit-index
//! advancement, chunked snapshots shipped through the log, and compaction.
//! Transport, configuration loading, and client primitives live outside
//! this crate and talk to it through `ReplicaHandle` and the event bus.

pub mod apply;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod log;
pub mod protocol;
pub mod replica;
pub mod replication;
pub mod role;
pub mod session;
pub mod snapshot;
pub mod state_machine;
pub mod storage;

pub use cluster::{ClusterView, MemberId};
pub use config::ReplicaConfig;
pub use context::{ReplicaContext, ReplicaEvent};
pub use error::{ReplicaError, Result};
pub use log::{Entry, EntryKind, LogIndex, PersistentLog, Term};
pub use protocol::{
    AppendEntriesRequest, AppendEntriesResponse, Outbound, PeerMessage, RequestVoteRequest,
    RequestVoteResponse, SubmitCommandRequest, SubmitCommandResponse,
};
pub use replica::{Inbound, Replica, ReplicaHandle};
pub use role::{Role, RoleMachine};
pub use session::{SessionManager, SessionState, SessionTransport};
pub use snapshot::CombinedSnapshot;
pub use state_machine::{KvStateMachine, StateMachine};
pub use storage::{LogStore, VoteState, VoteStore};
