//! Error types for the Keel replica engine.

use thiserror::Error;
use uuid::Uuid;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Errors surfaced by the replica engine.
///
/// Protocol-level outcomes (stale term, log mismatch) are not errors; they
/// travel in-band as response fields. Ordering violations in the apply path
/// are programmer errors and panic instead of appearing here.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Command submitted to a replica that is not the leader.
    #[error("Not the leader")]
    NotLeader,

    /// The replica left the Leader role while the command was pending.
    #[error("leadership lost")]
    LeadershipLost,

    /// Log mutation would break index contiguity.
    #[error("log indices must be contiguous: expected {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },

    /// Session id not known to the session manager.
    #[error("unknown session {0}")]
    UnknownSession(Uuid),

    /// The replica task is no longer running.
    #[error("replica unavailable")]
    Unavailable,

    /// Transient transport failure; the caller may retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// Command name not recognized by the state machine.
    #[error("unknown command {0}")]
    UnknownCommand(String),

    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
