//! Peer wire protocol.
//!
//! The three replica operations and their responses, plus the envelope
//! used to frame them on the wire. Encoding is JSON with tagged variants;
//! the transport carrying the frames lives outside the engine.

use crate::cluster::MemberId;
use crate::log::{Entry, LogIndex, Term};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Leader → follower entry replication (empty `entries` = heartbeat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub id: Uuid,
    pub term: Term,
    pub leader_id: MemberId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    /// Leader's commit index.
    pub commit_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub id: Uuid,
    pub term: Term,
    pub success: bool,
    /// Responder's last log index, for cursor adjustment.
    pub last_log_index: LogIndex,
}

/// Candidate vote solicitation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub id: Uuid,
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub id: Uuid,
    pub term: Term,
    pub vote_granted: bool,
}

/// Client command submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCommandRequest {
    pub id: Uuid,
    pub command: String,
    pub args: serde_json::Value,
}

/// Either `result` or `error` is set, correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCommandResponse {
    pub id: Uuid,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl SubmitCommandResponse {
    pub fn ok(id: Uuid, result: serde_json::Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    pub fn err(id: Uuid, message: impl Into<String>) -> Self {
        Self { id, result: None, error: Some(message.into()) }
    }
}

/// Wire envelope for peer traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    #[serde(rename = "APPEND_ENTRIES")]
    AppendEntries(AppendEntriesRequest),

    #[serde(rename = "APPEND_ENTRIES_RESPONSE")]
    AppendEntriesResponse(AppendEntriesResponse),

    #[serde(rename = "REQUEST_VOTE")]
    RequestVote(RequestVoteRequest),

    #[serde(rename = "REQUEST_VOTE_RESPONSE")]
    RequestVoteResponse(RequestVoteResponse),

    #[serde(rename = "SUBMIT_COMMAND")]
    SubmitCommand(SubmitCommandRequest),

    #[serde(rename = "SUBMIT_COMMAND_RESPONSE")]
    SubmitCommandResponse(SubmitCommandResponse),
}

impl PeerMessage {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Outgoing peer traffic emitted by the replica loop.
#[derive(Debug)]
pub enum Outbound {
    /// Deliver to one member.
    Send(MemberId, PeerMessage),
    /// Deliver to every remote member.
    Broadcast(PeerMessage),
}
