//! Client session manager.
//!
//! Collaborator-side machinery for the session protocol: OpenSession,
//! batched KeepAlive, CloseSession. The manager tracks per-session command
//! sequences and event indexes, follows leader hints, and falls back to
//! iterating the member list when the leader is unknown. The actual wire
//! send sits behind `SessionTransport` so tests can script it.

use crate::cluster::MemberId;
use crate::error::{ReplicaError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub id: Uuid,
    pub client: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub id: Uuid,
    pub session: Option<Uuid>,
    pub leader: Option<MemberId>,
    pub members: Vec<MemberId>,
    pub error: Option<String>,
}

/// One batched liveness probe for every open session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub id: Uuid,
    pub session_ids: Vec<Uuid>,
    pub command_sequences: Vec<u64>,
    pub event_indexes: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub id: Uuid,
    pub leader: Option<MemberId>,
    pub members: Vec<MemberId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub id: Uuid,
    pub session: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub id: Uuid,
    pub error: Option<String>,
}

/// Liveness state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Suspended,
}

/// Client-side session record.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: Uuid,
    pub timeout: Duration,
    pub state: SessionState,
    pub command_sequence: u64,
    pub event_index: u64,
}

/// Wire seam for session traffic.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn open_session(
        &self,
        target: &MemberId,
        req: OpenSessionRequest,
    ) -> Result<OpenSessionResponse>;

    async fn keep_alive(
        &self,
        target: &MemberId,
        req: KeepAliveRequest,
    ) -> Result<KeepAliveResponse>;

    async fn close_session(
        &self,
        target: &MemberId,
        req: CloseSessionRequest,
    ) -> Result<CloseSessionResponse>;
}

/// Rotates through the member list when no leader is known.
#[derive(Debug)]
struct MemberSelector {
    members: Vec<MemberId>,
    cursor: usize,
}

impl MemberSelector {
    fn new(members: Vec<MemberId>) -> Self {
        Self { members, cursor: 0 }
    }

    fn next(&mut self) -> Option<MemberId> {
        if self.members.is_empty() {
            return None;
        }
        let member = self.members[self.cursor % self.members.len()].clone();
        self.cursor += 1;
        Some(member)
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn update(&mut self, members: Vec<MemberId>) {
        if !members.is_empty() {
            self.members = members;
        }
    }
}

/// Manages a set of client sessions against the cluster.
pub struct SessionManager {
    client: String,
    transport: Arc<dyn SessionTransport>,
    sessions: HashMap<Uuid, ClientSession>,
    leader: Option<MemberId>,
    selector: MemberSelector,
    default_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        client: impl Into<String>,
        transport: Arc<dyn SessionTransport>,
        members: Vec<MemberId>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            client: client.into(),
            transport,
            sessions: HashMap::new(),
            leader: None,
            selector: MemberSelector::new(members),
            default_timeout,
        }
    }

    pub fn leader(&self) -> Option<&MemberId> {
        self.leader.as_ref()
    }

    pub fn session(&self, id: &Uuid) -> Option<&ClientSession> {
        self.sessions.get(id)
    }

    /// Keep-alive cadence: half the tightest session timeout.
    pub fn keep_alive_interval(&self) -> Duration {
        self.sessions
            .values()
            .map(|s| s.timeout)
            .min()
            .unwrap_or(self.default_timeout)
            / 2
    }

    fn target(&mut self) -> Option<MemberId> {
        self.leader.clone().or_else(|| self.selector.next())
    }

    /// Open a session with the given timeout.
    pub async fn open_session(&mut self, timeout: Duration) -> Result<Uuid> {
        let target = self.target().ok_or(ReplicaError::Unavailable)?;
        let req = OpenSessionRequest {
            id: Uuid::new_v4(),
            client: self.client.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let resp = self.transport.open_session(&target, req).await?;
        if let Some(message) = resp.error {
            return Err(ReplicaError::Transport(message));
        }
        let session_id = resp
            .session
            .ok_or_else(|| ReplicaError::Transport("open reply carried no session".to_string()))?;

        self.leader = resp.leader;
        self.selector.update(resp.members);
        self.sessions.insert(
            session_id,
            ClientSession {
                id: session_id,
                timeout,
                state: SessionState::Connected,
                command_sequence: 0,
                event_index: 0,
            },
        );
        info!("Session: opened {} via {}", session_id, target);
        Ok(session_id)
    }

    /// Close and forget a session.
    pub async fn close_session(&mut self, id: Uuid) -> Result<()> {
        self.sessions
            .remove(&id)
            .ok_or(ReplicaError::UnknownSession(id))?;
        if let Some(target) = self.target() {
            let req = CloseSessionRequest {
                id: Uuid::new_v4(),
                session: id,
            };
            if let Err(e) = self.transport.close_session(&target, req).await {
                warn!("Session: close of {} did not reach {}: {}", id, target, e);
            }
        }
        Ok(())
    }

    /// Record a submitted command for `id`; returns the new sequence.
    pub fn record_command(&mut self, id: &Uuid) -> Result<u64> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or(ReplicaError::UnknownSession(*id))?;
        session.command_sequence += 1;
        Ok(session.command_sequence)
    }

    /// Record the highest event index seen by `id`.
    pub fn record_event(&mut self, id: &Uuid, index: u64) -> Result<()> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or(ReplicaError::UnknownSession(*id))?;
        if index > session.event_index {
            session.event_index = index;
        }
        Ok(())
    }

    fn build_keep_alive(&self) -> KeepAliveRequest {
        let mut session_ids = Vec::with_capacity(self.sessions.len());
        let mut command_sequences = Vec::with_capacity(self.sessions.len());
        let mut event_indexes = Vec::with_capacity(self.sessions.len());
        for session in self.sessions.values() {
            session_ids.push(session.id);
            command_sequences.push(session.command_sequence);
            event_indexes.push(session.event_index);
        }
        KeepAliveRequest {
            id: Uuid::new_v4(),
            session_ids,
            command_sequences,
            event_indexes,
        }
    }

    /// One keep-alive round: try the leader (or the next selector pick);
    /// on failure with a known leader, clear it and retry once; on failure
    /// without one, suspend everything and reset the selector.
    pub async fn keep_alive_once(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let had_leader = self.leader.is_some();
        let target = match self.target() {
            Some(target) => target,
            None => return,
        };

        match self.transport.keep_alive(&target, self.build_keep_alive()).await {
            Ok(resp) if resp.error.is_none() => self.on_keep_alive_success(resp),
            outcome => {
                debug!("Session: keep-alive via {} failed: {:?}", target, outcome.err());
                if had_leader {
                    self.leader = None;
                    let retry = match self.selector.next() {
                        Some(member) => member,
                        None => {
                            self.suspend_all();
                            return;
                        }
                    };
                    match self.transport.keep_alive(&retry, self.build_keep_alive()).await {
                        Ok(resp) if resp.error.is_none() => self.on_keep_alive_success(resp),
                        _ => self.suspend_all(),
                    }
                } else {
                    self.suspend_all();
                }
            }
        }
    }

    fn on_keep_alive_success(&mut self, resp: KeepAliveResponse) {
        self.leader = resp.leader;
        self.selector.update(resp.members);
        for session in self.sessions.values_mut() {
            session.state = SessionState::Connected;
        }
    }

    fn suspend_all(&mut self) {
        warn!("Session: no reachable replica, suspending {} sessions", self.sessions.len());
        for session in self.sessions.values_mut() {
            session.state = SessionState::Suspended;
        }
        self.selector.reset();
    }

    /// Keep-alive loop; the cadence is recomputed after every round so
    /// session churn reschedules naturally.
    pub async fn run(mut self) {
        loop {
            tokio::time::sleep(self.keep_alive_interval()).await;
            self.keep_alive_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedTransport {
        keep_alive_outcomes: Mutex<VecDeque<Result<KeepAliveResponse>>>,
        keep_alive_targets: Mutex<Vec<MemberId>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<KeepAliveResponse>>) -> Arc<Self> {
            Arc::new(Self {
                keep_alive_outcomes: Mutex::new(outcomes.into()),
                keep_alive_targets: Mutex::new(Vec::new()),
            })
        }

        fn ok_response(leader: Option<&str>) -> KeepAliveResponse {
            KeepAliveResponse {
                id: Uuid::new_v4(),
                leader: leader.map(|s| s.to_string()),
                members: vec![],
                error: None,
            }
        }

        fn targets(&self) -> Vec<MemberId> {
            self.keep_alive_targets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionTransport for ScriptedTransport {
        async fn open_session(
            &self,
            _target: &MemberId,
            req: OpenSessionRequest,
        ) -> Result<OpenSessionResponse> {
            Ok(OpenSessionResponse {
                id: req.id,
                session: Some(Uuid::new_v4()),
                leader: Some("a".to_string()),
                members: vec!["a".to_string(), "b".to_string(), "c".to_string()],
                error: None,
            })
        }

        async fn keep_alive(
            &self,
            target: &MemberId,
            _req: KeepAliveRequest,
        ) -> Result<KeepAliveResponse> {
            self.keep_alive_targets.lock().unwrap().push(target.clone());
            self.keep_alive_outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ReplicaError::Transport("unscripted".to_string())))
        }

        async fn close_session(
            &self,
            _target: &MemberId,
            req: CloseSessionRequest,
        ) -> Result<CloseSessionResponse> {
            Ok(CloseSessionResponse { id: req.id, error: None })
        }
    }

    fn members() -> Vec<MemberId> {
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    }

    #[tokio::test]
    async fn test_open_session_records_hints() {
        let transport = ScriptedTransport::new(vec![]);
        let mut manager = SessionManager::new(
            "client-1",
            transport,
            members(),
            Duration::from_secs(5),
        );

        let id = manager.open_session(Duration::from_secs(2)).await.unwrap();

        assert_eq!(manager.leader(), Some(&"a".to_string()));
        let session = manager.session(&id).unwrap();
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(manager.keep_alive_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_keep_alive_success_marks_connected() {
        let transport = ScriptedTransport::new(vec![Ok(ScriptedTransport::ok_response(Some("b")))]);
        let mut manager = SessionManager::new(
            "client-1",
            transport.clone(),
            members(),
            Duration::from_secs(5),
        );
        let id = manager.open_session(Duration::from_secs(2)).await.unwrap();

        manager.keep_alive_once().await;

        assert_eq!(manager.leader(), Some(&"b".to_string()));
        assert_eq!(manager.session(&id).unwrap().state, SessionState::Connected);
        assert_eq!(transport.targets(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_known_leader_failure_retries_once() {
        let transport = ScriptedTransport::new(vec![
            Err(ReplicaError::Transport("down".to_string())),
            Ok(ScriptedTransport::ok_response(Some("c"))),
        ]);
        let mut manager = SessionManager::new(
            "client-1",
            transport.clone(),
            members(),
            Duration::from_secs(5),
        );
        let id = manager.open_session(Duration::from_secs(2)).await.unwrap();

        manager.keep_alive_once().await;

        // First try hit the stale leader, the retry hit the selector pick.
        assert_eq!(transport.targets().len(), 2);
        assert_eq!(manager.leader(), Some(&"c".to_string()));
        assert_eq!(manager.session(&id).unwrap().state, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_double_failure_suspends_sessions() {
        let transport = ScriptedTransport::new(vec![
            Err(ReplicaError::Transport("down".to_string())),
            Err(ReplicaError::Transport("down".to_string())),
        ]);
        let mut manager = SessionManager::new(
            "client-1",
            transport,
            members(),
            Duration::from_secs(5),
        );
        let id = manager.open_session(Duration::from_secs(2)).await.unwrap();

        // Leader known: first round fails twice and suspends.
        manager.keep_alive_once().await;

        assert!(manager.leader().is_none());
        assert_eq!(manager.session(&id).unwrap().state, SessionState::Suspended);
    }

    #[tokio::test]
    async fn test_command_and_event_tracking() {
        let transport = ScriptedTransport::new(vec![]);
        let mut manager = SessionManager::new(
            "client-1",
            transport,
            members(),
            Duration::from_secs(5),
        );
        let id = manager.open_session(Duration::from_secs(2)).await.unwrap();

        assert_eq!(manager.record_command(&id).unwrap(), 1);
        assert_eq!(manager.record_command(&id).unwrap(), 2);
        manager.record_event(&id, 7).unwrap();
        manager.record_event(&id, 3).unwrap(); // stale index ignored
        let session = manager.session(&id).unwrap();
        assert_eq!(session.command_sequence, 2);
        assert_eq!(session.event_index, 7);

        let missing = Uuid::new_v4();
        assert!(matches!(
            manager.record_command(&missing),
            Err(ReplicaError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_close_unknown_session_errors() {
        let transport = ScriptedTransport::new(vec![]);
        let mut manager = SessionManager::new(
            "client-1",
            transport,
            members(),
            Duration::from_secs(5),
        );
        assert!(matches!(
            manager.close_session(Uuid::new_v4()).await,
            Err(ReplicaError::UnknownSession(_))
        ));
    }
}
