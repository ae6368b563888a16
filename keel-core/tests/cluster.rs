//! Deterministic multi-replica scenarios.
//!
//! Three replicas wired by hand: outbound traffic is routed through an
//! in-memory queue, elections are triggered explicitly, and no timers are
//! involved, so every run takes the same path.

use keel_core::cluster::ClusterView;
use keel_core::config::ReplicaConfig;
use keel_core::context::ReplicaContext;
use keel_core::log::{Entry, PersistentLog};
use keel_core::protocol::{Outbound, PeerMessage, SubmitCommandRequest, SubmitCommandResponse};
use keel_core::replication;
use keel_core::role::{Role, RoleMachine};
use keel_core::state_machine::KvStateMachine;
use keel_core::MemberId;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use tokio::sync::oneshot;
use uuid::Uuid;

struct TestReplica {
    id: MemberId,
    ctx: ReplicaContext,
    roles: RoleMachine,
}

impl TestReplica {
    fn new(id: &str, members: &[&str]) -> Self {
        let config = ReplicaConfig::default();
        let ctx = ReplicaContext::new(
            config.clone(),
            ClusterView::new(id.to_string(), members.iter().map(|m| m.to_string())),
            PersistentLog::in_memory(),
            Box::new(KvStateMachine::new()),
        );
        Self {
            id: id.to_string(),
            ctx,
            roles: RoleMachine::new(&config),
        }
    }
}

struct Cluster {
    replicas: Vec<TestReplica>,
    queue: VecDeque<(MemberId, MemberId, PeerMessage)>, // (target, from, message)
    partitioned: HashSet<MemberId>,
}

impl Cluster {
    fn new(members: &[&str]) -> Self {
        Self {
            replicas: members.iter().map(|m| TestReplica::new(m, members)).collect(),
            queue: VecDeque::new(),
            partitioned: HashSet::new(),
        }
    }

    fn replica(&self, id: &str) -> &TestReplica {
        self.replicas.iter().find(|r| r.id == id).unwrap()
    }

    fn replica_mut(&mut self, id: &str) -> &mut TestReplica {
        self.replicas.iter_mut().find(|r| r.id == id).unwrap()
    }

    fn partition(&mut self, id: &str) {
        self.partitioned.insert(id.to_string());
    }

    fn heal(&mut self, id: &str) {
        self.partitioned.remove(id);
    }

    fn enqueue(&mut self, from: &MemberId, messages: Vec<Outbound>) {
        let members: Vec<MemberId> = self.replicas.iter().map(|r| r.id.clone()).collect();
        for message in messages {
            match message {
                Outbound::Send(target, msg) => {
                    self.queue.push_back((target, from.clone(), msg));
                }
                Outbound::Broadcast(msg) => {
                    for member in members.iter().filter(|m| **m != *from) {
                        self.queue.push_back((member.clone(), from.clone(), msg.clone()));
                    }
                }
            }
        }
    }

    /// Route queued messages until the cluster is quiet.
    fn pump(&mut self) {
        while let Some((target, from, msg)) = self.queue.pop_front() {
            if self.partitioned.contains(&target) || self.partitioned.contains(&from) {
                continue;
            }
            let replies = {
                let replica = self.replica_mut(&target);
                match msg {
                    PeerMessage::AppendEntries(req) => {
                        let (resp, step_down) =
                            replication::handle_append_entries(&mut replica.ctx, &req);
                        if step_down {
                            replica.roles.step_down(&mut replica.ctx);
                        }
                        vec![Outbound::Send(
                            from.clone(),
                            PeerMessage::AppendEntriesResponse(resp),
                        )]
                    }
                    PeerMessage::RequestVote(req) => {
                        let (resp, step_down) =
                            replication::handle_request_vote(&mut replica.ctx, &req);
                        if step_down {
                            replica.roles.step_down(&mut replica.ctx);
                        }
                        vec![Outbound::Send(
                            from.clone(),
                            PeerMessage::RequestVoteResponse(resp),
                        )]
                    }
                    PeerMessage::AppendEntriesResponse(resp) => {
                        replica.roles.handle_append_response(&mut replica.ctx, &from, &resp)
                    }
                    PeerMessage::RequestVoteResponse(resp) => {
                        replica.roles.handle_vote_response(&mut replica.ctx, &from, &resp)
                    }
                    other => panic!("unexpected message {:?}", other),
                }
            };
            self.enqueue(&target, replies);
        }
    }

    fn start_election(&mut self, id: &str) {
        let out = {
            let replica = self.replica_mut(id);
            replica.roles.start_election(&mut replica.ctx)
        };
        self.enqueue(&id.to_string(), out);
        self.pump();
    }

    fn submit(
        &mut self,
        id: &str,
        command: &str,
        args: serde_json::Value,
    ) -> oneshot::Receiver<SubmitCommandResponse> {
        let (tx, rx) = oneshot::channel();
        let out = {
            let replica = self.replica_mut(id);
            replica.roles.submit(
                &mut replica.ctx,
                SubmitCommandRequest {
                    id: Uuid::new_v4(),
                    command: command.to_string(),
                    args,
                },
                tx,
            )
        };
        self.enqueue(&id.to_string(), out);
        self.pump();
        rx
    }

    fn leaders(&self) -> Vec<&TestReplica> {
        self.replicas.iter().filter(|r| r.roles.is_leader()).collect()
    }

    fn entries_of(&self, id: &str) -> Vec<Entry> {
        self.replica(id).ctx.log().iter().cloned().collect()
    }
}

#[test]
fn test_election_safety() {
    let mut cluster = Cluster::new(&["a", "b", "c"]);

    cluster.start_election("a");

    let leaders = cluster.leaders();
    assert_eq!(leaders.len(), 1);
    assert_eq!(leaders[0].id, "a");
    let term_one = leaders[0].ctx.current_term();

    // A later election moves leadership without ever producing two
    // leaders for one term.
    cluster.start_election("b");

    let leaders = cluster.leaders();
    assert_eq!(leaders.len(), 1);
    assert_eq!(leaders[0].id, "b");
    assert!(leaders[0].ctx.current_term() > term_one);
    assert_eq!(cluster.replica("a").roles.role(), Role::Follower);
}

#[test]
fn test_replicated_logs_match() {
    let mut cluster = Cluster::new(&["a", "b", "c"]);
    cluster.start_election("a");

    for i in 1..=3 {
        let mut rx = cluster.submit("a", "put", json!({"key": format!("k{}", i), "value": i}));
        let resp = rx.try_recv().expect("command should commit");
        assert!(resp.error.is_none());
    }

    // A heartbeat round carries the final commit index to the followers.
    let out = {
        let replica = cluster.replica_mut("a");
        replica.roles.tick(&mut replica.ctx)
    };
    cluster.enqueue(&"a".to_string(), out);
    cluster.pump();

    let log_a = cluster.entries_of("a");
    let log_b = cluster.entries_of("b");
    let log_c = cluster.entries_of("c");
    assert_eq!(log_a, log_b);
    assert_eq!(log_a, log_c);

    // Matching logs, matching machines.
    let state_a = cluster.replica("a").ctx.machine().snapshot().unwrap();
    let state_b = cluster.replica("b").ctx.machine().snapshot().unwrap();
    let state_c = cluster.replica("c").ctx.machine().snapshot().unwrap();
    assert_eq!(state_a, state_b);
    assert_eq!(state_a, state_c);
}

#[test]
fn test_leader_completeness() {
    let mut cluster = Cluster::new(&["a", "b", "c"]);
    cluster.start_election("a");

    // Commit an entry while c is unreachable: a and b form the quorum.
    cluster.partition("c");
    let mut rx = cluster.submit("a", "put", json!({"key": "durable", "value": 1}));
    assert!(rx.try_recv().expect("quorum of two commits").error.is_none());
    cluster.heal("c");

    // The stale replica cannot win an election...
    cluster.start_election("c");
    assert_eq!(cluster.replica("c").roles.role(), Role::Candidate);
    assert!(cluster.leaders().is_empty());

    // ...but an up-to-date one can, and it carries the committed entry.
    cluster.start_election("b");
    let leaders = cluster.leaders();
    assert_eq!(leaders.len(), 1);
    assert_eq!(leaders[0].id, "b");
    let has_entry = cluster.entries_of("b").iter().any(|e| {
        matches!(&e.kind, keel_core::EntryKind::Command { name, args }
            if name == "put" && args["key"] == json!("durable"))
    });
    assert!(has_entry);
}

#[test]
fn test_follower_catches_up_after_partition() {
    let mut cluster = Cluster::new(&["a", "b", "c"]);
    cluster.start_election("a");

    cluster.partition("c");
    for i in 1..=4 {
        cluster.submit("a", "put", json!({"key": format!("k{}", i), "value": i}));
    }
    cluster.heal("c");

    // The next leader push walks c forward entry by entry.
    let out = {
        let replica = cluster.replica_mut("a");
        replica.roles.tick(&mut replica.ctx)
    };
    cluster.enqueue(&"a".to_string(), out);
    cluster.pump();

    assert_eq!(cluster.entries_of("c"), cluster.entries_of("a"));
    assert_eq!(
        cluster.replica("c").ctx.last_applied(),
        cluster.replica("a").ctx.last_applied()
    );
}
