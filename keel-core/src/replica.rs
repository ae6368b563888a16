//! The replica event loop.
//!
//! All mutation of the context, log, and cluster view happens on one task.
//! Requests enter through a mailbox carrying a oneshot reply callback;
//! peer responses enter the same mailbox tagged with the sending member.
//! Replies are always sent before an armed role transition fires, so the
//! responding term is the term that decided the outcome.

use crate::cluster::MemberId;
use crate::context::ReplicaContext;
use crate::error::{ReplicaError, Result};
use crate::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, Outbound, RequestVoteRequest,
    RequestVoteResponse, SubmitCommandRequest, SubmitCommandResponse,
};
use crate::replication;
use crate::role::RoleMachine;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, warn};

/// Mailbox depth for incoming traffic.
const INBOX_CAPACITY: usize = 256;

/// Queue depth for outgoing peer traffic.
const OUTBOUND_CAPACITY: usize = 256;

/// Messages consumed by the replica task.
#[derive(Debug)]
pub enum Inbound {
    AppendEntries(AppendEntriesRequest, oneshot::Sender<AppendEntriesResponse>),
    RequestVote(RequestVoteRequest, oneshot::Sender<RequestVoteResponse>),
    SubmitCommand(SubmitCommandRequest, oneshot::Sender<SubmitCommandResponse>),
    AppendEntriesResponse(MemberId, AppendEntriesResponse),
    RequestVoteResponse(MemberId, RequestVoteResponse),
}

/// Cloneable ingress used by transports, clients, and tests.
#[derive(Clone)]
pub struct ReplicaHandle {
    tx: mpsc::Sender<Inbound>,
}

impl ReplicaHandle {
    pub async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Inbound::AppendEntries(req, tx))
            .await
            .map_err(|_| ReplicaError::Unavailable)?;
        rx.await.map_err(|_| ReplicaError::Unavailable)
    }

    pub async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Inbound::RequestVote(req, tx))
            .await
            .map_err(|_| ReplicaError::Unavailable)?;
        rx.await.map_err(|_| ReplicaError::Unavailable)
    }

    /// Submit a command. The future completes once the entry commits and
    /// applies, or immediately with an error on a non-leader.
    pub async fn submit_command(
        &self,
        req: SubmitCommandRequest,
    ) -> Result<SubmitCommandResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Inbound::SubmitCommand(req, tx))
            .await
            .map_err(|_| ReplicaError::Unavailable)?;
        rx.await.map_err(|_| ReplicaError::Unavailable)
    }

    /// Feed a peer's AppendEntries response back to the replica.
    pub async fn notify_append_response(
        &self,
        from: MemberId,
        resp: AppendEntriesResponse,
    ) -> Result<()> {
        self.tx
            .send(Inbound::AppendEntriesResponse(from, resp))
            .await
            .map_err(|_| ReplicaError::Unavailable)
    }

    /// Feed a peer's RequestVote response back to the replica.
    pub async fn notify_vote_response(
        &self,
        from: MemberId,
        resp: RequestVoteResponse,
    ) -> Result<()> {
        self.tx
            .send(Inbound::RequestVoteResponse(from, resp))
            .await
            .map_err(|_| ReplicaError::Unavailable)
    }
}

/// Single-task replica driver.
pub struct Replica {
    ctx: ReplicaContext,
    roles: RoleMachine,
    inbox: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<Outbound>,
}

impl Replica {
    /// Build a replica around `ctx`. Returns the driver, the ingress
    /// handle, and the outgoing-traffic queue the transport must drain.
    pub fn new(ctx: ReplicaContext) -> (Self, ReplicaHandle, mpsc::Receiver<Outbound>) {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let roles = RoleMachine::new(ctx.config());
        (
            Self {
                ctx,
                roles,
                inbox: inbox_rx,
                outbound: outbound_tx,
            },
            ReplicaHandle { tx: inbox_tx },
            outbound_rx,
        )
    }

    /// Run until every handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = interval(self.ctx.config().heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let out = self.roles.tick(&mut self.ctx);
                    self.dispatch(out).await;
                }
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => {
                        debug!("Replica: mailbox closed, shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: Inbound) {
        match msg {
            Inbound::AppendEntries(req, reply) => {
                let (resp, step_down) = replication::handle_append_entries(&mut self.ctx, &req);
                let valid_leader = req.term == self.ctx.current_term();
                // Reply before any armed transition fires.
                let _ = reply.send(resp);
                if step_down {
                    self.roles.step_down(&mut self.ctx);
                }
                if valid_leader {
                    self.roles.record_leader_contact(&self.ctx);
                }
            }
            Inbound::RequestVote(req, reply) => {
                let (resp, step_down) = replication::handle_request_vote(&mut self.ctx, &req);
                let granted = resp.vote_granted;
                let _ = reply.send(resp);
                if step_down {
                    self.roles.step_down(&mut self.ctx);
                }
                if granted {
                    // Granting a vote defers our own candidacy.
                    self.roles.record_leader_contact(&self.ctx);
                }
            }
            Inbound::SubmitCommand(req, reply) => {
                let out = self.roles.submit(&mut self.ctx, req, reply);
                self.dispatch(out).await;
            }
            Inbound::AppendEntriesResponse(from, resp) => {
                let out = self.roles.handle_append_response(&mut self.ctx, &from, &resp);
                self.dispatch(out).await;
            }
            Inbound::RequestVoteResponse(from, resp) => {
                let out = self.roles.handle_vote_response(&mut self.ctx, &from, &resp);
                self.dispatch(out).await;
            }
        }
    }

    async fn dispatch(&self, messages: Vec<Outbound>) {
        for message in messages {
            if self.outbound.send(message).await.is_err() {
                warn!("Replica: outbound queue closed, dropping message");
                return;
            }
        }
    }
}
