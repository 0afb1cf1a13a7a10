//! Channel replicator: bridges channel-level operations and the channel's
//! consensus group.
//!
//! Owns the leadership role state machine for the channel. Roles move
//! between `NoLeader`, `Leader`, and `Follower` driven by the raft metrics
//! stream; a node that wins an election only reports `Leader` after its
//! no-op leadership barrier commits in the new term, which proves it holds
//! the current term's majority and has applied every previously committed
//! entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, ForwardToLeader, RaftError};
use openraft::BasicNode;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::commands::{ChannelOp, ChannelOpResult};
use super::group::ChannelGroup;
use super::membership::Membership;
use super::network::{call, RaftRpcMessage, RpcPayload, RpcReply, MAX_FORWARD_HOPS};
use super::types::RaftNodeId;
use crate::error::{Error, Result};
use crate::types::ChannelRole;

/// Replicates one channel's operations through its consensus group.
pub struct ChannelReplicator {
    channel: String,
    group: ChannelGroup,
    membership: Arc<Membership>,
    proposal_timeout: Duration,
    /// Bounds concurrent in-flight proposals (backpressure).
    proposal_slots: Semaphore,
    /// Set once the leadership barrier has committed in the current term.
    ready: AtomicBool,
    role_tx: watch::Sender<ChannelRole>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChannelReplicator {
    /// Wrap a started group and begin watching its leadership signal.
    pub fn start(
        channel: impl Into<String>,
        group: ChannelGroup,
        membership: Arc<Membership>,
        proposal_timeout: Duration,
        max_pending_proposals: usize,
    ) -> Arc<Self> {
        let (role_tx, _) = watch::channel(ChannelRole::NoLeader);
        let (shutdown_tx, _) = broadcast::channel(1);
        let replicator = Arc::new(Self {
            channel: channel.into(),
            group,
            membership,
            proposal_timeout,
            proposal_slots: Semaphore::new(max_pending_proposals),
            ready: AtomicBool::new(false),
            role_tx,
            shutdown_tx,
        });
        replicator.spawn_watcher();
        replicator
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn group(&self) -> &ChannelGroup {
        &self.group
    }

    /// True iff this node leads the channel and has committed at least one
    /// entry (the barrier) since becoming leader.
    pub fn is_leader(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
            && self.group.current_leader() == Some(self.group.local_raft_id())
    }

    /// Current role of this node for the channel.
    pub fn role(&self) -> ChannelRole {
        *self.role_tx.borrow()
    }

    /// Watch role transitions. The leader dispatch loop keys off this.
    pub fn role_watch(&self) -> watch::Receiver<ChannelRole> {
        self.role_tx.subscribe()
    }

    /// Configured node id of the current leader, when known.
    pub fn leader_hint(&self) -> Option<String> {
        self.group
            .current_leader()
            .and_then(|id| self.membership.node_id_of(id).map(String::from))
    }

    /// Propose an operation and wait for majority commit.
    ///
    /// On a follower that knows the leader, the proposal is forwarded over
    /// the raft transport. Fails with `NoLeader`, `NotLeader`, or
    /// `Timeout` per the channel contract; `Timeout` means the outcome is
    /// unknown.
    pub async fn propose(&self, op: ChannelOp) -> Result<ChannelOpResult> {
        self.propose_with_hops(op, 0).await
    }

    pub(crate) async fn propose_with_hops(
        &self,
        op: ChannelOp,
        forward_hops: u8,
    ) -> Result<ChannelOpResult> {
        let _permit = match timeout(self.proposal_timeout, self.proposal_slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => {
                warn!(
                    channel = %self.channel,
                    "Proposal backpressure timeout, too many pending proposals"
                );
                return Err(Error::Timeout(self.proposal_timeout));
            }
        };

        match timeout(
            self.proposal_timeout,
            self.group.raft().client_write(op.clone()),
        )
        .await
        {
            Err(_) => Err(Error::Timeout(self.proposal_timeout)),
            Ok(Ok(response)) => match response.data {
                ChannelOpResult::StoreError { message } => Err(Error::Store(message)),
                data => Ok(data),
            },
            Ok(Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)))) => {
                self.forward(op, fwd, forward_hops).await
            }
            Ok(Err(e)) => Err(Error::Raft(e.to_string())),
        }
    }

    async fn forward(
        &self,
        op: ChannelOp,
        fwd: ForwardToLeader<RaftNodeId, BasicNode>,
        forward_hops: u8,
    ) -> Result<ChannelOpResult> {
        let leader_hint = fwd
            .leader_id
            .and_then(|id| self.membership.node_id_of(id).map(String::from));

        if forward_hops >= MAX_FORWARD_HOPS {
            warn!(
                channel = %self.channel,
                forward_hops,
                "Forward hop limit reached, leadership is unstable"
            );
            return Err(Error::NotLeader {
                channel: self.channel.clone(),
                leader_hint,
            });
        }

        let Some(leader_node) = fwd.leader_node else {
            return Err(Error::NoLeader(self.channel.clone()));
        };

        debug!(
            channel = %self.channel,
            leader = ?leader_hint,
            addr = %leader_node.addr,
            forward_hops,
            "Forwarding proposal to channel leader"
        );

        let msg = RaftRpcMessage {
            channel: self.channel.clone(),
            payload: RpcPayload::ClientWrite {
                op,
                forward_hops: forward_hops + 1,
            },
        };
        match call(&leader_node.addr, &msg).await {
            Ok(RpcReply::ClientWrite(ChannelOpResult::StoreError { message })) => {
                Err(Error::Store(message))
            }
            Ok(RpcReply::ClientWrite(result)) => Ok(result),
            Ok(RpcReply::Error(info)) => Err(info.into_error(&self.channel)),
            Ok(_) => Err(Error::Raft(
                "unexpected reply to forwarded proposal".to_string(),
            )),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Watch the raft metrics stream and drive the role state machine.
    fn spawn_watcher(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut metrics = this.group.raft().metrics();
            let mut shutdown = this.shutdown_tx.subscribe();
            let mut barrier_term: Option<u64> = None;

            loop {
                let (leader, term) = {
                    let m = metrics.borrow_and_update();
                    (m.current_leader, m.current_term)
                };

                if leader == Some(this.group.local_raft_id()) {
                    if barrier_term != Some(term) {
                        barrier_term = Some(term);
                        this.ready.store(false, Ordering::SeqCst);
                        this.spawn_barrier(term);
                    }
                } else {
                    if barrier_term.take().is_some() {
                        info!(channel = %this.channel, "Stepped down from channel leadership");
                    }
                    this.ready.store(false, Ordering::SeqCst);
                    let role = if leader.is_some() {
                        ChannelRole::Follower
                    } else {
                        ChannelRole::NoLeader
                    };
                    this.role_tx.send_replace(role);
                }

                tokio::select! {
                    _ = shutdown.recv() => break,
                    changed = metrics.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Commit a no-op in the new term. Until it commits this node refuses
    /// to report leadership, so reads and writes never land on an
    /// unconfirmed leader.
    fn spawn_barrier(self: &Arc<Self>, term: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.group.raft().client_write(ChannelOp::Noop).await {
                Ok(_) => {
                    let (leader, current_term) = {
                        let metrics = this.group.raft().metrics();
                        let m = metrics.borrow();
                        (m.current_leader, m.current_term)
                    };
                    if current_term == term && leader == Some(this.group.local_raft_id()) {
                        this.ready.store(true, Ordering::SeqCst);
                        this.role_tx.send_replace(ChannelRole::Leader);
                        info!(
                            channel = %this.channel,
                            term,
                            "Channel leadership confirmed"
                        );
                    } else {
                        debug!(
                            channel = %this.channel,
                            term,
                            current_term,
                            "Leadership changed before barrier took effect"
                        );
                    }
                }
                Err(e) => {
                    debug!(
                        channel = %this.channel,
                        term,
                        error = %e,
                        "Leadership barrier did not commit"
                    );
                }
            }
        });
    }

    /// Stop the watcher and the underlying group.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.ready.store(false, Ordering::SeqCst);
        self.proposal_slots.close();
        self.group.shutdown().await
    }
}
