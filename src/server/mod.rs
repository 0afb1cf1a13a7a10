//! Client-facing node surface.
//!
//! A [`Node`] is one server process: it owns the channel registry, the
//! raft transport listener, and the per-channel dispatchers. Client
//! operations (publish, subscribe, ack) arrive here and are turned into
//! replicated channel ops; delivery comes back through per-subscription
//! channels owned by [`Subscription`] handles.
//!
//! Connection state is not replicated: when the node a client is attached
//! to dies, the client reconnects to a surviving node and resubscribes
//! (durables resume their replicated cursor).

mod dispatch;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use backon::Retryable;
use bytes::Bytes;
use dashmap::DashMap;
use object_store::ObjectStore;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use crate::cluster::{
    retry, Channel, ChannelOp, ChannelOpResult, ChannelRegistry, ChannelReplicator, ClusterConfig,
    Membership, RaftRpcServer,
};
use crate::error::{Error, Result};
use crate::types::{ChannelRole, Message, NodeState, SubscriptionOptions};

use dispatch::{AttachSpec, Dispatcher};

const STATE_STANDALONE: u8 = 0;
const STATE_CLUSTERED: u8 = 1;
const STATE_SHUTDOWN: u8 = 2;

/// One stanza server process.
pub struct Node {
    config: ClusterConfig,
    membership: Arc<Membership>,
    registry: Arc<ChannelRegistry>,
    dispatchers: DashMap<String, Arc<Dispatcher>>,
    state: AtomicU8,
    sub_counter: AtomicU64,
    member_token_counter: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Start a node with snapshots persisted under the configured raft log
    /// path on the local filesystem.
    pub async fn start(config: ClusterConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.raft_log_path)?;
        let object_store: Arc<dyn ObjectStore> = Arc::new(
            object_store::local::LocalFileSystem::new_with_prefix(&config.raft_log_path)?,
        );
        Self::start_with_object_store(config, object_store).await
    }

    /// Start a node with an explicit snapshot store (tests use the
    /// in-memory object store).
    pub async fn start_with_object_store(
        config: ClusterConfig,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        config.validate()?;
        let membership = Arc::new(Membership::from_config(&config)?);

        let registry = Arc::new(ChannelRegistry::new(
            config.clone(),
            membership.clone(),
            object_store,
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = if config.is_standalone() {
            STATE_STANDALONE
        } else {
            STATE_CLUSTERED
        };

        // Standalone nodes have no peers to talk to; the transport only
        // runs in clustered mode.
        if !config.is_standalone() {
            let server = RaftRpcServer::new(config.listen_addr.clone(), registry.clone());
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = server.run(shutdown_rx).await {
                    error!(error = %e, "Raft transport terminated");
                }
            });
        }

        info!(
            node_id = membership.local_id(),
            listen_addr = %config.listen_addr,
            peers = config.peers.len(),
            standalone = config.is_standalone(),
            "Node started"
        );

        Ok(Self {
            config,
            membership,
            registry,
            dispatchers: DashMap::new(),
            state: AtomicU8::new(state),
            sub_counter: AtomicU64::new(1),
            member_token_counter: AtomicU64::new(1),
            shutdown_tx,
        })
    }

    /// Observable lifecycle state.
    pub fn state(&self) -> NodeState {
        match self.state.load(Ordering::SeqCst) {
            STATE_STANDALONE => NodeState::Standalone,
            STATE_CLUSTERED => NodeState::Clustered,
            _ => NodeState::Shutdown,
        }
    }

    /// This node's configured id.
    pub fn node_id(&self) -> &str {
        self.membership.local_id()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) == STATE_SHUTDOWN {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Publish a message to a channel, creating the channel (and its
    /// consensus group) on first use. Returns the assigned sequence.
    ///
    /// Retries with backoff while the channel is electing or leadership is
    /// still propagating; after the policy is exhausted the error
    /// surfaces. A `Timeout` means the outcome is unknown — a retried
    /// publish may duplicate, which is within the at-least-once contract.
    pub async fn publish(&self, channel: &str, data: impl Into<Bytes>) -> Result<u64> {
        self.ensure_running()?;
        let data = data.into();
        let channel_ref = self.registry.get_or_create(channel).await?;

        (|| {
            let channel_ref = channel_ref.clone();
            let data = data.clone();
            async move {
                let op = ChannelOp::Publish {
                    data,
                    timestamp: now_nanos(),
                };
                match channel_ref.replicator().propose(op).await? {
                    ChannelOpResult::Published { sequence } => Ok(sequence),
                    other => Err(Error::Raft(format!(
                        "unexpected publish result: {other:?}"
                    ))),
                }
            }
        })
        .retry(retry::publish_policy(self.config.publish_retry_attempts))
        .when(|e: &Error| e.is_retriable())
        .await
    }

    /// Create (or reopen) a subscription on a channel and attach it to
    /// this node for delivery.
    ///
    /// Delivery only flows while this node leads the channel; a handle on
    /// a non-leader node receives nothing until leadership moves here.
    pub async fn subscribe(
        &self,
        channel: &str,
        client_id: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        self.ensure_running()?;
        let channel_ref = self.registry.get_or_create(channel).await?;

        let proposed_id = self.next_sub_id();
        let result = channel_ref
            .replicator()
            .propose(ChannelOp::AddSubscription {
                sub_id: proposed_id,
                client_id: client_id.to_string(),
                durable_name: options.durable_name.clone(),
                queue_group: options.queue_group.clone(),
                start: options.start,
            })
            .await?;

        let (sub_id, next_deliver) = match result {
            ChannelOpResult::SubscriptionAdded {
                sub_id,
                next_deliver,
            } => (sub_id, next_deliver),
            other => {
                return Err(Error::Raft(format!(
                    "unexpected subscribe result: {other:?}"
                )))
            }
        };

        let member_token = self.member_token_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(options.max_inflight.max(1) * 2);

        let dispatcher = self.dispatcher_for(&channel_ref);
        dispatcher
            .attach(AttachSpec {
                sub_id,
                member_token,
                next_deliver,
                queue_group: options.queue_group.clone(),
                max_inflight: options.max_inflight,
                ack_wait: options.ack_wait,
                tx,
            })
            .await;

        Ok(Subscription {
            channel: channel.to_string(),
            sub_id,
            member_token,
            queue_group: options.queue_group,
            rx,
            dispatcher,
            replicator: channel_ref.replicator().clone(),
        })
    }

    /// True iff this node currently leads the channel (and has confirmed
    /// leadership with a committed entry).
    pub fn is_channel_leader(&self, channel: &str) -> bool {
        self.registry
            .get(channel)
            .map(|c| c.is_leader())
            .unwrap_or(false)
    }

    /// Role of this node for a channel it has already created.
    pub fn channel_role(&self, channel: &str) -> Option<ChannelRole> {
        self.registry.get(channel).map(|c| c.role())
    }

    /// Force a snapshot of a channel at its current committed index.
    pub async fn trigger_snapshot(&self, channel: &str) -> Result<()> {
        let channel_ref = self
            .registry
            .get(channel)
            .ok_or_else(|| Error::NoLeader(channel.to_string()))?;
        channel_ref.trigger_snapshot().await
    }

    /// First and last sequence retained in this node's local store for a
    /// channel. Test/operator surface.
    pub fn channel_sequences(&self, channel: &str) -> Result<(u64, u64)> {
        match self.registry.get(channel) {
            Some(c) => c.message_store().first_and_last_sequence(),
            None => Ok((0, 0)),
        }
    }

    /// Look up a message in this node's local store. Test/operator
    /// surface.
    pub fn channel_lookup(&self, channel: &str, sequence: u64) -> Result<Option<Message>> {
        match self.registry.get(channel) {
            Some(c) => c.message_store().lookup(sequence),
            None => Ok(None),
        }
    }

    /// Names of channels present on this node.
    pub fn channel_names(&self) -> Vec<String> {
        self.registry.channel_names()
    }

    /// Shut down: stops the transport, every channel group, and delivery.
    /// In-flight proposals fail; nothing panics.
    pub async fn shutdown(&self) {
        let previous = self.state.swap(STATE_SHUTDOWN, Ordering::SeqCst);
        if previous == STATE_SHUTDOWN {
            return;
        }
        let _ = self.shutdown_tx.send(());
        self.registry.shutdown_all().await;
        self.dispatchers.clear();
        info!(node_id = self.membership.local_id(), "Node shut down");
    }

    fn dispatcher_for(&self, channel: &Arc<Channel>) -> Arc<Dispatcher> {
        self.dispatchers
            .entry(channel.name().to_string())
            .or_insert_with(|| Dispatcher::start(channel.clone(), self.shutdown_tx.clone()))
            .clone()
    }

    /// Cluster-unique subscription id: node bits high, local counter low.
    fn next_sub_id(&self) -> u64 {
        let counter = self.sub_counter.fetch_add(1, Ordering::SeqCst);
        (self.membership.local_raft_id() << 48) | (counter & 0xFFFF_FFFF_FFFF)
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// A live subscription handle: a single-consumer ordered stream of
/// messages with explicit acknowledgment.
pub struct Subscription {
    channel: String,
    sub_id: u64,
    member_token: u64,
    queue_group: Option<String>,
    rx: mpsc::Receiver<Message>,
    dispatcher: Arc<Dispatcher>,
    replicator: Arc<ChannelReplicator>,
}

impl Subscription {
    /// Receive the next message. Returns `None` once the node shuts down
    /// and the delivery channel drains.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Acknowledge one delivered message, freeing its inflight slot and
    /// stopping redelivery.
    pub async fn ack(&self, sequence: u64) -> Result<()> {
        self.dispatcher
            .ack(self.member_token, self.sub_id, sequence)
            .await
    }

    /// Close the subscription. A durable keeps its record and cursor and
    /// can be reopened under the same name; a non-durable close removes
    /// the record. Queue members just leave the group locally.
    pub async fn close(self) -> Result<()> {
        self.dispatcher.detach(self.member_token).await;
        if self.queue_group.is_none() {
            self.replicator
                .propose(ChannelOp::CloseSubscription {
                    sub_id: self.sub_id,
                })
                .await?;
        }
        Ok(())
    }

    /// Remove the subscription record entirely. Replicated: no node will
    /// deliver to this subscription again.
    pub async fn unsubscribe(self) -> Result<()> {
        self.dispatcher.detach(self.member_token).await;
        self.replicator
            .propose(ChannelOp::RemoveSubscription {
                sub_id: self.sub_id,
            })
            .await?;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.sub_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}
