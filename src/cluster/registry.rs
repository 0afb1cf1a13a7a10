//! Channel registry: the single owner of the name → channel mapping.
//!
//! Channels are created lazily the first time anything touches them — a
//! local publish or subscribe, or an inbound raft RPC from a peer that
//! already created the channel on its side. Lookups are lock-free; creation
//! is serialized so exactly one instance exists per name per node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use object_store::ObjectStore;
use openraft::Raft;
use tokio::sync::watch;
use tracing::{info, warn};

use super::config::ClusterConfig;
use super::group::ChannelGroup;
use super::membership::Membership;
use super::replicator::ChannelReplicator;
use super::state_machine::ChannelStateMachine;
use super::types::TypeConfig;
use crate::error::{Error, Result};
use crate::store::{MemoryMessageStore, MemorySubStore, MessageStore, SubscriptionStore};
use crate::types::ChannelRole;

/// One channel on this node: stores, state machine, and consensus group.
pub struct Channel {
    name: String,
    messages: Arc<dyn MessageStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    sm: Arc<ChannelStateMachine>,
    replicator: Arc<ChannelReplicator>,
}

impl Channel {
    async fn create(
        name: &str,
        config: &ClusterConfig,
        membership: &Arc<Membership>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Arc<Self>> {
        let messages: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let subscriptions: Arc<dyn SubscriptionStore> = Arc::new(MemorySubStore::new());
        let sm = Arc::new(ChannelStateMachine::new(
            name,
            messages.clone(),
            subscriptions.clone(),
        ));

        let group = ChannelGroup::new(name, config, membership, sm.clone(), object_store).await?;
        let replicator = ChannelReplicator::start(
            name,
            group,
            membership.clone(),
            config.proposal_timeout,
            config.max_pending_proposals,
        );

        info!(channel = name, "Channel created");
        Ok(Arc::new(Self {
            name: name.to_string(),
            messages,
            subscriptions,
            sm,
            replicator,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replicator(&self) -> &Arc<ChannelReplicator> {
        &self.replicator
    }

    pub fn raft(&self) -> &Raft<TypeConfig> {
        self.replicator.group().raft()
    }

    pub fn message_store(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    pub fn subscription_store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    /// Watch the highest published sequence (advanced by apply).
    pub fn published_watch(&self) -> watch::Receiver<u64> {
        self.sm.published_watch()
    }

    pub fn is_leader(&self) -> bool {
        self.replicator.is_leader()
    }

    pub fn role(&self) -> ChannelRole {
        self.replicator.role()
    }

    /// Force a snapshot at the current committed index.
    pub async fn trigger_snapshot(&self) -> Result<()> {
        self.replicator.group().trigger_snapshot().await
    }
}

/// Owns every channel on this node.
pub struct ChannelRegistry {
    config: ClusterConfig,
    membership: Arc<Membership>,
    object_store: Arc<dyn ObjectStore>,
    channels: DashMap<String, Arc<Channel>>,
    create_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
}

impl ChannelRegistry {
    pub fn new(
        config: ClusterConfig,
        membership: Arc<Membership>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            membership,
            object_store,
            channels: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Look up a channel without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).map(|c| c.clone())
    }

    /// Look up a channel, creating it (and its consensus group) on first
    /// touch.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Channel>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        if let Some(channel) = self.channels.get(name) {
            return Ok(channel.clone());
        }

        // Serialize creation; re-check under the lock so concurrent first
        // touches build exactly one instance.
        let _guard = self.create_lock.lock().await;
        if let Some(channel) = self.channels.get(name) {
            return Ok(channel.clone());
        }

        let channel = Channel::create(
            name,
            &self.config,
            &self.membership,
            self.object_store.clone(),
        )
        .await?;
        self.channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    /// Names of every channel on this node.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Shut down every channel's replicator and group.
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _guard = self.create_lock.lock().await;
        for entry in self.channels.iter() {
            if let Err(e) = entry.value().replicator().shutdown().await {
                warn!(channel = entry.key().as_str(), error = %e, "Channel shutdown error");
            }
        }
        self.channels.clear();
    }
}
