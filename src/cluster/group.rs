//! Per-channel consensus group.
//!
//! Wraps one raft instance: creation with static membership, snapshot
//! restore on startup, on-demand snapshot triggering, and shutdown.

use std::sync::Arc;

use object_store::ObjectStore;
use openraft::error::{InitializeError, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, Raft};
use tracing::{debug, info};

use super::config::ClusterConfig;
use super::membership::Membership;
use super::network::ChannelNetworkFactory;
use super::state_machine::ChannelStateMachine;
use super::storage::ChannelRaftStore;
use super::types::{RaftNodeId, TypeConfig};
use crate::error::{Error, Result};

/// One channel's raft group on this node.
pub struct ChannelGroup {
    channel: String,
    raft: Raft<TypeConfig>,
    local_raft_id: RaftNodeId,
}

impl ChannelGroup {
    /// Create and start the group for `channel`, restoring any persisted
    /// snapshot and initializing the static membership.
    pub async fn new(
        channel: &str,
        config: &ClusterConfig,
        membership: &Membership,
        sm: Arc<ChannelStateMachine>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let snapshot_prefix = format!("channels/{channel}");
        let store = ChannelRaftStore::new(sm, object_store, &snapshot_prefix);

        match store.load_snapshot_from_store().await {
            Ok(true) => {
                info!(channel, "Restored channel from persisted snapshot");
            }
            Ok(false) => {
                debug!(channel, "No persisted snapshot for channel, starting fresh");
            }
            Err(e) => {
                return Err(Error::SnapshotInstall {
                    channel: channel.to_string(),
                    message: e.to_string(),
                });
            }
        }

        let raft_config = Arc::new(config.to_openraft_config(channel));
        let network = ChannelNetworkFactory::new(channel);
        let (log_store, sm_store) = Adaptor::new(store);

        let local_raft_id = membership.local_raft_id();
        let raft = Raft::new(local_raft_id, raft_config, network, log_store, sm_store)
            .await
            .map_err(|e| Error::Raft(format!("failed to create raft group: {e}")))?;

        // Every member initializes with the identical static membership;
        // losing the init race is not an error.
        match raft.initialize(membership.initial_members()).await {
            Ok(()) => {
                info!(
                    channel,
                    members = membership.len(),
                    "Initialized channel consensus group"
                );
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!(channel, "Consensus group already initialized");
            }
            Err(e) => {
                return Err(Error::Raft(format!(
                    "failed to initialize channel {channel}: {e}"
                )));
            }
        }

        Ok(Self {
            channel: channel.to_string(),
            raft,
            local_raft_id,
        })
    }

    pub fn raft(&self) -> &Raft<TypeConfig> {
        &self.raft
    }

    pub fn local_raft_id(&self) -> RaftNodeId {
        self.local_raft_id
    }

    /// Current leader of this group, if any.
    pub fn current_leader(&self) -> Option<RaftNodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Force a snapshot at the current committed index.
    pub async fn trigger_snapshot(&self) -> Result<()> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| Error::Raft(format!("snapshot trigger failed: {e}")))
    }

    /// Stop the group's raft instance.
    pub async fn shutdown(&self) -> Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| Error::Raft(format!("raft shutdown failed: {e}")))?;
        info!(channel = %self.channel, "Channel consensus group shut down");
        Ok(())
    }

    pub fn metrics(&self) -> openraft::RaftMetrics<RaftNodeId, BasicNode> {
        self.raft.metrics().borrow().clone()
    }
}
