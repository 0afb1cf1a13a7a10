//! Static cluster membership.
//!
//! Supplies each consensus group with this node's identity and the full
//! peer set at creation time. Peer lists are configured symmetrically, so
//! every node sees the same member set and the string-id → raft-id mapping
//! below comes out identical everywhere without coordination: the full
//! member list (self included) is sorted and each member's index is its
//! raft id.

use std::collections::BTreeMap;

use openraft::BasicNode;

use super::config::ClusterConfig;
use super::types::RaftNodeId;
use crate::error::{Error, Result};

/// Resolved static membership for one node.
#[derive(Debug, Clone)]
pub struct Membership {
    /// This node's configured string id.
    local_id: String,
    /// This node's derived raft id.
    local_raft_id: RaftNodeId,
    /// All members (self included): raft id → (string id, raft address).
    members: BTreeMap<RaftNodeId, (String, String)>,
}

impl Membership {
    /// Resolve membership from configuration. The config must already have
    /// passed [`ClusterConfig::validate`]; a missing node id on a
    /// clustered config is still rejected here as a defense in depth.
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let local_id = match &config.node_id {
            Some(id) => id.clone(),
            None if config.peers.is_empty() => "0".to_string(),
            None => {
                return Err(Error::Config(
                    "cluster peers configured without a node id".to_string(),
                ))
            }
        };

        let mut ids: Vec<(String, String)> = config.peers.clone();
        ids.push((local_id.clone(), config.listen_addr.clone()));
        ids.sort_by(|a, b| a.0.cmp(&b.0));

        let members: BTreeMap<RaftNodeId, (String, String)> = ids
            .into_iter()
            .enumerate()
            .map(|(i, (id, addr))| (i as RaftNodeId, (id, addr)))
            .collect();

        let local_raft_id = members
            .iter()
            .find(|(_, (id, _))| *id == local_id)
            .map(|(raft_id, _)| *raft_id)
            .ok_or_else(|| Error::Config("node id not present in member set".to_string()))?;

        Ok(Self {
            local_id,
            local_raft_id,
            members,
        })
    }

    /// This node's raft id.
    pub fn local_raft_id(&self) -> RaftNodeId {
        self.local_raft_id
    }

    /// This node's configured string id.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Number of voting members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The initial member map handed to each consensus group.
    pub fn initial_members(&self) -> BTreeMap<RaftNodeId, BasicNode> {
        self.members
            .iter()
            .map(|(raft_id, (_, addr))| (*raft_id, BasicNode::new(addr.clone())))
            .collect()
    }

    /// Raft address for a member.
    pub fn addr_of(&self, raft_id: RaftNodeId) -> Option<&str> {
        self.members.get(&raft_id).map(|(_, addr)| addr.as_str())
    }

    /// Configured string id for a member.
    pub fn node_id_of(&self, raft_id: RaftNodeId) -> Option<&str> {
        self.members.get(&raft_id).map(|(id, _)| id.as_str())
    }
}
