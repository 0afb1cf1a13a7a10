//! Raft type definitions for channel consensus groups.

use std::io::Cursor;

use openraft::BasicNode;

use super::commands::{ChannelOp, ChannelOpResult};

/// Node ID type for raft nodes. Derived deterministically from the
/// configured string node IDs (see [`crate::cluster::Membership`]).
pub type RaftNodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = ChannelOp,
        R = ChannelOpResult,
        NodeId = RaftNodeId,
        Node = BasicNode,
        SnapshotData = Cursor<Vec<u8>>,
);
