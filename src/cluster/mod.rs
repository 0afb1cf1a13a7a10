//! Clustering and replication layer.
//!
//! Each channel owns one raft consensus group; the groups of different
//! channels advance independently. A channel-level operation becomes a log
//! entry, commits once a majority of nodes acknowledge it, and is then
//! applied — in commit order, one entry at a time — to every node's
//! message and subscription stores through a deterministic state machine.
//!
//! ```text
//!   publish/subscribe           ┌──────────────────┐
//!  ──────────────────► Channel  │  ChannelReplicator│── propose ──► raft group
//!                      Registry │  (role: leader?)  │◄─ committed ─┘
//!                               └────────┬─────────┘
//!                                        │ apply (deterministic)
//!                               ┌────────▼─────────┐
//!                               │ Message store     │
//!                               │ Subscription store│
//!                               └──────────────────┘
//! ```
//!
//! Leadership is per channel. Only the leader accepts proposals and drives
//! delivery; followers apply the same committed entries so any of them can
//! take over after an election without data loss. Lagging or rejoining
//! followers catch up by log replay when the leader still retains the
//! entries (`trailing_logs`), otherwise by snapshot installation.

mod commands;
mod config;
mod group;
mod membership;
mod network;
mod registry;
mod replicator;
mod state_machine;
mod storage;
mod types;

pub mod retry;

pub use commands::{ChannelOp, ChannelOpResult};
pub use config::ClusterConfig;
pub use group::ChannelGroup;
pub use membership::Membership;
pub use network::{RaftRpcMessage, RaftRpcServer, RpcErrorInfo, RpcErrorKind, RpcPayload, RpcReply};
pub use registry::{Channel, ChannelRegistry};
pub use replicator::ChannelReplicator;
pub use state_machine::{ChannelSnapshot, ChannelStateMachine};
pub use storage::ChannelRaftStore;
pub use types::{RaftNodeId, TypeConfig};
