//! Core data types shared across the crate.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A message stored in a channel.
///
/// Sequence numbers are assigned when the corresponding publish entry is
/// applied, are strictly increasing per channel, and have no gaps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Per-channel sequence number, starting at 1.
    pub sequence: u64,
    /// Opaque payload.
    pub data: Bytes,
    /// Publish timestamp in nanoseconds since the epoch, taken from the
    /// proposing leader's clock (part of the replicated entry, so every
    /// replica stores the same value).
    pub timestamp: i64,
}

/// Where a new subscription starts reading the channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StartPosition {
    /// Deliver everything currently retained in the channel.
    AllAvailable,
    /// Deliver only messages published after the subscription is applied.
    NewOnly,
    /// Deliver starting at the given sequence (clamped to the retained
    /// range).
    Sequence(u64),
}

/// Options for creating a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Start position for a new subscription. Ignored when reopening an
    /// existing durable, which resumes at its replicated cursor.
    pub start: StartPosition,
    /// Durable name. A durable's cursor survives close/reopen under the
    /// same name.
    pub durable_name: Option<String>,
    /// Queue group name. Members of a group share one cursor and each
    /// message is delivered to exactly one member.
    pub queue_group: Option<String>,
    /// Maximum unacknowledged messages in flight to this subscriber.
    pub max_inflight: usize,
    /// How long to wait for an ack before redelivering.
    pub ack_wait: std::time::Duration,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            start: StartPosition::NewOnly,
            durable_name: None,
            queue_group: None,
            max_inflight: 16,
            ack_wait: std::time::Duration::from_secs(30),
        }
    }
}

/// Observable lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Running without peers; the single node leads every channel.
    Standalone,
    /// Running as a member of a static cluster.
    Clustered,
    /// Shut down; all channel groups are stopped.
    Shutdown,
}

/// Role of a node with respect to one channel's consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// No leader is currently known for the channel.
    NoLeader,
    /// This node leads the channel and has committed its leadership
    /// barrier.
    Leader,
    /// Another node leads the channel.
    Follower,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_options_defaults() {
        let opts = SubscriptionOptions::default();
        assert_eq!(opts.start, StartPosition::NewOnly);
        assert!(opts.durable_name.is_none());
        assert!(opts.queue_group.is_none());
        assert_eq!(opts.max_inflight, 16);
    }

    #[test]
    fn message_roundtrip_bincode() {
        let msg = Message {
            sequence: 7,
            data: Bytes::from_static(b"hello"),
            timestamp: 1_700_000_000_000_000_000,
        };
        let encoded = bincode::serialize(&msg).unwrap();
        let decoded: Message = bincode::deserialize(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }
}
