//! Channel operations and their apply results.
//!
//! A [`ChannelOp`] is the payload of one raft log entry. Ops are replicated
//! through the channel's consensus group and applied deterministically on
//! every node, so the result of applying the same op sequence is identical
//! everywhere.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::StartPosition;

/// Operations proposed to a channel's consensus group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelOp {
    /// No-op, proposed as the leadership barrier after an election win.
    Noop,

    /// Publish a message. The sequence is assigned at apply time.
    Publish {
        data: Bytes,
        /// Leader clock at proposal time, carried in the entry so replicas
        /// store identical timestamps.
        timestamp: i64,
    },

    /// Create a subscription, or reopen an existing durable of the same
    /// name.
    AddSubscription {
        sub_id: u64,
        client_id: String,
        durable_name: Option<String>,
        queue_group: Option<String>,
        start: StartPosition,
    },

    /// Close a subscription. A durable keeps its record and cursor; a
    /// non-durable close is equivalent to removal.
    CloseSubscription { sub_id: u64 },

    /// Remove a subscription record entirely (unsubscribe).
    RemoveSubscription { sub_id: u64 },

    /// Delivery bookkeeping: the leader sent `seq` to `sub_id`.
    SendMsg { sub_id: u64, seq: u64 },

    /// Acknowledgment bookkeeping: `sub_id` acknowledged through `seq`.
    Ack { sub_id: u64, seq: u64 },
}

/// Result of applying a [`ChannelOp`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelOpResult {
    /// Generic success (noop, bookkeeping).
    Ok,

    /// The message was stored under this sequence.
    Published { sequence: u64 },

    /// The subscription exists; delivery should start at `next_deliver`.
    /// For a reopened durable, `sub_id` is the original record's id.
    SubscriptionAdded { sub_id: u64, next_deliver: u64 },

    /// The subscription was closed (durable) or removed (non-durable).
    SubscriptionClosed { sub_id: u64 },

    /// The subscription record was removed.
    SubscriptionRemoved { sub_id: u64 },

    /// The referenced subscription does not exist.
    SubscriptionNotFound { sub_id: u64 },

    /// A local store failure interrupted apply. The entry as a whole did
    /// not mutate the store.
    StoreError { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_roundtrip_bincode() {
        let op = ChannelOp::Publish {
            data: Bytes::from_static(b"hello"),
            timestamp: 12345,
        };
        let encoded = bincode::serialize(&op).unwrap();
        let decoded: ChannelOp = bincode::deserialize(&encoded).unwrap();
        assert_eq!(op, decoded);
    }

    #[test]
    fn add_subscription_roundtrip_bincode() {
        let op = ChannelOp::AddSubscription {
            sub_id: 42,
            client_id: "client-1".to_string(),
            durable_name: Some("durable".to_string()),
            queue_group: None,
            start: StartPosition::Sequence(7),
        };
        let encoded = bincode::serialize(&op).unwrap();
        let decoded: ChannelOp = bincode::deserialize(&encoded).unwrap();
        assert_eq!(op, decoded);
    }

    #[test]
    fn result_roundtrip_json() {
        let result = ChannelOpResult::SubscriptionAdded {
            sub_id: 9,
            next_deliver: 3,
        };
        let encoded = serde_json::to_string(&result).unwrap();
        let decoded: ChannelOpResult = serde_json::from_str(&encoded).unwrap();
        assert_eq!(result, decoded);
    }
}
