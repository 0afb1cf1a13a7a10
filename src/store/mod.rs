//! Storage interfaces consumed by the replication layer.
//!
//! The replication layer mutates these stores only from the per-channel
//! apply path, one committed entry at a time. Reads may happen concurrently
//! (sequence lookups, dispatch) and must observe a consistent state, never
//! a half-applied mutation. The in-memory implementations in
//! [`memory`] satisfy this with a single `RwLock` around each store's
//! contents.
//!
//! The physical on-disk encoding of a production message store is an
//! external collaborator; anything implementing these traits can be plugged
//! into a channel.

mod memory;

pub use memory::{MemoryMessageStore, MemorySubStore};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::Message;

/// Durable record of one subscription, replicated through the channel log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubState {
    /// Cluster-unique subscription id.
    pub id: u64,
    /// Client that created (or last reopened) the subscription.
    pub client_id: String,
    /// Durable name, if any.
    pub durable_name: Option<String>,
    /// Queue group, if any.
    pub queue_group: Option<String>,
    /// First sequence this subscription was set to deliver.
    pub start_seq: u64,
    /// Highest sequence recorded as sent (replicated bookkeeping).
    pub last_sent: u64,
    /// Cumulative acknowledgment watermark. Everything at or below this
    /// sequence has been acknowledged.
    pub last_acked: u64,
    /// A closed durable keeps its record and cursor; reopening under the
    /// same durable name resumes it.
    pub closed: bool,
}

impl SubState {
    /// The next sequence this subscription should be delivered.
    pub fn next_deliver(&self) -> u64 {
        self.last_acked.max(self.start_seq.saturating_sub(1)) + 1
    }
}

/// Sequence-indexed storage of a channel's messages.
pub trait MessageStore: Send + Sync {
    /// Append a message, assigning the next sequence number.
    fn append(&self, data: Bytes, timestamp: i64) -> Result<u64>;

    /// Look up a message by sequence.
    fn lookup(&self, sequence: u64) -> Result<Option<Message>>;

    /// First and last retained sequence. `(0, 0)` when empty.
    fn first_and_last_sequence(&self) -> Result<(u64, u64)>;

    /// Drop every message with sequence >= `from`.
    fn truncate_from(&self, from: u64) -> Result<()>;

    /// Replace the entire contents. Atomic with respect to readers: a
    /// concurrent lookup observes the old or the new state, never a mix.
    /// Used for snapshot installation.
    fn restore(&self, first: u64, last: u64, messages: Vec<Message>) -> Result<()>;

    /// All retained messages in sequence order. Used for snapshot capture.
    fn all_messages(&self) -> Result<Vec<Message>>;
}

/// Durable record of a channel's subscriptions.
pub trait SubscriptionStore: Send + Sync {
    /// Create a subscription record. Fails if the id already exists.
    fn create_sub(&self, sub: SubState) -> Result<()>;

    /// Update an existing record in place.
    fn update_sub(&self, sub: SubState) -> Result<()>;

    /// Remove a record entirely.
    fn delete_sub(&self, sub_id: u64) -> Result<()>;

    /// Look up a record by id.
    fn lookup(&self, sub_id: u64) -> Result<Option<SubState>>;

    /// Look up a record by durable name (closed or open).
    fn lookup_by_durable_name(&self, name: &str) -> Result<Option<SubState>>;

    /// Look up the shared record of a queue group.
    fn lookup_by_queue_group(&self, group: &str) -> Result<Option<SubState>>;

    /// All records. Used for snapshot capture and leader dispatch warmup.
    fn all_subs(&self) -> Result<Vec<SubState>>;

    /// Replace the entire contents (snapshot installation).
    fn restore(&self, subs: Vec<SubState>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_deliver_fresh_subscription() {
        let sub = SubState {
            id: 1,
            client_id: "c".into(),
            durable_name: None,
            queue_group: None,
            start_seq: 1,
            last_sent: 0,
            last_acked: 0,
            closed: false,
        };
        assert_eq!(sub.next_deliver(), 1);
    }

    #[test]
    fn next_deliver_resumes_after_acks() {
        let sub = SubState {
            id: 1,
            client_id: "c".into(),
            durable_name: Some("d".into()),
            queue_group: None,
            start_seq: 1,
            last_sent: 4,
            last_acked: 3,
            closed: true,
        };
        assert_eq!(sub.next_deliver(), 4);
    }

    #[test]
    fn next_deliver_honors_start_beyond_acks() {
        let sub = SubState {
            id: 1,
            client_id: "c".into(),
            durable_name: None,
            queue_group: None,
            start_seq: 10,
            last_sent: 0,
            last_acked: 0,
            closed: false,
        };
        assert_eq!(sub.next_deliver(), 10);
    }
}
