//! Deterministic state machine for one channel.
//!
//! Committed channel ops are applied here, in commit order, one at a time.
//! Every node that applies the same log prefix ends up with byte-identical
//! message and subscription store contents — nothing in this module reads a
//! clock, generates randomness, or consults node-local state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::{MessageStore, SubState, SubscriptionStore};
use crate::types::{Message, StartPosition};

use super::commands::{ChannelOp, ChannelOpResult};

/// Serialized point-in-time state of a channel, exchanged during catch-up
/// and persisted for restart recovery.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelSnapshot {
    pub first_seq: u64,
    pub last_seq: u64,
    pub messages: Vec<Message>,
    pub subscriptions: Vec<SubState>,
}

/// Applies committed ops to a channel's stores.
pub struct ChannelStateMachine {
    channel: String,
    messages: Arc<dyn MessageStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    /// Last sequence applied by a publish (or restored by a snapshot).
    /// The leader's dispatch loop watches this.
    published_tx: watch::Sender<u64>,
}

impl ChannelStateMachine {
    pub fn new(
        channel: impl Into<String>,
        messages: Arc<dyn MessageStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        let (published_tx, _) = watch::channel(0);
        Self {
            channel: channel.into(),
            messages,
            subscriptions,
            published_tx,
        }
    }

    /// Watch the highest published sequence.
    pub fn published_watch(&self) -> watch::Receiver<u64> {
        self.published_tx.subscribe()
    }

    /// Apply one committed op. All-or-nothing: a store failure leaves the
    /// stores untouched by this entry and surfaces as `StoreError`.
    pub fn apply(&self, op: &ChannelOp) -> ChannelOpResult {
        match self.apply_inner(op) {
            Ok(result) => result,
            Err(e) => ChannelOpResult::StoreError {
                message: e.to_string(),
            },
        }
    }

    fn apply_inner(&self, op: &ChannelOp) -> Result<ChannelOpResult> {
        match op {
            ChannelOp::Noop => Ok(ChannelOpResult::Ok),

            ChannelOp::Publish { data, timestamp } => {
                let sequence = self.messages.append(data.clone(), *timestamp)?;
                self.published_tx.send_replace(sequence);
                Ok(ChannelOpResult::Published { sequence })
            }

            ChannelOp::AddSubscription {
                sub_id,
                client_id,
                durable_name,
                queue_group,
                start,
            } => self.apply_add_subscription(
                *sub_id,
                client_id,
                durable_name.as_deref(),
                queue_group.as_deref(),
                *start,
            ),

            ChannelOp::CloseSubscription { sub_id } => {
                match self.subscriptions.lookup(*sub_id)? {
                    None => Ok(ChannelOpResult::SubscriptionNotFound { sub_id: *sub_id }),
                    Some(mut sub) => {
                        if sub.durable_name.is_some() {
                            sub.closed = true;
                            self.subscriptions.update_sub(sub)?;
                        } else {
                            // A non-durable close leaves nothing to resume.
                            self.subscriptions.delete_sub(*sub_id)?;
                        }
                        Ok(ChannelOpResult::SubscriptionClosed { sub_id: *sub_id })
                    }
                }
            }

            ChannelOp::RemoveSubscription { sub_id } => {
                match self.subscriptions.lookup(*sub_id)? {
                    None => Ok(ChannelOpResult::SubscriptionNotFound { sub_id: *sub_id }),
                    Some(_) => {
                        self.subscriptions.delete_sub(*sub_id)?;
                        Ok(ChannelOpResult::SubscriptionRemoved { sub_id: *sub_id })
                    }
                }
            }

            ChannelOp::SendMsg { sub_id, seq } => match self.subscriptions.lookup(*sub_id)? {
                None => Ok(ChannelOpResult::SubscriptionNotFound { sub_id: *sub_id }),
                Some(mut sub) => {
                    if *seq > sub.last_sent {
                        sub.last_sent = *seq;
                        self.subscriptions.update_sub(sub)?;
                    }
                    Ok(ChannelOpResult::Ok)
                }
            },

            ChannelOp::Ack { sub_id, seq } => match self.subscriptions.lookup(*sub_id)? {
                None => Ok(ChannelOpResult::SubscriptionNotFound { sub_id: *sub_id }),
                Some(mut sub) => {
                    if *seq > sub.last_acked {
                        sub.last_acked = *seq;
                        sub.last_sent = sub.last_sent.max(*seq);
                        self.subscriptions.update_sub(sub)?;
                    }
                    Ok(ChannelOpResult::Ok)
                }
            },
        }
    }

    fn apply_add_subscription(
        &self,
        sub_id: u64,
        client_id: &str,
        durable_name: Option<&str>,
        queue_group: Option<&str>,
        start: StartPosition,
    ) -> Result<ChannelOpResult> {
        // Reopening a durable of the same name resumes the prior cursor
        // instead of creating a second record.
        if let (Some(name), None) = (durable_name, queue_group) {
            if let Some(mut existing) = self.subscriptions.lookup_by_durable_name(name)? {
                existing.closed = false;
                existing.client_id = client_id.to_string();
                let next_deliver = existing.next_deliver();
                let id = existing.id;
                self.subscriptions.update_sub(existing)?;
                debug!(
                    channel = %self.channel,
                    durable = name,
                    sub_id = id,
                    next_deliver,
                    "Reopened durable subscription"
                );
                return Ok(ChannelOpResult::SubscriptionAdded {
                    sub_id: id,
                    next_deliver,
                });
            }
        }

        // Queue group members share one record and one cursor; a joining
        // member binds to the group's existing record.
        if let Some(group) = queue_group {
            if let Some(mut existing) = self.subscriptions.lookup_by_queue_group(group)? {
                existing.closed = false;
                let next_deliver = existing.next_deliver();
                let id = existing.id;
                self.subscriptions.update_sub(existing)?;
                return Ok(ChannelOpResult::SubscriptionAdded {
                    sub_id: id,
                    next_deliver,
                });
            }
        }

        let start_seq = self.resolve_start(start)?;
        let sub = SubState {
            id: sub_id,
            client_id: client_id.to_string(),
            durable_name: durable_name.map(String::from),
            queue_group: queue_group.map(String::from),
            start_seq,
            last_sent: start_seq.saturating_sub(1),
            last_acked: start_seq.saturating_sub(1),
            closed: false,
        };
        self.subscriptions.create_sub(sub)?;
        Ok(ChannelOpResult::SubscriptionAdded {
            sub_id,
            next_deliver: start_seq,
        })
    }

    /// Resolve a start position against the store. Deterministic: the
    /// store state at apply time is fully determined by the log prefix.
    fn resolve_start(&self, start: StartPosition) -> Result<u64> {
        let (first, last) = self.messages.first_and_last_sequence()?;
        Ok(match start {
            StartPosition::NewOnly => last + 1,
            StartPosition::AllAvailable => first.max(1),
            StartPosition::Sequence(seq) => seq.clamp(first.max(1), last + 1),
        })
    }

    /// Serialize the channel's current state. Caller must ensure no apply
    /// runs concurrently (the storage layer serializes apply and snapshot
    /// on the same path).
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let (first_seq, last_seq) = self.messages.first_and_last_sequence()?;
        let snapshot = ChannelSnapshot {
            first_seq,
            last_seq,
            messages: self.messages.all_messages()?,
            subscriptions: self.subscriptions.all_subs()?,
        };
        bincode::serialize(&snapshot).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Replace store contents from a serialized snapshot. Each store's
    /// swap is atomic with respect to its readers.
    pub fn restore(&self, data: &[u8]) -> Result<()> {
        let snapshot: ChannelSnapshot =
            bincode::deserialize(data).map_err(|e| Error::Encoding(e.to_string()))?;
        self.messages
            .restore(snapshot.first_seq, snapshot.last_seq, snapshot.messages)?;
        self.subscriptions.restore(snapshot.subscriptions)?;
        self.published_tx.send_replace(snapshot.last_seq);
        Ok(())
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn message_store(&self) -> &Arc<dyn MessageStore> {
        &self.messages
    }

    pub fn subscription_store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }
}
