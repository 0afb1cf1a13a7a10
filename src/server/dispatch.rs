//! Leader-side message delivery.
//!
//! One dispatcher per channel per node. While the local node leads the
//! channel it delivers committed messages to locally attached subscription
//! handles: each subscription gets a single-consumer ordered channel,
//! bounded by its max-inflight window, with explicit acknowledgment and
//! timed redelivery of unacked messages. While the node is a follower the
//! dispatcher idles; attached handles receive nothing until leadership
//! returns to this node.
//!
//! Delivery bookkeeping (`SendMsg`) is replicated best-effort so the sent
//! high-water mark survives failover. Acknowledgments are leader-local,
//! in-memory state: they are deliberately not replicated, which is why a
//! new leader redelivers from the replicated cursor after failover
//! (at-least-once).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::cluster::{retry, Channel, ChannelOp};
use crate::error::{Error, Result};
use crate::types::{ChannelRole, Message};

/// How often the loop scans for expired acks even without new messages.
const REDELIVERY_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// A locally attached subscription to register for delivery.
pub(crate) struct AttachSpec {
    /// Replicated subscription record id.
    pub sub_id: u64,
    /// Local member token (distinct per handle; queue group members share
    /// `sub_id` but not this).
    pub member_token: u64,
    /// First sequence to deliver, from the committed add/reopen result.
    pub next_deliver: u64,
    pub queue_group: Option<String>,
    pub max_inflight: usize,
    pub ack_wait: Duration,
    pub tx: mpsc::Sender<Message>,
}

struct LiveSub {
    sub_id: u64,
    tx: mpsc::Sender<Message>,
    next_seq: u64,
    max_inflight: usize,
    ack_wait: Duration,
    /// Unacked deliveries: sequence → last send time.
    pending: BTreeMap<u64, Instant>,
    dead: bool,
}

struct QueueMember {
    member_token: u64,
    tx: mpsc::Sender<Message>,
    max_inflight: usize,
    dead: bool,
}

struct QueueGroup {
    /// Shared replicated record id.
    record_id: u64,
    next_seq: u64,
    ack_wait: Duration,
    rr_cursor: usize,
    members: Vec<QueueMember>,
    /// Unacked deliveries: sequence → (member token, last send time).
    pending: BTreeMap<u64, (u64, Instant)>,
}

impl QueueGroup {
    fn member_inflight(&self, token: u64) -> usize {
        self.pending.values().filter(|(t, _)| *t == token).count()
    }
}

#[derive(Default)]
struct DispatchState {
    /// Plain and durable subscriptions, keyed by member token.
    singles: HashMap<u64, LiveSub>,
    /// Queue groups, keyed by group name.
    queues: HashMap<String, QueueGroup>,
}

/// Per-channel delivery engine.
pub(crate) struct Dispatcher {
    channel: Arc<Channel>,
    state: Mutex<DispatchState>,
    wake: Notify,
    shutdown_tx: broadcast::Sender<()>,
}

impl Dispatcher {
    /// Create the dispatcher and start its delivery loop.
    pub fn start(channel: Arc<Channel>, shutdown_tx: broadcast::Sender<()>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            channel,
            state: Mutex::new(DispatchState::default()),
            wake: Notify::new(),
            shutdown_tx,
        });
        dispatcher.spawn_loop();
        dispatcher
    }

    /// Register a local subscription handle for delivery.
    pub async fn attach(&self, spec: AttachSpec) {
        let mut state = self.state.lock().await;
        match &spec.queue_group {
            None => {
                state.singles.insert(
                    spec.member_token,
                    LiveSub {
                        sub_id: spec.sub_id,
                        tx: spec.tx,
                        next_seq: spec.next_deliver,
                        max_inflight: spec.max_inflight.max(1),
                        ack_wait: spec.ack_wait,
                        pending: BTreeMap::new(),
                        dead: false,
                    },
                );
            }
            Some(group) => {
                let entry = state
                    .queues
                    .entry(group.clone())
                    .or_insert_with(|| QueueGroup {
                        record_id: spec.sub_id,
                        next_seq: spec.next_deliver,
                        ack_wait: spec.ack_wait,
                        rr_cursor: 0,
                        members: Vec::new(),
                        pending: BTreeMap::new(),
                    });
                entry.members.push(QueueMember {
                    member_token: spec.member_token,
                    tx: spec.tx,
                    max_inflight: spec.max_inflight.max(1),
                    dead: false,
                });
            }
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Remove a local handle. The replicated record is untouched.
    pub async fn detach(&self, member_token: u64) {
        let mut state = self.state.lock().await;
        if state.singles.remove(&member_token).is_some() {
            return;
        }
        let mut emptied = None;
        for (name, group) in state.queues.iter_mut() {
            group.members.retain(|m| m.member_token != member_token);
            group
                .pending
                .retain(|_, (token, _)| *token != member_token);
            if group.members.is_empty() {
                emptied = Some(name.clone());
            }
        }
        if let Some(name) = emptied {
            state.queues.remove(&name);
        }
    }

    /// Acknowledge one delivered message. Leader-local: frees the inflight
    /// slot and stops redelivery, nothing is replicated.
    pub async fn ack(&self, member_token: u64, sub_id: u64, seq: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(sub) = state.singles.get_mut(&member_token) {
            sub.pending.remove(&seq);
        } else if let Some(group) = state
            .queues
            .values_mut()
            .find(|g| g.record_id == sub_id)
        {
            group.pending.remove(&seq);
        } else {
            return Err(Error::UnknownSubscription(sub_id));
        }
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    fn spawn_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut role_rx = this.channel.replicator().role_watch();
            let mut published_rx = this.channel.published_watch();
            let mut shutdown = this.shutdown_tx.subscribe();
            let mut scan = tokio::time::interval(REDELIVERY_SCAN_INTERVAL);
            scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    changed = role_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = published_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = this.wake.notified() => {}
                    _ = scan.tick() => {}
                }

                if *role_rx.borrow() != ChannelRole::Leader {
                    continue;
                }
                this.pump().await;
            }
        });
    }

    /// Deliver everything deliverable, then redeliver expired pending
    /// messages.
    async fn pump(&self) {
        let store = self.channel.message_store().clone();
        let (first, last) = match store.first_and_last_sequence() {
            Ok(range) => range,
            Err(e) => {
                warn!(channel = self.channel.name(), error = %e, "Message store read failed");
                return;
            }
        };

        let mut sent: Vec<(u64, u64)> = Vec::new();
        let now = Instant::now();

        {
            let mut state = self.state.lock().await;

            for sub in state.singles.values_mut() {
                if sub.dead {
                    continue;
                }
                // The retention floor may have moved past the cursor.
                if sub.next_seq < first.max(1) {
                    sub.next_seq = first.max(1);
                }
                while sub.pending.len() < sub.max_inflight && sub.next_seq <= last {
                    let msg = match store.lookup(sub.next_seq) {
                        Ok(Some(msg)) => msg,
                        Ok(None) => {
                            sub.next_seq += 1;
                            continue;
                        }
                        Err(e) => {
                            warn!(
                                channel = self.channel.name(),
                                seq = sub.next_seq,
                                error = %e,
                                "Lookup failed during dispatch"
                            );
                            break;
                        }
                    };
                    let seq = msg.sequence;
                    match sub.tx.try_send(msg) {
                        Ok(()) => {
                            trace!(
                                channel = self.channel.name(),
                                sub_id = sub.sub_id,
                                seq,
                                "Delivered"
                            );
                            sub.pending.insert(seq, now);
                            sent.push((sub.sub_id, seq));
                            sub.next_seq = seq + 1;
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => break,
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            sub.dead = true;
                            break;
                        }
                    }
                }

                // Redeliver what has waited past the ack window.
                let expired: Vec<u64> = sub
                    .pending
                    .iter()
                    .filter(|(_, sent_at)| now.duration_since(**sent_at) >= sub.ack_wait)
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in expired {
                    if let Ok(Some(msg)) = store.lookup(seq) {
                        if sub.tx.try_send(msg).is_ok() {
                            debug!(
                                channel = self.channel.name(),
                                sub_id = sub.sub_id,
                                seq,
                                "Redelivered unacknowledged message"
                            );
                            sub.pending.insert(seq, now);
                        }
                    }
                }
            }
            state.singles.retain(|_, sub| !sub.dead);

            for group in state.queues.values_mut() {
                group.members.retain(|m| !m.dead);
                if group.members.is_empty() {
                    continue;
                }
                if group.next_seq < first.max(1) {
                    group.next_seq = first.max(1);
                }
                'deliver: while group.next_seq <= last {
                    let msg = match store.lookup(group.next_seq) {
                        Ok(Some(msg)) => msg,
                        Ok(None) => {
                            group.next_seq += 1;
                            continue;
                        }
                        Err(_) => break,
                    };
                    // Round-robin to the next member with spare inflight
                    // capacity.
                    let member_count = group.members.len();
                    let mut chosen = None;
                    for offset in 0..member_count {
                        let idx = (group.rr_cursor + offset) % member_count;
                        let token = group.members[idx].member_token;
                        if group.member_inflight(token) < group.members[idx].max_inflight {
                            chosen = Some(idx);
                            break;
                        }
                    }
                    let Some(idx) = chosen else { break 'deliver };
                    let seq = msg.sequence;
                    let token = group.members[idx].member_token;
                    match group.members[idx].tx.try_send(msg) {
                        Ok(()) => {
                            group.pending.insert(seq, (token, now));
                            sent.push((group.record_id, seq));
                            group.next_seq = seq + 1;
                            group.rr_cursor = (idx + 1) % member_count;
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => break,
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            group.members[idx].dead = true;
                            group
                                .pending
                                .retain(|_, (pending_token, _)| *pending_token != token);
                            continue;
                        }
                    }
                }

                // Expired queue deliveries may go to a different member.
                let expired: Vec<u64> = group
                    .pending
                    .iter()
                    .filter(|(_, (_, sent_at))| now.duration_since(*sent_at) >= group.ack_wait)
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in expired {
                    let member_count = group.members.len();
                    if member_count == 0 {
                        break;
                    }
                    let idx = group.rr_cursor % member_count;
                    if let Ok(Some(msg)) = store.lookup(seq) {
                        let token = group.members[idx].member_token;
                        if group.members[idx].tx.try_send(msg).is_ok() {
                            debug!(
                                channel = self.channel.name(),
                                record_id = group.record_id,
                                seq,
                                "Requeued unacknowledged message"
                            );
                            group.pending.insert(seq, (token, now));
                            group.rr_cursor = (idx + 1) % member_count;
                        }
                    }
                }
            }
        }

        if !sent.is_empty() {
            self.replicate_sent(sent);
        }
    }

    /// Replicate delivery bookkeeping, best-effort. A failure only widens
    /// the redelivery window after failover.
    fn replicate_sent(&self, sent: Vec<(u64, u64)>) {
        let replicator = self.channel.replicator().clone();
        let channel = self.channel.name().to_string();
        tokio::spawn(async move {
            for (sub_id, seq) in sent {
                let outcome = (|| async {
                    replicator
                        .propose(ChannelOp::SendMsg { sub_id, seq })
                        .await
                })
                .retry(retry::bookkeeping_policy())
                .when(|e: &Error| e.is_retriable())
                .await;

                if let Err(e) = outcome {
                    debug!(
                        channel = %channel,
                        sub_id,
                        seq,
                        error = %e,
                        "Delivery bookkeeping not replicated"
                    );
                }
            }
        });
    }
}
