//! # stanza
//!
//! A durable, replayable publish/subscribe message log with cluster-wide
//! fault tolerance.
//!
//! Clients publish messages to named channels; each channel durably stores
//! them under monotonically increasing sequence numbers and delivers them
//! to subscribers with durable, queue-group, and replay-from-offset
//! semantics. Every channel is backed by its own Raft consensus group:
//! publishes and subscription changes commit on a majority of nodes before
//! they are acknowledged, so a channel survives leader failure without
//! losing data, and lagging or rejoining nodes catch up by log replay or
//! snapshot installation.
//!
//! # Goals
//! - Per-channel replication: independent channels fail over independently
//! - At-least-once delivery with explicit acks and timed redelivery
//! - Bounded raft logs through channel snapshots with configurable
//!   trailing-log retention
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use stanza::cluster::ClusterConfig;
//! use stanza::server::Node;
//! use stanza::types::{StartPosition, SubscriptionOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // A standalone node: no peers, leads every channel itself.
//!     let node = Node::start(ClusterConfig::default()).await?;
//!
//!     let seq = node.publish("orders", "hello").await?;
//!     assert_eq!(seq, 1);
//!
//!     let mut sub = node
//!         .subscribe(
//!             "orders",
//!             "client-1",
//!             SubscriptionOptions {
//!                 start: StartPosition::AllAvailable,
//!                 ..Default::default()
//!             },
//!         )
//!         .await?;
//!
//!     if let Some(msg) = sub.next_message().await {
//!         sub.ack(msg.sequence).await?;
//!     }
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Clustered operation is the same API with peers configured; see
//! `demos/cluster.rs` for a three-node cluster with failover.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod error;
pub mod server;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use server::{Node, Subscription};
pub use types::{Message, NodeState, StartPosition, SubscriptionOptions};
