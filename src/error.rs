//! Error types for stanza.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used depending on operation criticality:
//!
//! - **Fail-fast (propagate)**: configuration validation, proposals, store
//!   writes, snapshot installation. A failure here means the operation did
//!   not (or may not have) happened and the caller must decide.
//! - **Best-effort (log and continue)**: delivery bookkeeping replication,
//!   background redelivery scans. Partial failure is tolerable and is
//!   reported through `tracing`.
//!
//! Leadership-related errors carry enough information for the caller to
//! re-resolve the leader and retry: `NoLeader` means the channel currently
//! has no elected leader (retry after backoff), `NotLeader` means this node
//! lost or never had leadership (retry against the hinted leader), and
//! `Timeout` means the outcome is unknown — a retry is only safe because
//! publishes are at-least-once by contract.

use std::time::Duration;

use thiserror::Error;

/// Result type for stanza operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the replication layer and the client-facing node API.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration. Fatal at startup, the node does not start.
    #[error("configuration error: {0}")]
    Config(String),

    /// The channel currently has no elected leader.
    #[error("channel {0} has no leader")]
    NoLeader(String),

    /// This node is not (or is no longer) the leader for the channel.
    #[error("not the leader for channel {channel}")]
    NotLeader {
        channel: String,
        /// The node the caller should retry against, when known.
        leader_hint: Option<String>,
    },

    /// A proposal did not reach a majority within the window.
    /// The outcome is unknown: the entry may still commit.
    #[error("proposal timed out after {0:?} (outcome unknown)")]
    Timeout(Duration),

    /// A follower could not adopt a snapshot. Fatal to that node's channel
    /// instance; catch-up must restart from scratch.
    #[error("snapshot install failed for channel {channel}: {message}")]
    SnapshotInstall { channel: String, message: String },

    /// Message or subscription store failure on this node.
    #[error("store error: {0}")]
    Store(String),

    /// Error from the consensus layer.
    #[error("raft error: {0}")]
    Raft(String),

    /// Error from the object store backing snapshot persistence.
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Entry or snapshot encoding/decoding failure.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The node has been shut down.
    #[error("node is shut down")]
    Shutdown,

    /// The subscription id is not known on this node.
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
}

impl Error {
    /// True if the operation may succeed when retried with backoff.
    ///
    /// `Timeout` is listed as retriable because the publish contract is
    /// at-least-once: a duplicate caused by retrying an entry that did
    /// commit is within bounds.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::NoLeader(_) => true,
            Error::NotLeader { .. } => true,
            Error::Timeout(_) => true,
            Error::Raft(_) => true,
            Error::Io(e) => Self::is_io_error_retryable(e),

            Error::Config(_) => false,
            Error::SnapshotInstall { .. } => false,
            Error::Store(_) => false,
            Error::ObjectStore(_) => false,
            Error::Encoding(_) => false,
            Error::Shutdown => false,
            Error::UnknownSubscription(_) => false,
        }
    }

    /// True if the caller should re-resolve the channel leader before
    /// retrying.
    #[inline]
    pub fn should_refresh_leader(&self) -> bool {
        matches!(self, Error::NoLeader(_) | Error::NotLeader { .. })
    }

    fn is_io_error_retryable(e: &std::io::Error) -> bool {
        use std::io::ErrorKind;

        matches!(
            e.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::UnexpectedEof
        )
    }
}
