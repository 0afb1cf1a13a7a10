//! Configuration for a cluster node.

use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for one stanza node.
///
/// Every node owns its own identity, paths, and timings; there is no
/// process-wide default. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's persistent identity. Required whenever `peers` is
    /// non-empty.
    pub node_id: Option<String>,

    /// Address this node's raft transport listens on.
    pub listen_addr: String,

    /// The other members of the cluster as `(node_id, raft_addr)` pairs.
    /// Peer lists are symmetric: every node lists every other node. Empty
    /// means standalone.
    pub peers: Vec<(String, String)>,

    /// Directory for raft snapshot storage.
    pub raft_log_path: String,

    /// Log entries batched per replication RPC (the log read cache
    /// window).
    pub log_cache_size: u64,

    /// Log entries retained past the latest snapshot so slightly-lagging
    /// followers can catch up by replay instead of snapshot transfer.
    /// With 0, any follower more than one entry behind is caught up via
    /// snapshot installation.
    pub trailing_logs: u64,

    /// Take a snapshot after this many new log entries.
    pub snapshot_threshold: u64,

    /// Raft leader heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Election timeout range (min).
    pub election_timeout_min: Duration,

    /// Election timeout range (max).
    pub election_timeout_max: Duration,

    /// How long a proposal may wait for majority commit before failing
    /// with an unknown outcome.
    pub proposal_timeout: Duration,

    /// Maximum concurrent in-flight proposals per channel before
    /// backpressure rejects new ones.
    pub max_pending_proposals: usize,

    /// Bounded-retry attempts at the publish boundary, covering the
    /// window where a leader is elected but leadership has not yet
    /// propagated.
    pub publish_retry_attempts: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: "127.0.0.1:4450".to_string(),
            peers: Vec::new(),
            raft_log_path: "/tmp/stanza-raft".to_string(),
            log_cache_size: 512,
            trailing_logs: 10_240,
            snapshot_threshold: 1_024,
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            proposal_timeout: Duration::from_secs(5),
            max_pending_proposals: 1_024,
            publish_retry_attempts: 10,
        }
    }
}

impl ClusterConfig {
    /// Validate the configuration. Fails fast before any node state is
    /// created.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if !self.peers.is_empty() && self.node_id.is_none() {
            errors.push("cluster peers configured without a node id".to_string());
        }

        if let Some(id) = &self.node_id {
            if id.is_empty() {
                errors.push("node id must not be empty".to_string());
            }
            if self.peers.iter().any(|(peer_id, _)| peer_id == id) {
                errors.push(format!("node id {id:?} must not appear in its own peer list"));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for (peer_id, _) in &self.peers {
            if !seen.insert(peer_id) {
                errors.push(format!("duplicate peer id {peer_id:?}"));
            }
        }

        if self.election_timeout_min >= self.election_timeout_max {
            errors.push(format!(
                "election_timeout_min ({:?}) must be less than election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            errors.push(format!(
                "heartbeat_interval ({:?}) must be less than election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.max_pending_proposals == 0 {
            errors.push("max_pending_proposals must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(errors.join(", ")))
        }
    }

    /// True if this node runs without peers.
    pub fn is_standalone(&self) -> bool {
        self.peers.is_empty()
    }

    /// Map onto the consensus library's configuration. One instance per
    /// channel group.
    pub fn to_openraft_config(&self, channel: &str) -> openraft::Config {
        openraft::Config {
            cluster_name: format!("stanza-{channel}"),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            max_payload_entries: self.log_cache_size,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: self.trailing_logs,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustered() -> ClusterConfig {
        ClusterConfig {
            node_id: Some("a".to_string()),
            peers: vec![
                ("b".to_string(), "127.0.0.1:4451".to_string()),
                ("c".to_string(), "127.0.0.1:4452".to_string()),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn default_is_valid_standalone() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_standalone());
    }

    #[test]
    fn clustered_config_is_valid() {
        let config = clustered();
        assert!(config.validate().is_ok());
        assert!(!config.is_standalone());
    }

    #[test]
    fn peers_without_node_id_fail_fast() {
        let config = ClusterConfig {
            node_id: None,
            peers: vec![("b".to_string(), "127.0.0.1:4451".to_string())],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("without a node id"));
    }

    #[test]
    fn empty_node_id_rejected() {
        let config = ClusterConfig {
            node_id: Some(String::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn self_in_peer_list_rejected() {
        let mut config = clustered();
        config
            .peers
            .push(("a".to_string(), "127.0.0.1:4450".to_string()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_peer_rejected() {
        let mut config = clustered();
        config
            .peers
            .push(("b".to_string(), "127.0.0.1:9999".to_string()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn election_timeout_ordering_enforced() {
        let config = ClusterConfig {
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(400),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_faster_than_election_enforced() {
        let config = ClusterConfig {
            heartbeat_interval: Duration::from_millis(400),
            election_timeout_min: Duration::from_millis(300),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn openraft_config_mapping() {
        let config = ClusterConfig {
            trailing_logs: 0,
            snapshot_threshold: 8,
            ..clustered()
        };
        let rc = config.to_openraft_config("foo");
        assert_eq!(rc.cluster_name, "stanza-foo");
        assert_eq!(rc.heartbeat_interval, 100);
        assert_eq!(rc.election_timeout_min, 300);
        assert_eq!(rc.max_in_snapshot_log_to_keep, 0);
        assert!(matches!(
            rc.snapshot_policy,
            openraft::SnapshotPolicy::LogsSinceLast(8)
        ));
    }
}
