//! Single-node integration tests: publish/subscribe flow, delivery
//! semantics, restart recovery, and configuration fail-fast.

use std::sync::Arc;
use std::time::Duration;

use object_store::memory::InMemory;
use object_store::ObjectStore;
use tokio::time::sleep;

use stanza::cluster::ClusterConfig;
use stanza::server::{Node, Subscription};
use stanza::types::{Message, NodeState, StartPosition, SubscriptionOptions};
use stanza::Error;

mod util;
use util::next_port;

fn standalone_config() -> ClusterConfig {
    ClusterConfig {
        node_id: Some("solo".to_string()),
        listen_addr: format!("127.0.0.1:{}", next_port()),
        heartbeat_interval: Duration::from_millis(50),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        proposal_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn start_standalone() -> (Node, Arc<InMemory>) {
    let snapshots = Arc::new(InMemory::new());
    let node = Node::start_with_object_store(
        standalone_config(),
        snapshots.clone() as Arc<dyn ObjectStore>,
    )
    .await
    .unwrap();
    (node, snapshots)
}

async fn expect_msg(sub: &mut Subscription, window: Duration) -> Message {
    tokio::time::timeout(window, sub.next_message())
        .await
        .expect("timed out waiting for message")
        .expect("delivery channel closed")
}

async fn expect_no_msg(sub: &mut Subscription, window: Duration) {
    if let Ok(Some(msg)) = tokio::time::timeout(window, sub.next_message()).await {
        panic!("unexpected delivery of sequence {}", msg.sequence);
    }
}

// ============================================================================
// Basic Flow
// ============================================================================

#[tokio::test]
async fn standalone_publish_assigns_contiguous_sequences() {
    let (node, _snapshots) = start_standalone().await;
    assert_eq!(node.state(), NodeState::Standalone);

    assert_eq!(node.publish("foo", "one").await.unwrap(), 1);
    assert_eq!(node.publish("foo", "two").await.unwrap(), 2);
    assert_eq!(node.publish("foo", "three").await.unwrap(), 3);

    assert_eq!(node.channel_sequences("foo").unwrap(), (1, 3));
    assert_eq!(
        &node.channel_lookup("foo", 2).unwrap().unwrap().data[..],
        b"two"
    );

    node.shutdown().await;
    assert_eq!(node.state(), NodeState::Shutdown);
}

#[tokio::test]
async fn channels_are_independent() {
    let (node, _snapshots) = start_standalone().await;

    assert_eq!(node.publish("foo", "a").await.unwrap(), 1);
    assert_eq!(node.publish("bar", "b").await.unwrap(), 1);
    assert_eq!(node.publish("foo", "c").await.unwrap(), 2);

    assert_eq!(node.channel_sequences("foo").unwrap(), (1, 2));
    assert_eq!(node.channel_sequences("bar").unwrap(), (1, 1));

    node.shutdown().await;
}

#[tokio::test]
async fn subscribe_all_available_replays_and_continues() {
    let (node, _snapshots) = start_standalone().await;

    node.publish("foo", "first").await.unwrap();
    node.publish("foo", "second").await.unwrap();

    let mut sub = node
        .subscribe(
            "foo",
            "client-1",
            SubscriptionOptions {
                start: StartPosition::AllAvailable,
                max_inflight: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let msg = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!((msg.sequence, &msg.data[..]), (1, b"first" as &[u8]));
    sub.ack(1).await.unwrap();

    let msg = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!((msg.sequence, &msg.data[..]), (2, b"second" as &[u8]));
    sub.ack(2).await.unwrap();

    // New publishes keep flowing to the live handle.
    node.publish("foo", "third").await.unwrap();
    let msg = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!((msg.sequence, &msg.data[..]), (3, b"third" as &[u8]));
    sub.ack(3).await.unwrap();

    node.shutdown().await;
}

#[tokio::test]
async fn subscribe_new_only_skips_backlog() {
    let (node, _snapshots) = start_standalone().await;

    node.publish("foo", "old").await.unwrap();

    let mut sub = node
        .subscribe("foo", "client-1", SubscriptionOptions::default())
        .await
        .unwrap();
    expect_no_msg(&mut sub, Duration::from_millis(300)).await;

    node.publish("foo", "new").await.unwrap();
    let msg = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(msg.sequence, 2);

    node.shutdown().await;
}

#[tokio::test]
async fn subscribe_at_sequence_starts_mid_stream() {
    let (node, _snapshots) = start_standalone().await;

    for i in 0..4 {
        node.publish("foo", format!("m{i}")).await.unwrap();
    }

    let mut sub = node
        .subscribe(
            "foo",
            "client-1",
            SubscriptionOptions {
                start: StartPosition::Sequence(3),
                max_inflight: 4,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let msg = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(msg.sequence, 3);

    node.shutdown().await;
}

// ============================================================================
// Delivery Semantics
// ============================================================================

#[tokio::test]
async fn unacked_message_is_redelivered() {
    let (node, _snapshots) = start_standalone().await;

    node.publish("foo", "pending").await.unwrap();

    let mut sub = node
        .subscribe(
            "foo",
            "client-1",
            SubscriptionOptions {
                start: StartPosition::AllAvailable,
                max_inflight: 1,
                ack_wait: Duration::from_millis(300),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let first = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(first.sequence, 1);

    // No ack: the same sequence comes around again.
    let redelivered = expect_msg(&mut sub, Duration::from_secs(3)).await;
    assert_eq!(redelivered.sequence, 1);
    sub.ack(1).await.unwrap();

    node.shutdown().await;
}

#[tokio::test]
async fn max_inflight_bounds_outstanding_deliveries() {
    let (node, _snapshots) = start_standalone().await;

    for i in 0..5 {
        node.publish("foo", format!("m{i}")).await.unwrap();
    }

    let mut sub = node
        .subscribe(
            "foo",
            "client-1",
            SubscriptionOptions {
                start: StartPosition::AllAvailable,
                max_inflight: 2,
                ack_wait: Duration::from_secs(30),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let a = expect_msg(&mut sub, Duration::from_secs(2)).await;
    let b = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!((a.sequence, b.sequence), (1, 2));

    // Window full, nothing else arrives until an ack frees a slot.
    expect_no_msg(&mut sub, Duration::from_millis(400)).await;

    sub.ack(1).await.unwrap();
    let c = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(c.sequence, 3);

    node.shutdown().await;
}

#[tokio::test]
async fn queue_group_delivers_each_message_to_one_member() {
    let (node, _snapshots) = start_standalone().await;

    let opts = || SubscriptionOptions {
        start: StartPosition::AllAvailable,
        queue_group: Some("workers".to_string()),
        max_inflight: 2,
        ..Default::default()
    };
    let mut member_a = node.subscribe("foo", "client-a", opts()).await.unwrap();
    let mut member_b = node.subscribe("foo", "client-b", opts()).await.unwrap();

    for i in 0..6 {
        node.publish("foo", format!("job-{i}")).await.unwrap();
    }

    let mut received = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while received.len() < 6 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue group only delivered {received:?}"
        );
        for member in [&mut member_a, &mut member_b] {
            if let Some(msg) = member.try_next() {
                member.ack(msg.sequence).await.unwrap();
                received.push(msg.sequence);
            }
        }
        sleep(Duration::from_millis(20)).await;
    }

    received.sort_unstable();
    assert_eq!(received, vec![1, 2, 3, 4, 5, 6], "each job exactly once");

    node.shutdown().await;
}

#[tokio::test]
async fn durable_close_and_reopen_resumes() {
    let (node, _snapshots) = start_standalone().await;

    node.publish("foo", "one").await.unwrap();

    let durable = || SubscriptionOptions {
        start: StartPosition::AllAvailable,
        durable_name: Some("audit".to_string()),
        max_inflight: 1,
        ..Default::default()
    };
    let mut sub = node.subscribe("foo", "client-1", durable()).await.unwrap();
    let msg = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(msg.sequence, 1);
    sub.close().await.unwrap();

    node.publish("foo", "two").await.unwrap();

    // Reopen under the same durable name. Acks are not replicated, so the
    // cursor is still at the start: sequence 1 is redelivered, then 2.
    let mut sub = node.subscribe("foo", "client-1", durable()).await.unwrap();
    let msg = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(msg.sequence, 1);
    sub.ack(1).await.unwrap();
    let msg = expect_msg(&mut sub, Duration::from_secs(2)).await;
    assert_eq!(msg.sequence, 2);
    sub.ack(2).await.unwrap();

    node.shutdown().await;
}

// ============================================================================
// Restart Recovery
// ============================================================================

#[tokio::test]
async fn restart_from_snapshot_neither_duplicates_nor_skips() {
    let snapshots = Arc::new(InMemory::new());
    let config = standalone_config();

    {
        let node = Node::start_with_object_store(
            config.clone(),
            snapshots.clone() as Arc<dyn ObjectStore>,
        )
        .await
        .unwrap();
        for i in 0..3 {
            node.publish("foo", format!("m{i}")).await.unwrap();
        }
        node.trigger_snapshot("foo").await.unwrap();
        node.shutdown().await;
    }

    let node =
        Node::start_with_object_store(config, snapshots.clone() as Arc<dyn ObjectStore>)
            .await
            .unwrap();

    // The channel is created lazily; touch it so the snapshot loads.
    let seq = node.publish("foo", "after-restart").await.unwrap();
    assert_eq!(seq, 4, "sequence numbering resumes without gaps");
    assert_eq!(node.channel_sequences("foo").unwrap(), (1, 4));
    for (seq, expected) in [(1, "m0"), (2, "m1"), (3, "m2"), (4, "after-restart")] {
        let msg = node.channel_lookup("foo", seq).unwrap().unwrap();
        assert_eq!(&msg.data[..], expected.as_bytes());
    }

    node.shutdown().await;
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn peers_without_node_id_refuse_to_start() {
    let config = ClusterConfig {
        node_id: None,
        listen_addr: format!("127.0.0.1:{}", next_port()),
        peers: vec![("b".to_string(), "127.0.0.1:1".to_string())],
        ..Default::default()
    };
    let result =
        Node::start_with_object_store(config, Arc::new(InMemory::new()) as Arc<dyn ObjectStore>)
            .await;
    match result {
        Err(Error::Config(message)) => assert!(message.contains("node id")),
        Err(other) => panic!("expected config error, got {other}"),
        Ok(_) => panic!("expected config error, node started"),
    }
}

#[tokio::test]
async fn operations_after_shutdown_fail_cleanly() {
    let (node, _snapshots) = start_standalone().await;
    node.publish("foo", "x").await.unwrap();
    node.shutdown().await;

    assert!(matches!(
        node.publish("foo", "y").await,
        Err(Error::Shutdown)
    ));
    assert!(matches!(
        node.subscribe("foo", "c", SubscriptionOptions::default())
            .await,
        Err(Error::Shutdown)
    ));
}
