//! Three-node cluster with leader failover.
//!
//! Run with `cargo run --example cluster`. Starts three nodes on loopback,
//! publishes through the cluster, kills the channel leader, and shows the
//! surviving nodes electing a replacement and staying consistent.

use std::time::Duration;

use stanza::cluster::ClusterConfig;
use stanza::server::Node;
use stanza::types::{StartPosition, SubscriptionOptions};

fn config(id: &str, port: u16, peers: &[(&str, u16)]) -> ClusterConfig {
    ClusterConfig {
        node_id: Some(id.to_string()),
        listen_addr: format!("127.0.0.1:{port}"),
        peers: peers
            .iter()
            .map(|(peer, peer_port)| (peer.to_string(), format!("127.0.0.1:{peer_port}")))
            .collect(),
        raft_log_path: format!("/tmp/stanza-demo/{id}"),
        heartbeat_interval: Duration::from_millis(50),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stanza=info".into()),
        )
        .init();

    let a = Node::start(config("a", 4460, &[("b", 4461), ("c", 4462)])).await?;
    let b = Node::start(config("b", 4461, &[("a", 4460), ("c", 4462)])).await?;
    let c = Node::start(config("c", 4462, &[("a", 4460), ("b", 4461)])).await?;

    let seq = a.publish("orders", "hello").await?;
    println!("published 'hello' at sequence {seq}");

    let mut sub = a
        .subscribe(
            "orders",
            "demo-client",
            SubscriptionOptions {
                start: StartPosition::AllAvailable,
                ..Default::default()
            },
        )
        .await?;

    let nodes = [&a, &b, &c];
    let leader = nodes
        .iter()
        .find(|n| n.is_channel_leader("orders"))
        .map(|n| n.node_id().to_string());
    println!("channel leader: {leader:?}");

    // If node `a` leads, read the first message before failing it over.
    if let Some(msg) = sub.try_next() {
        println!("received seq {} = {:?}", msg.sequence, msg.data);
        sub.ack(msg.sequence).await?;
    }

    // Kill the leader; the survivors elect a replacement.
    match leader.as_deref() {
        Some("a") => a.shutdown().await,
        Some("b") => b.shutdown().await,
        _ => c.shutdown().await,
    }

    let survivor = if leader.as_deref() == Some("a") { &b } else { &a };
    for i in 0..5 {
        let seq = survivor.publish("orders", format!("msg-{i}")).await?;
        println!("published 'msg-{i}' at sequence {seq}");
    }

    let (first, last) = survivor.channel_sequences("orders")?;
    println!("survivor store range: {first}..={last}");

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
    Ok(())
}
