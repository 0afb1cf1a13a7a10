//! Network transport for channel raft groups.
//!
//! One TCP listener per node carries the traffic of every channel group:
//! each frame names its channel and the server routes it to that channel's
//! raft instance, creating the channel on first touch. Frames are
//! length-prefixed bincode.
//!
//! Client writes can also travel over this transport: a follower that
//! knows the current leader forwards proposals instead of bouncing the
//! client, with a hop limit to stop forwarding loops.

use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::commands::{ChannelOp, ChannelOpResult};
use super::registry::ChannelRegistry;
use super::types::{RaftNodeId, TypeConfig};
use crate::error::Error;

/// Timeout for connection establishment.
const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a full request/response exchange.
const RPC_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum frame size. Snapshot installation frames carry whole channel
/// snapshots.
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum hops for forwarded client writes.
pub(crate) const MAX_FORWARD_HOPS: u8 = 3;

/// One RPC frame, addressed to a channel group.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct RaftRpcMessage {
    pub channel: String,
    pub payload: RpcPayload,
}

/// RPC payloads carried between nodes.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum RpcPayload {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<RaftNodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    /// Client write forwarded from a non-leader node.
    ClientWrite { op: ChannelOp, forward_hops: u8 },
}

/// RPC replies.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum RpcReply {
    AppendEntries(AppendEntriesResponse<RaftNodeId>),
    Vote(VoteResponse<RaftNodeId>),
    InstallSnapshot(InstallSnapshotResponse<RaftNodeId>),
    ClientWrite(ChannelOpResult),
    Error(RpcErrorInfo),
}

/// Error kind carried over the wire, preserving retry semantics.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RpcErrorKind {
    /// The target channel has no leader right now.
    NoLeader,
    /// The target node is not the leader.
    NotLeader { leader_hint: Option<String> },
    /// The forward hop limit was hit.
    ForwardLoop,
    /// The proposal timed out on the remote node; outcome unknown.
    Timeout,
    /// Other remote failure.
    Internal,
}

/// Structured RPC error with kind and message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RpcErrorInfo {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcErrorInfo {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Map a local proposal error into its wire form.
    pub fn from_error(channel: &str, e: &Error) -> Self {
        match e {
            Error::NoLeader(_) => Self::new(RpcErrorKind::NoLeader, e.to_string()),
            Error::NotLeader { leader_hint, .. } => Self::new(
                RpcErrorKind::NotLeader {
                    leader_hint: leader_hint.clone(),
                },
                e.to_string(),
            ),
            Error::Timeout(_) => Self::new(RpcErrorKind::Timeout, e.to_string()),
            _ => Self::new(
                RpcErrorKind::Internal,
                format!("channel {channel}: {e}"),
            ),
        }
    }

    /// Map the wire form back into a local error.
    pub fn into_error(self, channel: &str) -> Error {
        match self.kind {
            RpcErrorKind::NoLeader => Error::NoLeader(channel.to_string()),
            RpcErrorKind::NotLeader { leader_hint } => Error::NotLeader {
                channel: channel.to_string(),
                leader_hint,
            },
            RpcErrorKind::ForwardLoop => Error::NoLeader(channel.to_string()),
            RpcErrorKind::Timeout => Error::Timeout(RPC_OPERATION_TIMEOUT),
            RpcErrorKind::Internal => Error::Raft(self.message),
        }
    }
}

async fn write_frame<T: Serialize>(
    stream: &mut TcpStream,
    value: &T,
) -> std::io::Result<()> {
    let body = bincode::serialize(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if body.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds maximum size",
        ));
    }
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> std::io::Result<T> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds maximum size",
        ));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// One request/response exchange with a remote node.
pub(crate) async fn call(addr: &str, msg: &RaftRpcMessage) -> std::io::Result<RpcReply> {
    let mut stream = timeout(RPC_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))??;
    stream.set_nodelay(true)?;

    timeout(RPC_OPERATION_TIMEOUT, async {
        write_frame(&mut stream, msg).await?;
        read_frame(&mut stream).await
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "rpc timeout"))?
}

fn unexpected_reply() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "unexpected rpc reply variant")
}

/// Creates per-target raft connections for one channel group.
#[derive(Clone)]
pub struct ChannelNetworkFactory {
    channel: String,
}

impl ChannelNetworkFactory {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for ChannelNetworkFactory {
    type Network = ChannelNetwork;

    async fn new_client(&mut self, _target: RaftNodeId, node: &BasicNode) -> Self::Network {
        ChannelNetwork {
            channel: self.channel.clone(),
            addr: node.addr.clone(),
        }
    }
}

/// Raft RPC connection to one peer, for one channel group.
pub struct ChannelNetwork {
    channel: String,
    addr: String,
}

impl RaftNetwork<TypeConfig> for ChannelNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>,
    > {
        let msg = RaftRpcMessage {
            channel: self.channel.clone(),
            payload: RpcPayload::AppendEntries(rpc),
        };
        let reply = call(&self.addr, &msg)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        match reply {
            RpcReply::AppendEntries(resp) => Ok(resp),
            _ => Err(RPCError::Network(NetworkError::new(&unexpected_reply()))),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId, InstallSnapshotError>>,
    > {
        let msg = RaftRpcMessage {
            channel: self.channel.clone(),
            payload: RpcPayload::InstallSnapshot(rpc),
        };
        let reply = call(&self.addr, &msg)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        match reply {
            RpcReply::InstallSnapshot(resp) => Ok(resp),
            _ => Err(RPCError::Network(NetworkError::new(&unexpected_reply()))),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>>
    {
        let msg = RaftRpcMessage {
            channel: self.channel.clone(),
            payload: RpcPayload::Vote(rpc),
        };
        let reply = call(&self.addr, &msg)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        match reply {
            RpcReply::Vote(resp) => Ok(resp),
            _ => Err(RPCError::Network(NetworkError::new(&unexpected_reply()))),
        }
    }
}

/// Accepts raft traffic for every channel group on this node.
pub struct RaftRpcServer {
    listen_addr: String,
    registry: Arc<ChannelRegistry>,
}

impl RaftRpcServer {
    pub fn new(listen_addr: impl Into<String>, registry: Arc<ChannelRegistry>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            registry,
        }
    }

    /// Run the accept loop until the shutdown signal fires.
    pub async fn run(
        self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> crate::error::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(addr = %self.listen_addr, "Raft transport listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(addr = %self.listen_addr, "Raft transport shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let registry = self.registry.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, registry).await {
                                    debug!(peer = %peer, error = %e, "Raft connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed on raft transport");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    registry: Arc<ChannelRegistry>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let msg: RaftRpcMessage = match read_frame(&mut stream).await {
            Ok(msg) => msg,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let reply = dispatch(&registry, msg).await;
        write_frame(&mut stream, &reply).await?;
    }
}

/// Route one frame to its channel group, creating the channel on first
/// touch.
async fn dispatch(registry: &Arc<ChannelRegistry>, msg: RaftRpcMessage) -> RpcReply {
    let channel = match registry.get_or_create(&msg.channel).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(channel = %msg.channel, error = %e, "Failed to resolve channel for rpc");
            return RpcReply::Error(RpcErrorInfo::from_error(&msg.channel, &e));
        }
    };

    match msg.payload {
        RpcPayload::AppendEntries(req) => match channel.raft().append_entries(req).await {
            Ok(resp) => RpcReply::AppendEntries(resp),
            Err(e) => RpcReply::Error(RpcErrorInfo::new(RpcErrorKind::Internal, e.to_string())),
        },
        RpcPayload::Vote(req) => match channel.raft().vote(req).await {
            Ok(resp) => RpcReply::Vote(resp),
            Err(e) => RpcReply::Error(RpcErrorInfo::new(RpcErrorKind::Internal, e.to_string())),
        },
        RpcPayload::InstallSnapshot(req) => match channel.raft().install_snapshot(req).await {
            Ok(resp) => RpcReply::InstallSnapshot(resp),
            Err(e) => RpcReply::Error(RpcErrorInfo::new(RpcErrorKind::Internal, e.to_string())),
        },
        RpcPayload::ClientWrite { op, forward_hops } => {
            match channel
                .replicator()
                .propose_with_hops(op, forward_hops)
                .await
            {
                Ok(result) => RpcReply::ClientWrite(result),
                Err(e) => RpcReply::Error(RpcErrorInfo::from_error(&msg.channel, &e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_info_roundtrips_not_leader() {
        let original = Error::NotLeader {
            channel: "foo".to_string(),
            leader_hint: Some("b".to_string()),
        };
        let info = RpcErrorInfo::from_error("foo", &original);
        let back = info.into_error("foo");
        match back {
            Error::NotLeader {
                channel,
                leader_hint,
            } => {
                assert_eq!(channel, "foo");
                assert_eq!(leader_hint.as_deref(), Some("b"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn error_info_roundtrips_no_leader() {
        let info = RpcErrorInfo::from_error("bar", &Error::NoLeader("bar".to_string()));
        assert!(matches!(info.kind, RpcErrorKind::NoLeader));
        assert!(matches!(info.into_error("bar"), Error::NoLeader(_)));
    }

    #[test]
    fn internal_errors_map_to_raft() {
        let info = RpcErrorInfo::from_error("c", &Error::Store("disk".to_string()));
        assert!(matches!(info.kind, RpcErrorKind::Internal));
        assert!(matches!(info.into_error("c"), Error::Raft(_)));
    }
}
