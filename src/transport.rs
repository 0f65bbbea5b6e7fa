//! The `Transport` collaborator interface (§6): a connection-oriented,
//! length-delimited message transport between nodes, plus the wire frame
//! encode/decode functions for the header every inter-node message carries.

use crate::error::{Error, Result};
use crate::types::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Message types carried over the wire, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Join,
    JoinAck,
    Leave,
    Gossip,
    Heartbeat,
    VoteRequest,
    VoteResponse,
    Replicate,
    ReplicateAck,
    SnapshotChunk,
    CatchupRequest,
    LockRequest,
    LockGrant,
    LockRelease,
    StateApply,
}

/// A fully framed inter-node message: `(cluster_id, sender_node_id, term,
/// message_type, payload)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub cluster_id: [u8; 16],
    pub sender_node_id: NodeId,
    pub term: u64,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(
        cluster_id: [u8; 16],
        sender_node_id: NodeId,
        term: u64,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            cluster_id,
            sender_node_id,
            term,
            message_type,
            payload,
        }
    }

    /// Encodes the header fields plus payload as a length-prefixed binary
    /// frame: `cluster_id` (16 bytes), `sender_node_id` (length-prefixed
    /// UTF-8), `term` (u64 LE), `message_type` (u8), `payload_len` (u32 LE),
    /// payload.
    pub fn encode(&self) -> Vec<u8> {
        let sender_bytes = self.sender_node_id.as_str().as_bytes();
        let mut buf = Vec::with_capacity(16 + 4 + sender_bytes.len() + 8 + 1 + 4 + self.payload.len());
        buf.extend_from_slice(&self.cluster_id);
        buf.extend_from_slice(&(sender_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(sender_bytes);
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.push(message_type_tag(self.message_type));
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let take = |cursor: &mut usize, n: usize, buf: &[u8]| -> Result<std::ops::Range<usize>> {
            if *cursor + n > buf.len() {
                return Err(Error::Serialization("frame truncated".into()));
            }
            let r = *cursor..*cursor + n;
            *cursor += n;
            Ok(r)
        };

        let r = take(&mut cursor, 16, buf)?;
        let mut cluster_id = [0u8; 16];
        cluster_id.copy_from_slice(&buf[r]);

        let r = take(&mut cursor, 4, buf)?;
        let sender_len = u32::from_le_bytes(buf[r].try_into().unwrap()) as usize;
        let r = take(&mut cursor, sender_len, buf)?;
        let sender_node_id = NodeId::new(
            String::from_utf8(buf[r].to_vec())
                .map_err(|e| Error::Serialization(e.to_string()))?,
        );

        let r = take(&mut cursor, 8, buf)?;
        let term = u64::from_le_bytes(buf[r].try_into().unwrap());

        let r = take(&mut cursor, 1, buf)?;
        let message_type = message_type_from_tag(buf[r.start])?;

        let r = take(&mut cursor, 4, buf)?;
        let payload_len = u32::from_le_bytes(buf[r].try_into().unwrap()) as usize;
        let r = take(&mut cursor, payload_len, buf)?;
        let payload = buf[r].to_vec();

        Ok(Self {
            cluster_id,
            sender_node_id,
            term,
            message_type,
            payload,
        })
    }
}

fn message_type_tag(mt: MessageType) -> u8 {
    match mt {
        MessageType::Join => 0,
        MessageType::JoinAck => 1,
        MessageType::Leave => 2,
        MessageType::Gossip => 3,
        MessageType::Heartbeat => 4,
        MessageType::VoteRequest => 5,
        MessageType::VoteResponse => 6,
        MessageType::Replicate => 7,
        MessageType::ReplicateAck => 8,
        MessageType::SnapshotChunk => 9,
        MessageType::LockRequest => 10,
        MessageType::LockGrant => 11,
        MessageType::LockRelease => 12,
        MessageType::StateApply => 13,
        MessageType::CatchupRequest => 14,
    }
}

fn message_type_from_tag(tag: u8) -> Result<MessageType> {
    Ok(match tag {
        0 => MessageType::Join,
        1 => MessageType::JoinAck,
        2 => MessageType::Leave,
        3 => MessageType::Gossip,
        4 => MessageType::Heartbeat,
        5 => MessageType::VoteRequest,
        6 => MessageType::VoteResponse,
        7 => MessageType::Replicate,
        8 => MessageType::ReplicateAck,
        9 => MessageType::SnapshotChunk,
        10 => MessageType::LockRequest,
        11 => MessageType::LockGrant,
        12 => MessageType::LockRelease,
        13 => MessageType::StateApply,
        14 => MessageType::CatchupRequest,
        other => return Err(Error::Serialization(format!("unknown message type tag {other}"))),
    })
}

/// Connection-oriented, length-delimited transport between nodes. A real
/// implementation lives outside this crate (TCP, QUIC, whatever the
/// deployment uses); the core only depends on this trait.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Sends a frame to the given node, addressed by `node_id`. Messages from
    /// a `cluster_id` the receiver does not recognize must be refused by the
    /// receiver, not the sender.
    async fn send(&self, to: &NodeId, frame: Frame) -> Result<()>;

    /// Receives the next frame addressed to this node, if any is queued.
    async fn try_recv(&self) -> Option<Frame>;
}

/// In-memory transport double used by tests: an `Arc<Mutex<...>>`-backed
/// mailbox per `(channel, node)` pair, wired together by a shared registry so
/// multi-node scenarios run in a single process without real sockets.
///
/// Mailboxes are keyed by channel as well as node id because a single node
/// runs more than one message loop against the same logical address — e.g.
/// `ClusterManager` and `ReplicationManager` each own a distinct `Transport`
/// instance per `StartupOrchestrator::new`'s contract. A production
/// implementation gives each subsystem its own connection (or port); this
/// double models that with a channel tag instead of real sockets.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    mailboxes: Arc<Mutex<std::collections::HashMap<(String, NodeId), VecDeque<Frame>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for `transport_for_channel("default", node_id)`, for tests
    /// that only exercise one subsystem's traffic.
    pub fn transport_for(&self, node_id: NodeId) -> ChannelTransport {
        self.transport_for_channel("default", node_id)
    }

    pub fn transport_for_channel(&self, channel: impl Into<String>, node_id: NodeId) -> ChannelTransport {
        ChannelTransport {
            node_id,
            channel: channel.into(),
            registry: self.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelTransport {
    node_id: NodeId,
    channel: String,
    registry: ChannelRegistry,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, to: &NodeId, frame: Frame) -> Result<()> {
        let mut mailboxes = self.registry.mailboxes.lock().await;
        mailboxes
            .entry((self.channel.clone(), to.clone()))
            .or_default()
            .push_back(frame);
        Ok(())
    }

    async fn try_recv(&self) -> Option<Frame> {
        let mut mailboxes = self.registry.mailboxes.lock().await;
        mailboxes
            .get_mut(&(self.channel.clone(), self.node_id.clone()))
            .and_then(|q| q.pop_front())
    }
}
