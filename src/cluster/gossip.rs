//! SWIM-style membership digests (Das, Gupta, Motivala 2002), generalized
//! from the teacher's `membership/swim.rs` to wire through the `Transport`
//! trait instead of a queue-only placeholder.

use crate::types::{NodeId, NodeState};
use serde::{Deserialize, Serialize};

/// One node's membership claim as exchanged during a gossip round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipDigest {
    pub node_id: NodeId,
    pub state: NodeState,
    pub heartbeat_seq: u64,
    pub incarnation: u64,
    pub priority: i64,
    pub address: String,
    pub port: u16,
}

/// A full gossip exchange: the sender's view of the whole roster, capped at
/// `dissemination_speed` freshest entries per round to bound message size,
/// plus the sender's leadership claim so two healed partitions can recognize
/// a split brain without a dedicated message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPayload {
    pub digests: Vec<GossipDigest>,
    pub leader_node_id: Option<NodeId>,
    pub leader_term: u64,
    pub term_history: Vec<(u64, u64)>,
}

/// Whether an incoming digest about `target` should overwrite local
/// knowledge: a digest wins if its incarnation is newer, or equal
/// incarnation but the state is "more failed" than what's known locally
/// (ALIVE < SUSPECT < DEAD in severity, ties keep the newer heartbeat_seq).
pub fn digest_supersedes(local_incarnation: u64, local_seq: u64, incoming: &GossipDigest) -> bool {
    if incoming.incarnation != local_incarnation {
        return incoming.incarnation > local_incarnation;
    }
    incoming.heartbeat_seq > local_seq
}

/// Severity ordering used to decide whether a rumor about `node_id` should
/// move it further along the failure path rather than backward.
pub fn state_severity(state: NodeState) -> u8 {
    match state {
        NodeState::Active | NodeState::Leader | NodeState::Joining => 0,
        NodeState::Degraded => 1,
        NodeState::Unreachable => 2,
        NodeState::Leaving => 3,
    }
}
