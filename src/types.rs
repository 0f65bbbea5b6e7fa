//! Shared data model: node identity, cluster membership, and health status
//! types used across every component.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque, cluster-unique node identifier. Two nodes sharing a `NodeId` is a
/// configuration error, caught by `Config::validate`.
///
/// Represented as a string rather than a numeric id because leader-election
/// ties are broken by lexicographically smaller id (§4.2), and because
/// operators name nodes by hostname, not by a generated integer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state of a single node as tracked by `ClusterManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Joining,
    Active,
    Leader,
    Degraded,
    Leaving,
    Unreachable,
}

/// A member of the cluster roster, owned by `ClusterManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
    /// Higher wins leader-election ties.
    pub priority: i64,
    pub state: NodeState,
    /// Monotonic milliseconds since the clock's arbitrary epoch; never
    /// compared across nodes, only used to detect local staleness.
    pub last_heartbeat_at: u64,
    pub metadata: HashMap<String, String>,
    /// SWIM incarnation number; bumped to refute stale suspicions about self.
    pub incarnation: u64,
}

impl Node {
    pub fn new(node_id: NodeId, address: String, port: u16, priority: i64) -> Self {
        Self {
            node_id,
            address,
            port,
            priority,
            state: NodeState::Joining,
            last_heartbeat_at: 0,
            metadata: HashMap::new(),
            incarnation: 0,
        }
    }
}

/// Overall state of the cluster as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Forming,
    Stable,
    Degraded,
    SplitBrain,
}

/// Read-only snapshot of cluster membership and term, handed out to every
/// other component and to status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    pub term: u64,
    pub leader_node_id: Option<NodeId>,
    pub state: ClusterState,
    pub members: Vec<Node>,
    /// True when this snapshot was served without quorum confirmation.
    pub stale: bool,
}

impl ClusterView {
    pub fn quorum_present(&self, cluster_size: usize) -> bool {
        let reachable = self
            .members
            .iter()
            .filter(|n| !matches!(n.state, NodeState::Unreachable | NodeState::Leaving))
            .count();
        reachable > cluster_size / 2
    }
}

/// Health status reported for a single check or for the cluster as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Role of a node within a `FailoverGroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverRole {
    Primary,
    Secondary,
    Standby,
}

/// State machine position of a `FailoverGroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverState {
    Normal,
    Detecting,
    FailingOver,
    FailedOver,
    Recovering,
    Failed,
}
