//! ClusterManager: membership (gossip), heartbeats, leader election
//! (Raft-style, priority-aware), split-brain detection, and quorum
//! enforcement (§4.2).

pub mod election;
pub mod gossip;
mod manager;

pub use manager::{cluster_id_for, ClusterManager, TopologyObserver};
