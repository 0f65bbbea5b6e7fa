//! `ReplicationRecord` and version-vector causality (§3, §4.4). Grounded on
//! the teacher's `consensus/state_machine.rs` apply-log idiom, generalized
//! here to carry a version vector instead of a single Raft log index.

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub record_id: String,
    pub data_type: String,
    pub payload: Vec<u8>,
    pub version_vector: HashMap<NodeId, u64>,
    pub origin_node_id: NodeId,
    pub origin_wall_clock: u64,
    /// Per-destination delivery ordering counter, assigned by the sender at
    /// shipment time; gaps in this sequence trigger a pull request (§4.4).
    pub origin_counter: u64,
}

/// Pointwise merge of two version vectors.
pub fn merge_version_vectors(
    a: &HashMap<NodeId, u64>,
    b: &HashMap<NodeId, u64>,
) -> HashMap<NodeId, u64> {
    let mut merged = a.clone();
    for (node, counter) in b {
        let entry = merged.entry(node.clone()).or_insert(0);
        if *counter > *entry {
            *entry = *counter;
        }
    }
    merged
}

/// Two version vectors conflict when neither dominates the other (§3):
/// incomparable, i.e. `a` has a strictly greater entry than `b` on at least
/// one node and vice versa.
pub fn vectors_conflict(a: &HashMap<NodeId, u64>, b: &HashMap<NodeId, u64>) -> bool {
    let a_greater = a.iter().any(|(n, &c)| c > *b.get(n).unwrap_or(&0));
    let b_greater = b.iter().any(|(n, &c)| c > *a.get(n).unwrap_or(&0));
    a_greater && b_greater
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vv(pairs: &[(&str, u64)]) -> HashMap<NodeId, u64> {
        pairs.iter().map(|(n, c)| (NodeId::new(*n), *c)).collect()
    }

    #[test]
    fn identical_vectors_do_not_conflict() {
        let a = vv(&[("n1", 1), ("n2", 2)]);
        assert!(!vectors_conflict(&a, &a));
    }

    #[test]
    fn dominating_vector_does_not_conflict() {
        let a = vv(&[("n1", 1)]);
        let b = vv(&[("n1", 2)]);
        assert!(!vectors_conflict(&a, &b));
    }

    #[test]
    fn incomparable_vectors_conflict() {
        let a = vv(&[("n1", 2), ("n2", 0)]);
        let b = vv(&[("n1", 1), ("n2", 1)]);
        assert!(vectors_conflict(&a, &b));
    }

    #[test]
    fn merge_takes_pointwise_max() {
        let a = vv(&[("n1", 2), ("n2", 0)]);
        let b = vv(&[("n1", 1), ("n2", 3)]);
        let merged = merge_version_vectors(&a, &b);
        assert_eq!(merged[&NodeId::new("n1")], 2);
        assert_eq!(merged[&NodeId::new("n2")], 3);
    }
}
