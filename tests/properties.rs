//! Property tests for the pure decision functions underneath election,
//! gossip, and replication conflict detection. These need no tokio runtime:
//! every function under test is synchronous and side-effect free.

use proptest::prelude::*;
use std::collections::HashMap;

use transferha::cluster::election::{better_candidate, has_majority};
use transferha::cluster::gossip::{digest_supersedes, state_severity, GossipDigest};
use transferha::replication::{merge_version_vectors, vectors_conflict};
use transferha::types::{NodeId, NodeState};

fn node_id_strategy() -> impl Strategy<Value = NodeId> {
    "[a-z]{1,8}".prop_map(NodeId::new)
}

fn version_vector_strategy() -> impl Strategy<Value = HashMap<NodeId, u64>> {
    prop::collection::hash_map(node_id_strategy(), 0u64..20, 0..5)
}

proptest! {
    /// Unique leader per term: among any set of candidates, exactly one
    /// maximal element exists under `better_candidate`'s ordering — ties are
    /// always broken by node id, so no two distinct ids can both be "best".
    #[test]
    fn tie_break_has_a_unique_winner(
        candidates in prop::collection::vec((any::<i64>(), node_id_strategy()), 1..10)
    ) {
        let mut deduped: Vec<(i64, NodeId)> = Vec::new();
        for c in candidates {
            if !deduped.iter().any(|(_, id)| *id == c.1) {
                deduped.push(c);
            }
        }
        prop_assume!(!deduped.is_empty());

        let refs: Vec<(i64, &NodeId)> = deduped.iter().map(|(p, id)| (*p, id)).collect();
        let winner = refs
            .iter()
            .copied()
            .max_by(|a, b| better_candidate(*a, *b))
            .unwrap();

        // The winner must be >= every other candidate, and strictly greater
        // than every other candidate with a different id (no ties survive
        // the node-id tiebreak).
        for other in &refs {
            if other.1 != winner.1 {
                let ord = better_candidate(winner, *other);
                prop_assert_ne!(ord, std::cmp::Ordering::Less);
            }
        }
    }

    /// Quorum safety: `has_majority` is monotonic in the vote count — gaining
    /// a vote never turns a majority back into a non-majority.
    #[test]
    fn has_majority_is_monotonic_in_votes(cluster_size in 1usize..20, votes in 0usize..20) {
        let votes = votes.min(cluster_size);
        if has_majority(votes, cluster_size) {
            prop_assert!(has_majority((votes + 1).min(cluster_size), cluster_size));
        }
    }

    /// `cluster_size / 2 + 1` is always exactly the smallest majority: it
    /// satisfies `has_majority`, and one vote fewer never does.
    #[test]
    fn smallest_majority_is_exactly_size_over_two_plus_one(cluster_size in 0usize..50) {
        let majority = cluster_size / 2 + 1;
        prop_assert!(has_majority(majority, cluster_size));
        prop_assert!(!has_majority(majority - 1, cluster_size));
    }

    /// Version-vector merge is commutative and idempotent, which is what
    /// makes eventual convergence order-independent across gossip rounds.
    #[test]
    fn version_vector_merge_is_commutative(
        a in version_vector_strategy(),
        b in version_vector_strategy(),
    ) {
        let ab = merge_version_vectors(&a, &b);
        let ba = merge_version_vectors(&b, &a);
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn version_vector_merge_is_idempotent(a in version_vector_strategy()) {
        let merged = merge_version_vectors(&a, &a);
        prop_assert_eq!(merged, a);
    }

    /// A vector never conflicts with a merge that dominates it.
    #[test]
    fn merged_vector_does_not_conflict_with_either_input(
        a in version_vector_strategy(),
        b in version_vector_strategy(),
    ) {
        let merged = merge_version_vectors(&a, &b);
        prop_assert!(!vectors_conflict(&a, &merged));
        prop_assert!(!vectors_conflict(&b, &merged));
    }

    /// `vectors_conflict` is symmetric.
    #[test]
    fn vectors_conflict_is_symmetric(
        a in version_vector_strategy(),
        b in version_vector_strategy(),
    ) {
        prop_assert_eq!(vectors_conflict(&a, &b), vectors_conflict(&b, &a));
    }

    /// Idempotent apply: re-merging a vector's own value changes nothing,
    /// mirroring `ReplicationManager::store_and_apply_locally`'s
    /// already-applied-vector short-circuit.
    #[test]
    fn merging_a_subset_of_an_already_merged_vector_is_a_noop(
        base in version_vector_strategy(),
        extra in version_vector_strategy(),
    ) {
        let once = merge_version_vectors(&base, &extra);
        let twice = merge_version_vectors(&once, &extra);
        prop_assert_eq!(once, twice);
    }

    /// Gossip digests strictly newer in incarnation always supersede.
    #[test]
    fn higher_incarnation_digest_always_supersedes(
        local_incarnation in 0u64..100,
        local_seq in 0u64..100,
        bump in 1u64..50,
        seq in 0u64..100,
    ) {
        let digest = GossipDigest {
            node_id: NodeId::new("peer"),
            state: NodeState::Active,
            heartbeat_seq: seq,
            incarnation: local_incarnation + bump,
            priority: 0,
            address: "10.0.0.1".into(),
            port: 9000,
        };
        prop_assert!(digest_supersedes(local_incarnation, local_seq, &digest));
    }

    /// Within the same incarnation, only a strictly newer heartbeat_seq wins.
    #[test]
    fn same_incarnation_digest_supersedes_only_with_newer_seq(
        incarnation in 0u64..100,
        local_seq in 0u64..100,
        incoming_seq in 0u64..100,
    ) {
        let digest = GossipDigest {
            node_id: NodeId::new("peer"),
            state: NodeState::Active,
            heartbeat_seq: incoming_seq,
            incarnation,
            priority: 0,
            address: "10.0.0.1".into(),
            port: 9000,
        };
        prop_assert_eq!(
            digest_supersedes(incarnation, local_seq, &digest),
            incoming_seq > local_seq
        );
    }
}

#[test]
fn state_severity_is_monotone_along_the_failure_path() {
    assert!(state_severity(NodeState::Active) < state_severity(NodeState::Degraded));
    assert!(state_severity(NodeState::Degraded) < state_severity(NodeState::Unreachable));
    assert!(state_severity(NodeState::Unreachable) < state_severity(NodeState::Leaving));
}
