//! Exercises `StateManager`'s CAS and transaction semantics on a single-node
//! cluster, where `join()`'s `size == 1` short-circuit makes the local node
//! leader immediately so every quorum-gated call succeeds deterministically.

use std::sync::Arc;

use transferha::clock::SystemClock;
use transferha::cluster::ClusterManager;
use transferha::config::{ClusterConfig, ReplicationConfig};
use transferha::replication::ReplicationManager;
use transferha::state::{StateManager, StateOp};
use transferha::transport::ChannelRegistry;
use transferha::types::NodeId;

async fn single_node_state() -> Arc<StateManager> {
    let node_id = NodeId::new("n1");
    let mut cluster_config = ClusterConfig::default();
    cluster_config.node_id = node_id.clone();
    cluster_config.size = 1;

    let clock = Arc::new(SystemClock::default());
    let registry = ChannelRegistry::new();
    let cluster_transport = Arc::new(registry.transport_for_channel("cluster", node_id.clone()));
    let replication_transport = Arc::new(registry.transport_for_channel("replication", node_id.clone()));

    let cluster = Arc::new(ClusterManager::new(cluster_config.clone(), clock.clone(), cluster_transport));
    cluster.join(Vec::new()).await.expect("single-node join always succeeds");

    let replication = Arc::new(ReplicationManager::new(
        ReplicationConfig::default(),
        cluster.clone(),
        replication_transport,
        clock.clone(),
        &cluster_config.name,
    ));
    replication.start();

    Arc::new(StateManager::new(
        clock,
        cluster,
        replication,
        std::time::Duration::from_secs(3600),
        std::time::Duration::from_secs(5),
    ))
}

#[tokio::test]
async fn set_then_get_round_trips() {
    let state = single_node_state().await;
    let version = state.set("transfers/active_count", b"0".to_vec()).await.unwrap();
    assert_eq!(version, 1);

    let snapshot = state.get("transfers/active_count").await.expect("just written");
    assert_eq!(snapshot.value, b"0".to_vec());
    assert_eq!(snapshot.version, 1);
    assert!(!snapshot.stale, "leader reads are not stale");
}

#[tokio::test]
async fn get_on_missing_key_returns_none() {
    let state = single_node_state().await;
    assert!(state.get("does/not/exist").await.is_none());
}

#[tokio::test]
async fn compare_and_swap_succeeds_on_matching_version() {
    let state = single_node_state().await;
    let version = state.set("transfers/active_count", b"0".to_vec()).await.unwrap();

    let swapped = state
        .compare_and_swap("transfers/active_count", version, b"1".to_vec())
        .await
        .unwrap();
    assert!(swapped);

    let snapshot = state.get("transfers/active_count").await.unwrap();
    assert_eq!(snapshot.value, b"1".to_vec());
    assert_eq!(snapshot.version, version + 1);
}

#[tokio::test]
async fn compare_and_swap_fails_on_stale_version() {
    let state = single_node_state().await;
    let version = state.set("transfers/active_count", b"0".to_vec()).await.unwrap();
    state
        .compare_and_swap("transfers/active_count", version, b"1".to_vec())
        .await
        .unwrap();

    // Retrying with the now-stale `version` must not apply.
    let swapped = state
        .compare_and_swap("transfers/active_count", version, b"2".to_vec())
        .await
        .unwrap();
    assert!(!swapped);

    let snapshot = state.get("transfers/active_count").await.unwrap();
    assert_eq!(snapshot.value, b"1".to_vec(), "failed CAS must not mutate state");
}

#[tokio::test]
async fn compare_and_swap_on_unknown_key_requires_version_zero() {
    let state = single_node_state().await;
    let swapped = state
        .compare_and_swap("brand/new/key", 0, b"hello".to_vec())
        .await
        .unwrap();
    assert!(swapped);
    assert_eq!(state.get("brand/new/key").await.unwrap().version, 1);
}

#[tokio::test]
async fn delete_tombstones_the_key() {
    let state = single_node_state().await;
    state.set("transfers/job-1", b"queued".to_vec()).await.unwrap();
    state.delete("transfers/job-1").await.unwrap();
    assert!(state.get("transfers/job-1").await.is_none());
}

#[tokio::test]
async fn get_linearizable_matches_get_on_the_leader() {
    let state = single_node_state().await;
    state.set("transfers/job-2", b"running".to_vec()).await.unwrap();
    let linearizable = state.get_linearizable("transfers/job-2").await.unwrap();
    assert_eq!(linearizable.unwrap().value, b"running".to_vec());
}

#[tokio::test]
async fn transaction_applies_all_ops_atomically() {
    let state = single_node_state().await;
    let v1 = state.set("a", b"1".to_vec()).await.unwrap();

    state
        .transaction(vec![
            StateOp::CompareAndSwap { key: "a".into(), expected_version: v1, new_value: b"2".to_vec() },
            StateOp::Set { key: "b".into(), value: b"new".to_vec() },
            StateOp::Delete { key: "a".into() },
        ])
        .await
        .unwrap();

    assert!(state.get("a").await.is_none(), "a was deleted in the same batch");
    assert_eq!(state.get("b").await.unwrap().value, b"new".to_vec());
}

#[tokio::test]
async fn transaction_rejects_whole_batch_on_stale_cas_precondition() {
    let state = single_node_state().await;
    let v1 = state.set("a", b"1".to_vec()).await.unwrap();
    // Make the real version diverge from what the transaction will assume.
    state.set("a", b"2".to_vec()).await.unwrap();

    let err = state
        .transaction(vec![
            StateOp::Set { key: "b".into(), value: b"should-not-apply".to_vec() },
            StateOp::CompareAndSwap { key: "a".into(), expected_version: v1, new_value: b"3".to_vec() },
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, transferha::Error::CasFailed { .. }));
    assert!(state.get("b").await.is_none(), "preconditions are checked before any op runs");
}
