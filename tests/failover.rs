//! Exercises the failover group state machine end to end: automatic
//! Normal -> Detecting -> FailingOver -> FailedOver promotion when the
//! configured primary is never actually a cluster member (so
//! `primary_healthy` is false from the first health check), recovery
//! detection once the original primary reappears healthy, and manual
//! failback.

use std::sync::Arc;
use std::time::Duration;

use transferha::clock::SystemClock;
use transferha::cluster::{cluster_id_for, ClusterManager};
use transferha::config::{ClusterConfig, FailoverPolicy, ReplicationConfig};
use transferha::failover::FailoverManager;
use transferha::replication::ReplicationManager;
use transferha::state::StateManager;
use transferha::transport::{ChannelRegistry, Frame, MessageType, Transport};
use transferha::types::{FailoverState, Node, NodeId, NodeState};

struct Harness {
    failover: Arc<FailoverManager>,
    cluster: Arc<ClusterManager>,
    registry: ChannelRegistry,
    cluster_id: [u8; 16],
    node_id: NodeId,
}

async fn harness(policy: FailoverPolicy) -> Harness {
    let node_id = NodeId::new("n1");
    let mut cluster_config = ClusterConfig::default();
    cluster_config.node_id = node_id.clone();
    cluster_config.size = 1;

    let clock = Arc::new(SystemClock::default());
    let registry = ChannelRegistry::new();
    let cluster_transport = Arc::new(registry.transport_for_channel("cluster", node_id.clone()));
    let replication_transport = Arc::new(registry.transport_for_channel("replication", node_id.clone()));

    let cluster = Arc::new(ClusterManager::new(cluster_config.clone(), clock.clone(), cluster_transport));
    cluster.join(Vec::new()).await.unwrap();

    // The only configured secondary needs to be a tracked, healthy cluster
    // member for `pick_best_secondary` to consider it eligible.
    let mut ghost_secondary = Node::new(NodeId::new("ghost-secondary"), "10.0.0.8".into(), 9100, 0);
    ghost_secondary.state = NodeState::Active;
    let join_frame = Frame::new(
        cluster_id_for(&cluster_config.name),
        NodeId::new("ghost-secondary"),
        0,
        MessageType::Join,
        bincode::serialize(&ghost_secondary).unwrap(),
    );
    let injector = registry.transport_for_channel("cluster", node_id.clone());
    injector.send(&node_id, join_frame).await.unwrap();

    let replication = Arc::new(ReplicationManager::new(
        ReplicationConfig::default(),
        cluster.clone(),
        replication_transport,
        clock.clone(),
        &cluster_config.name,
    ));
    replication.start();

    let state = Arc::new(StateManager::new(
        clock.clone(),
        cluster.clone(),
        replication.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(5),
    ));

    let failover = Arc::new(FailoverManager::new(clock, cluster.clone(), state, replication));
    failover
        .define_group(
            "primary-group",
            NodeId::new("ghost-primary"),
            vec![NodeId::new("ghost-secondary")],
            policy,
        )
        .await
        .unwrap();

    Harness {
        failover,
        cluster,
        registry,
        cluster_id: cluster_id_for(&cluster_config.name),
        node_id,
    }
}

fn fast_policy() -> FailoverPolicy {
    FailoverPolicy {
        auto_failover_enabled: true,
        failure_threshold: 2,
        health_check_interval: Duration::from_millis(20),
        recovery_wait_time: Duration::from_secs(5),
        max_attempts: 3,
        failback_stable_window: Duration::from_millis(60),
    }
}

async fn wait_for_state(failover: &FailoverManager, group_id: &str, target: FailoverState, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(status) = failover.status(group_id).await {
            if status.state == target {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn unhealthy_primary_triggers_automatic_failover_to_a_secondary() {
    let h = harness(fast_policy()).await;

    let promoted = wait_for_state(&h.failover, "primary-group", FailoverState::FailedOver, Duration::from_secs(3)).await;
    assert!(promoted, "group should auto-promote once the never-present primary crosses failure_threshold");

    let status = h.failover.status("primary-group").await.unwrap();
    assert_eq!(status.primary_node_id, NodeId::new("ghost-secondary"));
}

fn fast_policy_with_short_recovery_wait() -> FailoverPolicy {
    FailoverPolicy {
        recovery_wait_time: Duration::from_millis(50),
        ..fast_policy()
    }
}

#[tokio::test]
async fn manual_failback_is_rejected_before_recovery_wait_time_elapses() {
    let h = harness(fast_policy()).await;
    assert!(wait_for_state(&h.failover, "primary-group", FailoverState::FailedOver, Duration::from_secs(3)).await);

    let err = h.failover.failback("primary-group").await.unwrap_err();
    assert!(matches!(err, transferha::Error::Config(_)));
}

#[tokio::test]
async fn manual_failback_restores_the_original_primary_after_recovery_wait_time() {
    let h = harness(fast_policy_with_short_recovery_wait()).await;
    assert!(wait_for_state(&h.failover, "primary-group", FailoverState::FailedOver, Duration::from_secs(3)).await);

    tokio::time::sleep(Duration::from_millis(80)).await;
    h.failover.failback("primary-group").await.unwrap();
    let status = h.failover.status("primary-group").await.unwrap();
    assert_eq!(status.state, FailoverState::Normal);
    assert_eq!(status.primary_node_id, NodeId::new("ghost-primary"));
}

#[tokio::test]
async fn failback_on_a_group_not_in_failover_is_rejected() {
    let h = harness(fast_policy()).await;
    let err = h.failover.failback("primary-group").await.unwrap_err();
    assert!(matches!(err, transferha::Error::Config(_)));
}

#[tokio::test]
async fn recovered_primary_transitions_through_recovering_back_to_normal() {
    let h = harness(fast_policy_with_short_recovery_wait()).await;
    assert!(wait_for_state(&h.failover, "primary-group", FailoverState::FailedOver, Duration::from_secs(3)).await);

    // Make the originally-failed primary reappear healthy by injecting a
    // Join frame that adds it to the roster as Active.
    let mut ghost = Node::new(NodeId::new("ghost-primary"), "10.0.0.9".into(), 9100, 0);
    ghost.state = NodeState::Active;
    let frame = Frame::new(
        h.cluster_id,
        NodeId::new("ghost-primary"),
        h.cluster.current_term(),
        MessageType::Join,
        bincode::serialize(&ghost).unwrap(),
    );
    let injector = h.registry.transport_for_channel("cluster", h.node_id.clone());
    injector.send(&h.node_id, frame).await.unwrap();

    assert!(wait_for_state(&h.failover, "primary-group", FailoverState::Recovering, Duration::from_secs(2)).await);
    assert!(wait_for_state(&h.failover, "primary-group", FailoverState::Normal, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn manual_failover_with_no_eligible_secondary_fails_the_group() {
    let h = harness(FailoverPolicy { auto_failover_enabled: false, ..fast_policy() }).await;
    // Reconfigure to strip out the only secondary.
    h.failover
        .reconfigure_group("primary-group", Vec::new(), FailoverPolicy { auto_failover_enabled: false, ..fast_policy() })
        .await
        .unwrap();

    let err = h.failover.manual_failover("primary-group", None).await.unwrap_err();
    assert!(matches!(err, transferha::Error::NoQuorum(_)));

    let status = h.failover.status("primary-group").await.unwrap();
    assert_eq!(status.state, FailoverState::Failed);
}
