//! Brings up a real 3-node cluster over the in-memory `ChannelTransport` and
//! checks that membership and leader election actually converge through the
//! `Join`/`JoinAck`/gossip/vote background loops — not just the `size == 1`
//! short-circuit the single-node tests rely on.
//!
//! Uses `SystemClock` with small real durations rather than `TestClock`:
//! these loops run inside `tokio::select!` against `clock.sleep`, and
//! `TestClock::sleep` returns without ever yielding to the scheduler, which
//! would busy-spin a single task forever instead of giving the other nodes'
//! loops a turn.

use std::sync::Arc;
use std::time::Duration;

use transferha::clock::SystemClock;
use transferha::cluster::gossip::{GossipDigest, GossipPayload};
use transferha::cluster::{cluster_id_for, ClusterManager};
use transferha::config::ClusterConfig;
use transferha::transport::{ChannelRegistry, Frame, MessageType, Transport};
use transferha::types::{ClusterState, NodeId, NodeState};

fn fast_cluster_config(node_id: &str, seeds: Vec<String>) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.node_id = NodeId::new(node_id);
    config.size = 3;
    config.seeds = seeds;
    config.gossip_interval = Duration::from_millis(15);
    config.heartbeat_interval = Duration::from_millis(15);
    config.heartbeat_miss_threshold = 3;
    config.election_timeout_min = Duration::from_millis(30);
    config.election_timeout_max = Duration::from_millis(60);
    config.priority_wait = Duration::from_millis(10);
    config.suspect_timeout = Duration::from_secs(3);
    config.dead_timeout = Duration::from_secs(6);
    config.evict_timeout = Duration::from_secs(30);
    config.forming_timeout = Duration::from_millis(800);
    config
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, poll: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

#[tokio::test]
async fn three_nodes_converge_on_a_single_leader() {
    let registry = ChannelRegistry::new();
    let clock = Arc::new(SystemClock::default());
    let ids = ["n1", "n2", "n3"];
    let seeds: Vec<String> = ids.iter().map(|s| s.to_string()).collect();

    let mut clusters = Vec::new();
    for id in ids {
        let config = fast_cluster_config(id, seeds.clone());
        let transport = Arc::new(registry.transport_for(NodeId::new(id)));
        let cluster = Arc::new(ClusterManager::new(config, clock.clone(), transport));
        clusters.push(cluster);
    }

    for cluster in &clusters {
        let c = cluster.clone();
        tokio::spawn(async move {
            let _ = c.join(vec!["n1".into(), "n2".into(), "n3".into()]).await;
        });
    }

    let converged = wait_until(Duration::from_secs(5), Duration::from_millis(20), || {
        let leaders: std::collections::HashSet<_> = clusters
            .iter()
            .filter_map(|c| c.cluster_info().leader_node_id)
            .collect();
        leaders.len() == 1 && clusters.iter().all(|c| c.cluster_info().leader_node_id.is_some())
    })
    .await;

    assert!(converged, "all three nodes should agree on a single leader");

    let leader_ids: Vec<_> = clusters
        .iter()
        .map(|c| c.cluster_info().leader_node_id.clone())
        .collect();
    assert_eq!(leader_ids[0], leader_ids[1]);
    assert_eq!(leader_ids[1], leader_ids[2]);

    let membership_complete = wait_until(Duration::from_secs(2), Duration::from_millis(20), || {
        clusters.iter().all(|c| c.cluster_info().members.len() == 3)
    })
    .await;
    assert!(membership_complete, "every node should learn the full roster via Join/JoinAck and gossip");

    for cluster in &clusters {
        cluster.stop().await.unwrap();
    }
}

#[tokio::test]
async fn single_node_cluster_becomes_leader_immediately() {
    let registry = ChannelRegistry::new();
    let clock = Arc::new(SystemClock::default());
    let mut config = ClusterConfig::default();
    config.node_id = NodeId::new("solo");
    config.size = 1;
    let transport = Arc::new(registry.transport_for(NodeId::new("solo")));
    let cluster = Arc::new(ClusterManager::new(config, clock, transport));

    cluster.join(Vec::new()).await.unwrap();
    assert!(cluster.is_leader().await);
    assert_eq!(cluster.cluster_info().leader_node_id, Some(NodeId::new("solo")));
    cluster.stop().await.unwrap();
}

#[tokio::test]
async fn split_brain_with_overlapping_terms_rolls_back_the_smaller_term_partition() {
    let registry = ChannelRegistry::new();
    let clock = Arc::new(SystemClock::default());
    let mut config = ClusterConfig::default();
    config.node_id = NodeId::new("n1");
    config.size = 1;
    config.gossip_interval = Duration::from_secs(60);
    let transport = Arc::new(registry.transport_for(NodeId::new("n1")));
    let cluster = Arc::new(ClusterManager::new(config.clone(), clock, transport));

    cluster.join(Vec::new()).await.unwrap();
    assert!(cluster.is_leader().await);

    // A rival partition gossips in claiming leadership at a higher term whose
    // history overlaps ours ([1,1] vs [1,2]), so neither side cleanly
    // supersedes the other on heal.
    let digest = GossipDigest {
        node_id: NodeId::new("n2"),
        state: NodeState::Active,
        heartbeat_seq: 1,
        incarnation: 0,
        priority: 0,
        address: "10.0.0.5".into(),
        port: 9100,
    };
    let payload = GossipPayload {
        digests: vec![digest],
        leader_node_id: Some(NodeId::new("n2")),
        leader_term: 2,
        term_history: vec![(1, 100), (2, 200)],
    };
    let frame = Frame::new(
        cluster_id_for(&config.name),
        NodeId::new("n2"),
        2,
        MessageType::Gossip,
        bincode::serialize(&payload).unwrap(),
    );
    let injector = registry.transport_for(NodeId::new("n2"));
    injector.send(&NodeId::new("n1"), frame).await.unwrap();

    let rolled_back = wait_until(Duration::from_secs(2), Duration::from_millis(20), || {
        cluster.cluster_info().leader_node_id.is_none() && cluster.cluster_info().state == ClusterState::Degraded
    })
    .await;
    assert!(rolled_back, "the smaller-max-term partition should detect the split brain and roll back");

    cluster.stop().await.unwrap();
}
