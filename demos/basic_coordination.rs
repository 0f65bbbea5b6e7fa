//! Brings up a single-node control plane, exercises the state store, a
//! fencing-token lock, and a failover group, then shuts everything down in
//! order. Run with `cargo run --example basic_cluster`.

use std::sync::Arc;
use std::time::Duration;

use transferha::clock::SystemClock;
use transferha::config::{Config, FailoverPolicy};
use transferha::repository::InMemoryRepository;
use transferha::transport::ChannelRegistry;
use transferha::types::NodeId;
use transferha::{get_phase_status, StartupOrchestrator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut config = Config::default();
    config.cluster.node_id = NodeId::new("node-1");
    config.cluster.size = 1;

    let clock = Arc::new(SystemClock::default());
    let registry = ChannelRegistry::new();
    let cluster_transport = Arc::new(registry.transport_for_channel("cluster", config.cluster.node_id.clone()));
    let replication_transport =
        Arc::new(registry.transport_for_channel("replication", config.cluster.node_id.clone()));
    let repository: Arc<dyn transferha::repository::Repository> =
        Arc::new(InMemoryRepository::new());

    let orchestrator = StartupOrchestrator::new(
        config,
        clock,
        cluster_transport,
        replication_transport,
        Some(repository.clone()),
    )?;

    orchestrator.start(Some(repository)).await?;
    println!("control plane ready: {:?}", orchestrator.is_ready());

    let state = orchestrator.state();
    state.set("transfers/active_count", b"0".to_vec()).await?;
    let current = state
        .get("transfers/active_count")
        .await
        .expect("just written");
    println!(
        "active_count = {} (version {})",
        String::from_utf8_lossy(&current.value),
        current.version
    );

    let swapped = state
        .compare_and_swap("transfers/active_count", current.version, b"1".to_vec())
        .await?;
    println!("compare_and_swap succeeded = {swapped}");

    let lock = state
        .acquire_lock("transfers/job-42", Duration::from_secs(5), None)
        .await?;
    println!(
        "holding lock on {} with fencing token {}",
        lock.resource_key(),
        lock.fencing_token()
    );
    lock.release().await;

    let failover = orchestrator.failover();
    failover
        .reconfigure_group("default", Vec::new(), FailoverPolicy::default())
        .await?;
    if let Some(status) = failover.status("default").await {
        println!(
            "failover group 'default': primary={} state={:?}",
            status.primary_node_id.as_str(),
            status.state
        );
    }

    let phase = get_phase_status(&orchestrator).await;
    println!(
        "cluster term={} leader={:?} health={:?}",
        phase.cluster.term, phase.cluster.leader_node_id, phase.health
    );

    orchestrator.stop().await?;
    println!("control plane stopped");
    Ok(())
}
