//! `StartupOrchestrator` (§4.6). Grounded on the teacher's
//! `orchestration/coordinator.rs`: a fixed bring-up sequence with each step
//! error-wrapped so a failure names which component failed, and teardown in
//! the exact reverse order.

use crate::clock::Clock;
use crate::cluster::{ClusterManager, TopologyObserver};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::failover::FailoverManager;
use crate::health::{HealthMonitor, Probe};
use crate::replication::ReplicationManager;
use crate::repository::Repository;
use crate::state::StateManager;
use crate::transport::Transport;
use crate::types::ClusterView;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

struct QuorumProbe {
    cluster: Arc<ClusterManager>,
}

#[async_trait]
impl Probe for QuorumProbe {
    async fn check(&self) -> std::result::Result<(), String> {
        let view = self.cluster.cluster_info();
        if view.leader_node_id.is_some() {
            Ok(())
        } else {
            Err("no leader known".to_string())
        }
    }
}

struct RepositoryProbe {
    repository: Arc<dyn Repository>,
}

#[async_trait]
impl Probe for RepositoryProbe {
    async fn check(&self) -> std::result::Result<(), String> {
        self.repository
            .query(crate::repository::Filter::default())
            .await
            .map(|_| ())
            .map_err(|e| e.message())
    }
}

struct ReplicationLagProbe {
    replication: Arc<ReplicationManager>,
    max_lag_seconds: f64,
}

#[async_trait]
impl Probe for ReplicationLagProbe {
    async fn check(&self) -> std::result::Result<(), String> {
        let status = self.replication.status();
        let worst = status.per_node.values().map(|s| s.lag_seconds).fold(0.0_f64, f64::max);
        if worst > self.max_lag_seconds {
            Err(format!(
                "replication lag {worst:.1}s exceeds max_catchup_window {:.1}s",
                self.max_lag_seconds
            ))
        } else {
            Ok(())
        }
    }
}

struct LockServiceProbe {
    state: Arc<StateManager>,
}

#[async_trait]
impl Probe for LockServiceProbe {
    async fn check(&self) -> std::result::Result<(), String> {
        self.state.lock_service_healthy().await.map_err(|e| e.message())
    }
}

/// Subscribed at startup rather than referenced directly by `ClusterManager`,
/// per the cyclic-reference redesign flag — topology fan-out happens through
/// observers, not back-pointers from cluster to its consumers.
struct LoggingTopologyObserver;

#[async_trait]
impl TopologyObserver for LoggingTopologyObserver {
    async fn on_topology_change(&self, view: ClusterView) {
        info!(
            term = view.term,
            leader = ?view.leader_node_id,
            state = ?view.state,
            members = view.members.len(),
            "topology changed"
        );
    }
}

pub struct StartupOrchestrator {
    config: Config,
    clock: Arc<dyn Clock>,
    health: Arc<HealthMonitor>,
    cluster: Arc<ClusterManager>,
    replication: Arc<ReplicationManager>,
    state: Arc<StateManager>,
    failover: Arc<FailoverManager>,
    ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for StartupOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupOrchestrator")
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .finish()
    }
}

impl StartupOrchestrator {
    /// Wires every component from `config`. `cluster_transport` and
    /// `replication_transport` must be distinct instances (§5: sharing one
    /// mailbox between two message loops would let either loop silently
    /// consume frames meant for the other).
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        cluster_transport: Arc<dyn Transport>,
        replication_transport: Arc<dyn Transport>,
        repository: Option<Arc<dyn Repository>>,
    ) -> Result<Self> {
        config.validate()?;

        let health = Arc::new(HealthMonitor::new(clock.clone()));
        let cluster = Arc::new(ClusterManager::new(
            config.cluster.clone(),
            clock.clone(),
            cluster_transport,
        ));
        let replication = Arc::new(ReplicationManager::new(
            config.replication.clone(),
            cluster.clone(),
            replication_transport,
            clock.clone(),
            &config.cluster.name,
        ));
        let state = Arc::new(StateManager::new(
            clock.clone(),
            cluster.clone(),
            replication.clone(),
            config.state.tombstone_retention,
            config.state.default_lock_wait_timeout,
        ));
        let failover = Arc::new(FailoverManager::new(
            clock.clone(),
            cluster.clone(),
            state.clone(),
            replication.clone(),
        ));

        Ok(Self {
            config,
            clock,
            health,
            cluster,
            replication,
            state,
            failover,
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn cluster(&self) -> Arc<ClusterManager> {
        self.cluster.clone()
    }

    pub fn replication(&self) -> Arc<ReplicationManager> {
        self.replication.clone()
    }

    pub fn state(&self) -> Arc<StateManager> {
        self.state.clone()
    }

    pub fn failover(&self) -> Arc<FailoverManager> {
        self.failover.clone()
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Fixed bring-up order: config already validated in `new`, then health,
    /// then cluster (blocking up to `forming_timeout` for a leader), then
    /// failover/replication/state together once topology is flowing, then
    /// the standard health checks, then `ready = true`.
    pub async fn start(&self, repository: Option<Arc<dyn Repository>>) -> Result<()> {
        info!("starting HA control plane");

        self.health.enable();

        self.cluster
            .on_topology_change(Arc::new(LoggingTopologyObserver))
            .await;
        self.cluster.on_topology_change(self.failover.clone()).await;
        self.cluster.on_topology_change(self.replication.clone()).await;
        self.cluster.on_topology_change(self.state.clone()).await;

        self.cluster
            .join(self.config.cluster.seeds.clone())
            .await
            .map_err(|e| Error::Fatal(format!("cluster bring-up failed: {e}")))?;

        self.replication.start();

        self.failover
            .define_group(
                "default",
                self.cluster.node_id().clone(),
                Vec::new(),
                self.config
                    .failover
                    .groups
                    .get("default")
                    .cloned()
                    .unwrap_or_default(),
            )
            .await?;

        self.register_standard_checks(repository).await?;

        self.ready.store(true, Ordering::SeqCst);
        info!("HA control plane ready");
        Ok(())
    }

    async fn register_standard_checks(&self, repository: Option<Arc<dyn Repository>>) -> Result<()> {
        self.health.register(
            "cluster.quorum",
            "cluster",
            "cluster-quorum",
            Arc::new(QuorumProbe { cluster: self.cluster.clone() }),
            self.config.health.default_interval,
            self.config.health.default_timeout,
            self.config.health.default_failure_threshold,
            self.config.health.default_recovery_threshold,
            true,
        )?;

        if let Some(repository) = repository {
            self.health.register(
                "repository.reachable",
                "repository",
                "repository",
                Arc::new(RepositoryProbe { repository }),
                self.config.health.default_interval,
                self.config.health.default_timeout,
                self.config.health.default_failure_threshold,
                self.config.health.default_recovery_threshold,
                false,
            )?;
        }

        self.health.register(
            "replication.lag",
            "replication",
            "replication-lag",
            Arc::new(ReplicationLagProbe {
                replication: self.replication.clone(),
                max_lag_seconds: self.config.replication.max_catchup_window.as_secs_f64(),
            }),
            self.config.health.default_interval,
            self.config.health.default_timeout,
            self.config.health.default_failure_threshold,
            self.config.health.default_recovery_threshold,
            true,
        )?;

        self.health.register(
            "lock_service.liveness",
            "state",
            "lock-service",
            Arc::new(LockServiceProbe { state: self.state.clone() }),
            self.config.health.default_interval,
            self.config.health.default_timeout,
            self.config.health.default_failure_threshold,
            self.config.health.default_recovery_threshold,
            true,
        )?;

        Ok(())
    }

    /// Reverse-order shutdown. If this node is leader, waits up to
    /// `shutdown_grace` for a new leader to be elected before tearing the
    /// cluster layer down, so in-flight writes have somewhere to land.
    pub async fn stop(&self) -> Result<()> {
        info!("stopping HA control plane");
        self.ready.store(false, Ordering::SeqCst);

        self.health.disable();
        self.failover.stop();
        self.replication.stop();

        if self.cluster.is_leader().await {
            self.cluster.leave().await?;
            let deadline =
                self.clock.monotonic_now() + self.config.cluster.shutdown_grace.as_millis() as u64;
            while self.clock.monotonic_now() < deadline {
                if self.cluster.leader().await.is_some() {
                    break;
                }
                self.clock.sleep(std::time::Duration::from_millis(20)).await;
            }
        } else {
            self.cluster.stop().await?;
        }

        info!("HA control plane stopped");
        Ok(())
    }
}
