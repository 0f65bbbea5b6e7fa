//! `FailoverManager` (§4.3). Grounded on `cluster::manager`'s background-task
//! shape: one `tokio::select!` loop per failover group, watching the
//! group's primary through `ClusterManager`'s roster rather than probing it
//! directly, and promoting through `StateManager`'s fencing CAS so two
//! nodes racing to fail over the same group can't both win.

use crate::clock::Clock;
use crate::cluster::{ClusterManager, TopologyObserver};
use crate::config::FailoverPolicy;
use crate::error::{Error, Result};
use crate::replication::ReplicationManager;
use crate::state::StateManager;
use crate::types::{ClusterView, FailoverState, NodeId, NodeState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Promotion {
    new_primary: NodeId,
    term: u64,
}

struct Group {
    group_id: String,
    primary_node_id: NodeId,
    secondary_node_ids: Vec<NodeId>,
    state: FailoverState,
    last_transition_at: u64,
    policy: FailoverPolicy,
    consecutive_failures: u32,
    attempts: u32,
    recovered_at: Option<u64>,
    /// The primary that was demoted by the most recent failover; tracked
    /// separately so `FailedOver`'s recovery check watches the node that
    /// actually failed, not the newly promoted one.
    demoted_primary: Option<NodeId>,
    /// When the group most recently entered `FailedOver`; gates failback
    /// (manual or automatic) until `policy.recovery_wait_time` has passed.
    failed_over_at: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FailoverGroupSnapshot {
    pub group_id: String,
    pub primary_node_id: NodeId,
    pub secondary_node_ids: Vec<NodeId>,
    pub state: FailoverState,
    pub last_transition_at: u64,
}

#[derive(Clone)]
pub struct FailoverManager {
    clock: Arc<dyn Clock>,
    cluster: Arc<ClusterManager>,
    state_mgr: Arc<StateManager>,
    replication: Arc<ReplicationManager>,
    groups: Arc<tokio::sync::RwLock<HashMap<String, Arc<RwLock<Group>>>>>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverManager").finish()
    }
}

impl FailoverManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        cluster: Arc<ClusterManager>,
        state_mgr: Arc<StateManager>,
        replication: Arc<ReplicationManager>,
    ) -> Self {
        Self {
            clock,
            cluster,
            state_mgr,
            replication,
            groups: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub async fn define_group(
        &self,
        group_id: impl Into<String>,
        primary_node_id: NodeId,
        secondary_node_ids: Vec<NodeId>,
        policy: FailoverPolicy,
    ) -> Result<()> {
        let group_id = group_id.into();
        let group = Arc::new(RwLock::new(Group {
            group_id: group_id.clone(),
            primary_node_id,
            secondary_node_ids,
            state: FailoverState::Normal,
            last_transition_at: self.clock.monotonic_now(),
            policy,
            consecutive_failures: 0,
            attempts: 0,
            recovered_at: None,
            demoted_primary: None,
            failed_over_at: None,
        }));
        self.groups.write().await.insert(group_id.clone(), group.clone());
        self.spawn_watch_loop(group_id, group);
        Ok(())
    }

    pub async fn reconfigure_group(
        &self,
        group_id: &str,
        secondary_node_ids: Vec<NodeId>,
        policy: FailoverPolicy,
    ) -> Result<()> {
        let groups = self.groups.read().await;
        let group = groups
            .get(group_id)
            .ok_or_else(|| Error::Config(format!("no such failover group: {group_id}")))?;
        let mut g = group.write().await;
        g.secondary_node_ids = secondary_node_ids;
        g.policy = policy;
        Ok(())
    }

    pub async fn status(&self, group_id: &str) -> Option<FailoverGroupSnapshot> {
        let groups = self.groups.read().await;
        let group = groups.get(group_id)?;
        let g = group.read().await;
        Some(FailoverGroupSnapshot {
            group_id: g.group_id.clone(),
            primary_node_id: g.primary_node_id.clone(),
            secondary_node_ids: g.secondary_node_ids.clone(),
            state: g.state,
            last_transition_at: g.last_transition_at,
        })
    }

    pub async fn all_statuses(&self) -> Vec<FailoverGroupSnapshot> {
        let groups = self.groups.read().await;
        let mut out = Vec::with_capacity(groups.len());
        for group in groups.values() {
            let g = group.read().await;
            out.push(FailoverGroupSnapshot {
                group_id: g.group_id.clone(),
                primary_node_id: g.primary_node_id.clone(),
                secondary_node_ids: g.secondary_node_ids.clone(),
                state: g.state,
                last_transition_at: g.last_transition_at,
            });
        }
        out
    }

    /// Forces a failover regardless of `policy.auto_failover_enabled`.
    pub async fn manual_failover(&self, group_id: &str, target: Option<NodeId>) -> Result<()> {
        let groups = self.groups.read().await;
        let group = groups
            .get(group_id)
            .ok_or_else(|| Error::Config(format!("no such failover group: {group_id}")))?
            .clone();
        drop(groups);
        self.run_failover(group_id, &group, target).await
    }

    /// Moves a group from FAILED_OVER back to NORMAL once the original
    /// primary has been healthy for `policy.failback_stable_window`.
    pub async fn failback(&self, group_id: &str) -> Result<()> {
        let groups = self.groups.read().await;
        let group = groups
            .get(group_id)
            .ok_or_else(|| Error::Config(format!("no such failover group: {group_id}")))?
            .clone();
        drop(groups);
        let mut g = group.write().await;
        if !matches!(g.state, FailoverState::FailedOver | FailoverState::Recovering) {
            return Err(Error::Config(format!(
                "group {group_id} is not in a failback-eligible state"
            )));
        }
        let elapsed = g
            .failed_over_at
            .map(|at| self.clock.monotonic_now().saturating_sub(at))
            .unwrap_or(0);
        let required = g.policy.recovery_wait_time.as_millis() as u64;
        if elapsed < required {
            return Err(Error::Config(format!(
                "group {group_id}: recovery_wait_time not yet elapsed ({elapsed}ms of {required}ms)"
            )));
        }
        if let Some(original) = g.demoted_primary.take() {
            g.primary_node_id = original;
        }
        g.state = FailoverState::Normal;
        g.last_transition_at = self.clock.monotonic_now();
        g.consecutive_failures = 0;
        g.attempts = 0;
        g.recovered_at = None;
        g.failed_over_at = None;
        info!(group_id, "failback complete");
        Ok(())
    }

    fn spawn_watch_loop(&self, group_id: String, group: Arc<RwLock<Group>>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = group.read().await.policy.health_check_interval;
                tokio::select! {
                    _ = this.clock.sleep(interval) => {}
                    _ = this.shutdown.notified() => break,
                }
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.check_group(&group_id, &group).await;
            }
        });
    }

    fn primary_healthy(&self, primary: &NodeId) -> bool {
        self.cluster
            .cluster_info()
            .members
            .iter()
            .find(|n| n.node_id == *primary)
            .map(|n| matches!(n.state, NodeState::Active | NodeState::Leader))
            .unwrap_or(false)
    }

    async fn check_group(&self, group_id: &str, group: &Arc<RwLock<Group>>) {
        let (state, policy, primary, auto_enabled) = {
            let g = group.read().await;
            (g.state, g.policy.clone(), g.primary_node_id.clone(), g.policy.auto_failover_enabled)
        };

        match state {
            FailoverState::Normal | FailoverState::Detecting => {
                if self.primary_healthy(&primary) {
                    let mut g = group.write().await;
                    if g.consecutive_failures > 0 {
                        g.consecutive_failures = 0;
                        if matches!(g.state, FailoverState::Detecting) {
                            g.state = FailoverState::Normal;
                            g.last_transition_at = self.clock.monotonic_now();
                        }
                    }
                    return;
                }
                let crossed_threshold = {
                    let mut g = group.write().await;
                    g.consecutive_failures += 1;
                    if g.consecutive_failures == 1 {
                        g.state = FailoverState::Detecting;
                        g.last_transition_at = self.clock.monotonic_now();
                    }
                    g.consecutive_failures >= policy.failure_threshold
                };
                if crossed_threshold && auto_enabled {
                    if let Err(e) = self.run_failover(group_id, group, None).await {
                        warn!(group_id, error = %e, "automatic failover attempt failed");
                    }
                }
            }
            FailoverState::FailedOver => {
                let demoted = {
                    let g = group.read().await;
                    g.demoted_primary.clone()
                };
                let recovered = demoted.map(|n| self.primary_healthy(&n)).unwrap_or(false);
                if recovered {
                    let mut g = group.write().await;
                    if g.recovered_at.is_none() {
                        g.recovered_at = Some(self.clock.monotonic_now());
                        g.state = FailoverState::Recovering;
                        g.last_transition_at = self.clock.monotonic_now();
                    }
                }
            }
            FailoverState::Recovering => {
                let ready = {
                    let g = group.read().await;
                    let stable = g
                        .recovered_at
                        .map(|at| {
                            self.clock.monotonic_now().saturating_sub(at)
                                >= policy.failback_stable_window.as_millis() as u64
                        })
                        .unwrap_or(false);
                    let recovery_wait_elapsed = g
                        .failed_over_at
                        .map(|at| {
                            self.clock.monotonic_now().saturating_sub(at)
                                >= policy.recovery_wait_time.as_millis() as u64
                        })
                        .unwrap_or(true);
                    stable && recovery_wait_elapsed
                };
                if ready {
                    let mut g = group.write().await;
                    g.state = FailoverState::Normal;
                    g.last_transition_at = self.clock.monotonic_now();
                    g.consecutive_failures = 0;
                    g.attempts = 0;
                    g.recovered_at = None;
                    g.failed_over_at = None;
                    info!(group_id, "recovered primary stable, back to normal");
                }
            }
            FailoverState::FailingOver | FailoverState::Failed => {}
        }
    }

    async fn run_failover(
        &self,
        group_id: &str,
        group: &Arc<RwLock<Group>>,
        target: Option<NodeId>,
    ) -> Result<()> {
        {
            let mut g = group.write().await;
            g.state = FailoverState::FailingOver;
            g.last_transition_at = self.clock.monotonic_now();
            g.attempts += 1;
        }

        let (secondaries, max_attempts) = {
            let g = group.read().await;
            (g.secondary_node_ids.clone(), g.policy.max_attempts)
        };

        let chosen = match target {
            Some(t) => Some(t),
            None => self.pick_best_secondary(&secondaries),
        };

        let Some(new_primary) = chosen else {
            let mut g = group.write().await;
            g.state = FailoverState::Failed;
            g.last_transition_at = self.clock.monotonic_now();
            return Err(Error::NoQuorum(format!(
                "failover group {group_id}: no eligible secondary"
            )));
        };

        let term = self.cluster.current_term();
        let key = format!("failover/{group_id}");
        let expected_version = self.state_mgr.get(&key).await.map(|s| s.version).unwrap_or(0);
        let payload = bincode::serialize(&Promotion { new_primary: new_primary.clone(), term })
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let won = self
            .state_mgr
            .compare_and_swap(key.clone(), expected_version, payload)
            .await?;

        let mut g = group.write().await;
        if won {
            g.demoted_primary = Some(g.primary_node_id.clone());
            g.primary_node_id = new_primary;
            g.state = FailoverState::FailedOver;
            g.consecutive_failures = 0;
            g.last_transition_at = self.clock.monotonic_now();
            g.failed_over_at = Some(g.last_transition_at);
            info!(group_id, "failover complete");
            Ok(())
        } else if let Some(winner) = self.state_mgr.get(&key).await {
            if let Ok(promotion) = bincode::deserialize::<Promotion>(&winner.value) {
                if g.demoted_primary.is_none() {
                    g.demoted_primary = Some(g.primary_node_id.clone());
                }
                g.primary_node_id = promotion.new_primary;
            }
            g.state = FailoverState::FailedOver;
            g.last_transition_at = self.clock.monotonic_now();
            g.failed_over_at = Some(g.last_transition_at);
            Ok(())
        } else if g.attempts >= max_attempts {
            g.state = FailoverState::Failed;
            g.last_transition_at = self.clock.monotonic_now();
            Err(Error::NoQuorum(format!(
                "failover group {group_id}: exhausted {max_attempts} attempts"
            )))
        } else {
            g.state = FailoverState::Detecting;
            Err(Error::NoQuorum(format!(
                "failover group {group_id}: promotion race lost, retrying"
            )))
        }
    }

    /// Picks the first HEALTHY secondary with the lowest replication lag;
    /// unreachable secondaries are never eligible regardless of lag.
    fn pick_best_secondary(&self, secondaries: &[NodeId]) -> Option<NodeId> {
        if secondaries.is_empty() {
            return None;
        }
        let status = self.replication.status();
        secondaries
            .iter()
            .filter(|id| self.primary_healthy(id))
            .min_by(|a, b| {
                let la = status.per_node.get(*a).map(|s| s.lag_seconds).unwrap_or(f64::MAX);
                let lb = status.per_node.get(*b).map(|s| s.lag_seconds).unwrap_or(f64::MAX);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }
}

#[async_trait]
impl TopologyObserver for FailoverManager {
    /// Re-runs every group's check immediately on a membership change rather
    /// than waiting for the next polling tick, so a primary going
    /// unreachable is noticed as soon as gossip confirms it.
    async fn on_topology_change(&self, _view: ClusterView) {
        let groups: Vec<(String, Arc<RwLock<Group>>)> = self
            .groups
            .read()
            .await
            .iter()
            .map(|(id, g)| (id.clone(), g.clone()))
            .collect();
        for (group_id, group) in groups {
            self.check_group(&group_id, &group).await;
        }
    }
}
