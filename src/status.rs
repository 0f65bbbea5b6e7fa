//! Status surface (§6): a single serializable snapshot assembled from every
//! component, realized as an in-process query rather than an HTTP endpoint —
//! the teacher's `api/rest_api.rs` exposed this kind of aggregate over HTTP;
//! wiring a listener is an external concern this crate doesn't own.

use crate::failover::FailoverGroupSnapshot;
use crate::health::OverallHealth;
use crate::orchestrator::StartupOrchestrator;
use crate::replication::ReplicationStatusSnapshot;
use crate::types::ClusterView;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PhaseStatus {
    pub ready: bool,
    pub cluster: ClusterView,
    pub health: OverallHealth,
    pub replication: ReplicationStatusSnapshot,
    pub failover_groups: Vec<FailoverGroupSnapshotView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverGroupSnapshotView {
    pub group_id: String,
    pub primary_node_id: String,
    pub secondary_node_ids: Vec<String>,
    pub state: crate::types::FailoverState,
}

impl From<FailoverGroupSnapshot> for FailoverGroupSnapshotView {
    fn from(s: FailoverGroupSnapshot) -> Self {
        Self {
            group_id: s.group_id,
            primary_node_id: s.primary_node_id.as_str().to_string(),
            secondary_node_ids: s
                .secondary_node_ids
                .iter()
                .map(|n| n.as_str().to_string())
                .collect(),
            state: s.state,
        }
    }
}

/// Assembles a point-in-time view across every component. Cheap: every
/// underlying call is a non-suspending or already-cached snapshot read.
pub async fn get_phase_status(orchestrator: &StartupOrchestrator) -> PhaseStatus {
    let cluster = orchestrator.cluster();
    let failover = orchestrator.failover();

    PhaseStatus {
        ready: orchestrator.is_ready(),
        cluster: cluster.cluster_info(),
        health: orchestrator.health().overall_health(),
        replication: orchestrator.replication().status(),
        failover_groups: failover
            .all_statuses()
            .await
            .into_iter()
            .map(FailoverGroupSnapshotView::from)
            .collect(),
    }
}
