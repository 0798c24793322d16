//! What a scheduling decision did, for callers to log and explain.

use capgrid_state::{ClusterId, DeploymentId, DeploymentRecord, DeploymentState, Resources};
use serde::Serialize;

/// Why a deployment changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cause {
    Admitted,
    Preempted { by: DeploymentId },
    Requeued,
    Completed,
    Failed,
    Cancelled,
    DependencyFailed { dependency: DeploymentId },
}

/// One state change performed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub deployment_id: DeploymentId,
    pub cluster_id: ClusterId,
    pub from: DeploymentState,
    pub to: DeploymentState,
    pub cause: Cause,
}

impl Transition {
    pub fn new(record: &DeploymentRecord, from: DeploymentState, cause: Cause) -> Self {
        Self {
            deployment_id: record.id,
            cluster_id: record.cluster_id,
            from,
            to: record.state,
            cause,
        }
    }
}

/// Result of `submit_deployment`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub deployment_id: DeploymentId,
    /// `Running` or `Pending` unless a dependency already failed.
    pub state: DeploymentState,
    pub transitions: Vec<Transition>,
}

impl SubmitOutcome {
    /// Deployments evicted to make room for this submission.
    pub fn preempted(&self) -> Vec<DeploymentId> {
        self.transitions
            .iter()
            .filter(|t| matches!(t.cause, Cause::Preempted { by } if by == self.deployment_id))
            .map(|t| t.deployment_id)
            .collect()
    }
}

/// Result of cancel/complete/fail/add-dependency.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleReport {
    pub transitions: Vec<Transition>,
}

/// Read-only snapshot of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStatus {
    pub cluster_id: ClusterId,
    pub name: String,
    pub total: Resources,
    pub committed: Resources,
    pub available: Resources,
    pub running: Vec<DeploymentRecord>,
    /// In queue order.
    pub pending: Vec<DeploymentRecord>,
}
