//! Scheduler error types.

use std::time::Duration;

use capgrid_state::{ClusterId, DeploymentId, DeploymentState, NegativeResource, OrgId, Resources, StateError};
use thiserror::Error;

/// Errors raised by the [`ResourceLedger`](crate::ResourceLedger).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("unknown cluster: {0}")]
    UnknownCluster(ClusterId),

    #[error("cluster already registered: {0}")]
    DuplicateCluster(ClusterId),

    #[error("insufficient capacity on cluster {cluster}: requested {requested}, available {available}")]
    InsufficientCapacity {
        cluster: ClusterId,
        requested: Resources,
        available: Resources,
    },

    #[error("release of {released} on cluster {cluster} exceeds committed {committed}")]
    ReleaseUnderflow {
        cluster: ClusterId,
        released: Resources,
        committed: Resources,
    },
}

/// Errors raised by the [`DeploymentRegistry`](crate::DeploymentRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown deployment: {0}")]
    UnknownDeployment(DeploymentId),

    #[error("deployment {id} is {actual}, expected {expected}")]
    StaleState {
        id: DeploymentId,
        expected: DeploymentState,
        actual: DeploymentState,
    },
}

/// Errors raised by the [`DependencyGraph`](crate::DependencyGraph).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency {dependency} -> {dependent} would create a cycle")]
    CycleDetected {
        dependency: DeploymentId,
        dependent: DeploymentId,
    },
}

/// Coarse classification of [`SchedulerError`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request is malformed or impossible; rejected before queueing.
    Validation,
    /// A concurrent mutation won the race.
    Conflict,
    /// The cluster lock could not be acquired before the deadline.
    Busy,
    /// A scheduler invariant was broken. Always a bug.
    Integrity,
    /// The persistence adapter failed.
    Storage,
}

/// Errors surfaced by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown cluster: {0}")]
    UnknownCluster(ClusterId),

    #[error("cluster already registered: {0}")]
    DuplicateCluster(ClusterId),

    #[error("unknown deployment: {0}")]
    UnknownDeployment(DeploymentId),

    #[error("invalid resources: {0}")]
    InvalidResources(String),

    #[error("dependency {dependency} -> {dependent} would create a cycle")]
    CycleDetected {
        dependency: DeploymentId,
        dependent: DeploymentId,
    },

    #[error("cannot {operation} deployment {id} in state {state}")]
    InvalidTransition {
        id: DeploymentId,
        state: DeploymentState,
        operation: &'static str,
    },

    #[error("organization {org_id} does not own deployment {id}")]
    NotOwner { id: DeploymentId, org_id: OrgId },

    #[error("conflict on deployment {id}: expected {expected}, found {actual}")]
    Conflict {
        id: DeploymentId,
        expected: DeploymentState,
        actual: DeploymentState,
    },

    #[error("cluster {cluster_id} busy: lock not acquired within {waited:?}")]
    Busy { cluster_id: ClusterId, waited: Duration },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownCluster(_)
            | Self::DuplicateCluster(_)
            | Self::UnknownDeployment(_)
            | Self::InvalidResources(_)
            | Self::CycleDetected { .. }
            | Self::InvalidTransition { .. }
            | Self::NotOwner { .. } => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::State(_) => ErrorKind::Storage,
        }
    }
}

impl From<RegistryError> for SchedulerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownDeployment(id) => Self::UnknownDeployment(id),
            RegistryError::StaleState { id, expected, actual } => Self::Conflict { id, expected, actual },
        }
    }
}

impl From<GraphError> for SchedulerError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::CycleDetected { dependency, dependent } => {
                Self::CycleDetected { dependency, dependent }
            }
        }
    }
}

impl From<LedgerError> for SchedulerError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownCluster(id) => Self::UnknownCluster(id),
            LedgerError::DuplicateCluster(id) => Self::DuplicateCluster(id),
            // The scheduler checks fit before reserving; reaching either
            // of these means the books are wrong.
            other => Self::Integrity(other.to_string()),
        }
    }
}

impl From<NegativeResource> for SchedulerError {
    fn from(err: NegativeResource) -> Self {
        Self::InvalidResources(err.to_string())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
