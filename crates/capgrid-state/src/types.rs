//! Domain types for the capgrid state store.
//!
//! These types represent clusters, deployments and dependency edges as
//! they are persisted and exchanged with the scheduler. All types are
//! serializable to/from JSON for storage in redb tables.

use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::error::NegativeResource;

/// Unique identifier for a cluster.
pub type ClusterId = u64;

/// Unique identifier for a deployment.
pub type DeploymentId = u64;

/// Unique identifier for an owning organization.
pub type OrgId = u64;

/// Shares are expressed in parts per million of a capacity.
const PPM: u128 = 1_000_000;

// ── Resources ─────────────────────────────────────────────────────

/// A fixed CPU/RAM/GPU amount.
///
/// Used both for capacities and for requests. CPU is in millicores,
/// RAM in MiB and GPU in whole devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: u64,
    pub ram: u64,
    pub gpu: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources { cpu: 0, ram: 0, gpu: 0 };

    pub const fn new(cpu: u64, ram: u64, gpu: u64) -> Self {
        Self { cpu, ram, gpu }
    }

    /// Build from signed amounts, rejecting any negative dimension.
    pub fn from_signed(cpu: i64, ram: i64, gpu: i64) -> Result<Self, NegativeResource> {
        let dim = |dimension: &'static str, value: i64| {
            u64::try_from(value).map_err(|_| NegativeResource { dimension, value })
        };
        Ok(Self {
            cpu: dim("cpu", cpu)?,
            ram: dim("ram", ram)?,
            gpu: dim("gpu", gpu)?,
        })
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// True if every dimension of `self` is within `limit`.
    pub fn fits_within(&self, limit: &Resources) -> bool {
        self.cpu <= limit.cpu && self.ram <= limit.ram && self.gpu <= limit.gpu
    }

    pub fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_add(other.cpu)?,
            ram: self.ram.checked_add(other.ram)?,
            gpu: self.gpu.checked_add(other.gpu)?,
        })
    }

    /// Per-dimension subtraction; `None` if any dimension would go negative.
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_sub(other.cpu)?,
            ram: self.ram.checked_sub(other.ram)?,
            gpu: self.gpu.checked_sub(other.gpu)?,
        })
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            ram: self.ram.saturating_sub(other.ram),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    /// Dominant share of `self` relative to `capacity`, in parts per million.
    ///
    /// Dimensions with zero capacity are ignored.
    pub fn footprint(&self, capacity: &Resources) -> u64 {
        let share = |amount: u64, total: u64| -> u64 {
            if total == 0 {
                return 0;
            }
            (u128::from(amount) * PPM / u128::from(total)).min(u128::from(u64::MAX)) as u64
        };
        share(self.cpu, capacity.cpu)
            .max(share(self.ram, capacity.ram))
            .max(share(self.gpu, capacity.gpu))
    }
}

impl Add for Resources {
    type Output = Resources;

    /// Saturating; ledger paths use [`Resources::checked_add`].
    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(rhs.cpu),
            ram: self.ram.saturating_add(rhs.ram),
            gpu: self.gpu.saturating_add(rhs.gpu),
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} ram={} gpu={}", self.cpu, self.ram, self.gpu)
    }
}

// ── Cluster ───────────────────────────────────────────────────────

/// A cluster owned by an organization, with a fixed total capacity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSpec {
    pub id: ClusterId,
    pub org_id: OrgId,
    pub name: String,
    pub capacity: Resources,
}

// ── Deployment ────────────────────────────────────────────────────

/// Lifecycle state of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    Running,
    /// Transient: evicted and about to be re-queued as `Pending`.
    Preempted,
    Completed,
    Failed,
    Cancelled,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Preempted => "preempted",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Terminal states that fail every dependent.
    pub fn poisons_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    /// Whether a deployment in this state holds a ledger reservation.
    pub fn holds_resources(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A submitted workload and its scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub cluster_id: ClusterId,
    pub org_id: OrgId,
    pub name: String,
    /// Container image reference.
    pub image: String,
    pub resources: Resources,
    /// Higher is more important.
    pub priority: i64,
    pub state: DeploymentState,
    /// Logical submission tick; the FIFO tie-break among equal priorities.
    pub created_tick: u64,
    /// Unix timestamp (seconds) of submission.
    pub submitted_at: u64,
    /// Number of times this deployment has been evicted.
    pub preemptions: u32,
    /// Deployments that must complete before this one may run.
    pub dependencies: Vec<DeploymentId>,
}

impl DeploymentRecord {
    /// Build the key for the deployments table.
    pub fn table_key(&self) -> String {
        deployment_key(self.id)
    }

    /// Queue order: priority descending, then submission tick ascending.
    pub fn queue_order(&self, other: &DeploymentRecord) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.created_tick.cmp(&other.created_tick))
    }
}

impl ClusterSpec {
    /// Build the key for the clusters table.
    pub fn table_key(&self) -> String {
        cluster_key(self.id)
    }
}

// ── Dependency edge ───────────────────────────────────────────────

/// `dependency` must reach `Completed` before `dependent` may run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DependencyEdge {
    pub dependency: DeploymentId,
    pub dependent: DeploymentId,
}

impl DependencyEdge {
    /// Build the composite key for the edges table.
    pub fn table_key(&self) -> String {
        format!("{:020}:{:020}", self.dependent, self.dependency)
    }
}

/// Zero-padded so that lexicographic key order matches numeric order.
pub fn cluster_key(id: ClusterId) -> String {
    format!("{id:020}")
}

pub fn deployment_key(id: DeploymentId) -> String {
    format!("{id:020}")
}
