//! Deployment registry — records and their lifecycle state.
//!
//! The registry allocates ids and submission ticks and guards every state
//! change behind a compare-and-set, so two triggers racing on the same
//! record cannot both win. It holds no scheduling policy.

use std::collections::HashMap;
use std::sync::RwLock;

use capgrid_state::{ClusterId, DeploymentId, DeploymentRecord, DeploymentState, OrgId, Resources};
use tracing::debug;

use crate::error::RegistryError;

/// Fields supplied by the submitter; the registry fills in the rest.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub cluster_id: ClusterId,
    pub org_id: OrgId,
    pub name: String,
    pub image: String,
    pub resources: Resources,
    pub priority: i64,
    pub dependencies: Vec<DeploymentId>,
    pub submitted_at: u64,
}

#[derive(Debug)]
struct Inner {
    records: HashMap<DeploymentId, DeploymentRecord>,
    next_id: DeploymentId,
    next_tick: u64,
}

#[derive(Debug)]
pub struct DeploymentRegistry {
    inner: RwLock<Inner>,
}

impl Default for DeploymentRegistry {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                next_id: 1,
                next_tick: 1,
            }),
        }
    }
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record in `Pending` with a fresh id and tick.
    pub fn insert(&self, new: NewDeployment) -> DeploymentRecord {
        let mut inner = self.inner.write().expect("registry lock");
        let id = inner.next_id;
        let tick = inner.next_tick;
        inner.next_id += 1;
        inner.next_tick += 1;

        let record = DeploymentRecord {
            id,
            cluster_id: new.cluster_id,
            org_id: new.org_id,
            name: new.name,
            image: new.image,
            resources: new.resources,
            priority: new.priority,
            state: DeploymentState::Pending,
            created_tick: tick,
            submitted_at: new.submitted_at,
            preemptions: 0,
            dependencies: new.dependencies,
        };
        inner.records.insert(id, record.clone());
        debug!(deployment_id = id, cluster_id = record.cluster_id, tick, "deployment registered");
        record
    }

    /// Reinstate a previously persisted record, keeping its id and tick.
    pub fn restore(&self, record: DeploymentRecord) {
        let mut inner = self.inner.write().expect("registry lock");
        inner.next_id = inner.next_id.max(record.id + 1);
        inner.next_tick = inner.next_tick.max(record.created_tick + 1);
        inner.records.insert(record.id, record);
    }

    pub fn get(&self, id: DeploymentId) -> Option<DeploymentRecord> {
        self.inner.read().expect("registry lock").records.get(&id).cloned()
    }

    pub fn state(&self, id: DeploymentId) -> Option<DeploymentState> {
        self.inner
            .read()
            .expect("registry lock")
            .records
            .get(&id)
            .map(|r| r.state)
    }

    /// Atomically move `id` from `expected` to `new`.
    ///
    /// Fails with `StaleState` (and changes nothing) if the record is not
    /// currently in `expected`. Returns the updated record.
    pub fn transition(
        &self,
        id: DeploymentId,
        expected: DeploymentState,
        new: DeploymentState,
    ) -> Result<DeploymentRecord, RegistryError> {
        let mut inner = self.inner.write().expect("registry lock");
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(RegistryError::UnknownDeployment(id))?;

        if record.state != expected {
            return Err(RegistryError::StaleState {
                id,
                expected,
                actual: record.state,
            });
        }

        record.state = new;
        if new == DeploymentState::Preempted {
            record.preemptions += 1;
        }
        debug!(deployment_id = id, from = %expected, to = %new, "state transition");
        Ok(record.clone())
    }

    /// Record an extra dependency on `id`. No-op if already present.
    pub fn add_dependency(&self, id: DeploymentId, depends_on: DeploymentId) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock");
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(RegistryError::UnknownDeployment(id))?;
        if !record.dependencies.contains(&depends_on) {
            record.dependencies.push(depends_on);
        }
        Ok(())
    }

    /// Pending deployments on a cluster, in queue order.
    pub fn pending_on(&self, cluster: ClusterId) -> Vec<DeploymentRecord> {
        let mut pending = self.select(|r| r.cluster_id == cluster && r.state == DeploymentState::Pending);
        pending.sort_by(|a, b| a.queue_order(b));
        pending
    }

    /// Running deployments on a cluster, in queue order.
    pub fn running_on(&self, cluster: ClusterId) -> Vec<DeploymentRecord> {
        let mut running = self.select(|r| r.cluster_id == cluster && r.state == DeploymentState::Running);
        running.sort_by(|a, b| a.queue_order(b));
        running
    }

    /// All records in id order, optionally restricted to one organization.
    pub fn list(&self, org: Option<OrgId>) -> Vec<DeploymentRecord> {
        let mut all = self.select(|r| org.is_none_or(|o| r.org_id == o));
        all.sort_by_key(|r| r.id);
        all
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(&self, pred: impl Fn(&DeploymentRecord) -> bool) -> Vec<DeploymentRecord> {
        self.inner
            .read()
            .expect("registry lock")
            .records
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }
}
