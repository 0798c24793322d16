//! Scheduler — admission and priority preemption per cluster.
//!
//! Every trigger (submit, complete, cancel, fail, new dependency) runs an
//! admission pass over the affected cluster's queue while holding that
//! cluster's lock:
//! - READY candidates are ranked by priority, then submission order
//! - a candidate that fits is admitted; one that does not may evict
//!   strictly lower-priority RUNNING deployments
//! - evicted deployments go back to the queue with their original rank
//! - the pass repeats until nothing changes
//!
//! Locks are per cluster, so passes on different clusters run in
//! parallel. Ledger, registry and graph are only touched through short
//! synchronous critical sections; nothing awaits while holding them.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use capgrid_state::*;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{RegistryError, SchedulerError, SchedulerResult};
use crate::graph::DependencyGraph;
use crate::ledger::ResourceLedger;
use crate::preemption::{RunningState, select_victims};
use crate::registry::{DeploymentRegistry, NewDeployment};
use crate::report::{Cause, ClusterStatus, ScheduleReport, SubmitOutcome, Transition};

/// A deployment submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub cluster_id: ClusterId,
    pub org_id: OrgId,
    pub name: String,
    pub image: String,
    pub resources: Resources,
    pub priority: i64,
    pub dependencies: Vec<DeploymentId>,
}

/// Outcome of considering one candidate.
enum Step {
    Admitted,
    /// Admitted after evicting victims; the queue must be re-ranked.
    Preempted,
    Blocked,
    /// Left the queue since the candidate list was taken.
    Withdrawn,
}

/// The admission/preemption engine.
pub struct Scheduler {
    ledger: ResourceLedger,
    registry: DeploymentRegistry,
    graph: DependencyGraph,
    clusters: RwLock<HashMap<ClusterId, ClusterSpec>>,
    /// Per-cluster serialization tokens. tokio's mutex is FIFO, so
    /// triggers for one cluster run in arrival order.
    locks: RwLock<HashMap<ClusterId, Arc<Mutex<()>>>>,
    store: Option<StateStore>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create an empty scheduler with no persistence.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            ledger: ResourceLedger::new(),
            registry: DeploymentRegistry::new(),
            graph: DependencyGraph::new(),
            clusters: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            store: None,
            config,
        }
    }

    /// Mirror every decision into `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Rebuild ledger, registry and graph from a persisted store.
    ///
    /// A snapshot whose RUNNING set over-commits a cluster, or whose edges
    /// form a cycle, is rejected as an integrity error.
    pub fn restore(store: StateStore, config: SchedulerConfig) -> SchedulerResult<Self> {
        let mut scheduler = Self::new(config);

        let clusters = store.list_clusters()?;
        for cluster in &clusters {
            scheduler.install_cluster(cluster.clone())?;
        }

        let records = store.list_deployments()?;
        for mut record in records.iter().cloned() {
            if !scheduler.ledger.contains(record.cluster_id) {
                return Err(SchedulerError::Integrity(format!(
                    "deployment {} references unknown cluster {}",
                    record.id, record.cluster_id
                )));
            }
            // Eviction is never persisted half-way; treat it as queued.
            if record.state == DeploymentState::Preempted {
                record.state = DeploymentState::Pending;
            }
            if record.state.holds_resources() {
                scheduler
                    .ledger
                    .reserve(record.cluster_id, &record.resources)
                    .map_err(|e| {
                        SchedulerError::Integrity(format!("restored deployment {} over-commits: {e}", record.id))
                    })?;
            }
            scheduler.graph.add_node(record.id);
            scheduler.registry.restore(record);
        }

        for edge in store.list_edges()? {
            scheduler
                .graph
                .add_edge(edge.dependency, edge.dependent)
                .map_err(|e| SchedulerError::Integrity(format!("persisted edges: {e}")))?;
        }

        info!(
            clusters = clusters.len(),
            deployments = records.len(),
            "scheduler state restored"
        );
        scheduler.store = Some(store);
        Ok(scheduler)
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Make a cluster schedulable.
    pub fn register_cluster(&self, spec: ClusterSpec) -> SchedulerResult<()> {
        self.install_cluster(spec.clone())?;
        if let Some(store) = &self.store {
            store.put_cluster(&spec)?;
        }
        info!(cluster_id = spec.id, org_id = spec.org_id, capacity = %spec.capacity, "cluster registered");
        Ok(())
    }

    pub fn list_clusters(&self) -> Vec<ClusterSpec> {
        let mut clusters: Vec<_> = self.clusters.read().expect("clusters lock").values().cloned().collect();
        clusters.sort_by_key(|c| c.id);
        clusters
    }

    /// Lock-free snapshot of a cluster's books and queues.
    ///
    /// Under concurrent writes the running/pending lists and the ledger
    /// figures may come from slightly different instants.
    pub fn get_cluster_status(&self, cluster_id: ClusterId) -> SchedulerResult<ClusterStatus> {
        let spec = self.cluster(cluster_id)?;
        let books = self.ledger.snapshot(cluster_id)?;
        Ok(ClusterStatus {
            cluster_id,
            name: spec.name,
            total: books.total,
            committed: books.committed,
            available: books.available,
            running: self.registry.running_on(cluster_id),
            pending: self.registry.pending_on(cluster_id),
        })
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn get_deployment(&self, id: DeploymentId) -> SchedulerResult<DeploymentRecord> {
        self.lookup(id)
    }

    pub fn list_deployments(&self, org: Option<OrgId>) -> Vec<DeploymentRecord> {
        self.registry.list(org)
    }

    /// Validate and enqueue a deployment, then schedule its cluster.
    ///
    /// Capacity shortfall is not an error: the deployment comes back
    /// `Pending`, together with every transition the pass performed.
    pub async fn submit_deployment(
        &self,
        request: SubmitRequest,
        deadline: Option<Duration>,
    ) -> SchedulerResult<SubmitOutcome> {
        let cluster = self.cluster(request.cluster_id)?;
        if cluster.org_id != request.org_id {
            debug!(
                cluster_id = cluster.id,
                org_id = request.org_id,
                "cluster belongs to another organization"
            );
            return Err(SchedulerError::UnknownCluster(request.cluster_id));
        }
        if !request.resources.fits_within(&cluster.capacity) {
            return Err(SchedulerError::InvalidResources(format!(
                "request ({}) exceeds total capacity ({}) of cluster {}",
                request.resources, cluster.capacity, cluster.id
            )));
        }

        let mut dependencies = Vec::with_capacity(request.dependencies.len());
        for dep in request.dependencies {
            self.lookup(dep)?;
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        let guard = self.lock_cluster(cluster.id, deadline).await?;
        let record = self.registry.insert(NewDeployment {
            cluster_id: cluster.id,
            org_id: request.org_id,
            name: request.name,
            image: request.image,
            resources: request.resources,
            priority: request.priority,
            dependencies,
            submitted_at: epoch_secs(),
        });
        self.graph.add_node(record.id);
        info!(
            deployment_id = record.id,
            cluster_id = cluster.id,
            priority = record.priority,
            resources = %record.resources,
            "deployment submitted"
        );

        let mut out = Vec::new();
        let result = self.place_new(&record, &mut out);
        let mirrored = self.mirror(&out, &[record.id]);
        drop(guard);
        result?;
        mirrored?;

        let state = self.lookup(record.id)?.state;
        Ok(SubmitOutcome {
            deployment_id: record.id,
            state,
            transitions: out,
        })
    }

    /// Cancel a deployment on behalf of the system.
    pub async fn cancel_deployment(
        &self,
        id: DeploymentId,
        deadline: Option<Duration>,
    ) -> SchedulerResult<ScheduleReport> {
        let mut out = Vec::new();
        self.terminate(id, DeploymentState::Cancelled, deadline, &mut out).await?;
        Ok(ScheduleReport { transitions: out })
    }

    /// Cancel a deployment on behalf of an organization; only the owner may.
    pub async fn cancel_deployment_as(
        &self,
        id: DeploymentId,
        org_id: OrgId,
        deadline: Option<Duration>,
    ) -> SchedulerResult<ScheduleReport> {
        if self.lookup(id)?.org_id != org_id {
            return Err(SchedulerError::NotOwner { id, org_id });
        }
        self.cancel_deployment(id, deadline).await
    }

    /// Report a deployment as failed. Its dependents fail with it.
    pub async fn fail_deployment(
        &self,
        id: DeploymentId,
        deadline: Option<Duration>,
    ) -> SchedulerResult<ScheduleReport> {
        let mut out = Vec::new();
        self.terminate(id, DeploymentState::Failed, deadline, &mut out).await?;
        Ok(ScheduleReport { transitions: out })
    }

    /// Mark a RUNNING deployment completed and reschedule.
    ///
    /// A second completion is a `Conflict` and releases nothing.
    pub async fn complete_deployment(
        &self,
        id: DeploymentId,
        deadline: Option<Duration>,
    ) -> SchedulerResult<ScheduleReport> {
        let record = self.lookup(id)?;
        let mut out = Vec::new();

        let guard = self.lock_cluster(record.cluster_id, deadline).await?;
        let result = self.complete_locked(&record, &mut out);
        let mirrored = self.mirror(&out, &[]);
        drop(guard);
        result?;
        mirrored?;

        // Dependents elsewhere may have just become READY.
        for cluster in self.dependent_clusters(id, record.cluster_id) {
            self.settle_cluster(cluster, deadline, &mut out).await?;
        }
        Ok(ScheduleReport { transitions: out })
    }

    /// Make a PENDING deployment wait for `depends_on` as well.
    pub async fn add_dependency(
        &self,
        id: DeploymentId,
        depends_on: DeploymentId,
        deadline: Option<Duration>,
    ) -> SchedulerResult<ScheduleReport> {
        let record = self.lookup(id)?;
        self.lookup(depends_on)?;
        let mut out = Vec::new();

        let guard = self.lock_cluster(record.cluster_id, deadline).await?;
        let result = self.add_dependency_locked(id, depends_on, &mut out);
        let mirrored = self.mirror(&out, &[id]);
        drop(guard);
        result?;
        mirrored?;
        Ok(ScheduleReport { transitions: out })
    }

    /// Run an admission pass on every cluster, e.g. after a restore.
    pub async fn reconcile(&self) -> SchedulerResult<ScheduleReport> {
        let mut out = Vec::new();
        for cluster in self.list_clusters() {
            self.settle_cluster(cluster.id, None, &mut out).await?;
        }
        Ok(ScheduleReport { transitions: out })
    }

    /// Verify that a cluster's committed capacity equals what its RUNNING
    /// deployments hold and stays within the total.
    pub fn check_books(&self, cluster: ClusterId) -> SchedulerResult<()> {
        let books = self.ledger.snapshot(cluster)?;
        let held = self
            .registry
            .running_on(cluster)
            .iter()
            .fold(Resources::ZERO, |acc, r| acc + r.resources);

        if held != books.committed || !books.committed.fits_within(&books.total) {
            return Err(self.integrity(format!(
                "cluster {cluster}: running deployments hold ({held}), ledger committed ({}), total ({})",
                books.committed, books.total
            )));
        }
        Ok(())
    }

    // ── Internal: operations under the cluster lock ─────────────────

    fn place_new(&self, record: &DeploymentRecord, out: &mut Vec<Transition>) -> SchedulerResult<()> {
        let mut poisoned = None;
        for &dep in &record.dependencies {
            self.graph.add_edge(dep, record.id)?;
            self.persist_edge(dep, record.id)?;
            if self.registry.state(dep).is_some_and(|s| s.poisons_dependents()) {
                poisoned.get_or_insert(dep);
            }
        }

        match poisoned {
            Some(dep) => self.fail_dependent(record.id, dep, out),
            None => self.settle(record.cluster_id, out),
        }
    }

    fn complete_locked(&self, record: &DeploymentRecord, out: &mut Vec<Transition>) -> SchedulerResult<()> {
        let id = record.id;
        let completed = match self
            .registry
            .transition(id, DeploymentState::Running, DeploymentState::Completed)
        {
            Ok(completed) => completed,
            Err(RegistryError::StaleState {
                actual: DeploymentState::Completed,
                ..
            }) => {
                return Err(SchedulerError::Conflict {
                    id,
                    expected: DeploymentState::Running,
                    actual: DeploymentState::Completed,
                });
            }
            Err(RegistryError::StaleState { actual, .. }) => {
                return Err(SchedulerError::InvalidTransition {
                    id,
                    state: actual,
                    operation: "complete",
                });
            }
            Err(err) => return Err(err.into()),
        };

        self.release(record.cluster_id, &record.resources)?;
        out.push(Transition::new(&completed, DeploymentState::Running, Cause::Completed));
        info!(deployment_id = id, cluster_id = record.cluster_id, "deployment completed");
        self.settle(record.cluster_id, out)
    }

    /// Move a deployment to `Cancelled` or `Failed`.
    async fn terminate(
        &self,
        id: DeploymentId,
        target: DeploymentState,
        deadline: Option<Duration>,
        out: &mut Vec<Transition>,
    ) -> SchedulerResult<()> {
        let (operation, cause) = match target {
            DeploymentState::Cancelled => ("cancel", Cause::Cancelled),
            _ => ("fail", Cause::Failed),
        };
        let record = self.lookup(id)?;
        if record.state.is_terminal() {
            return Err(SchedulerError::InvalidTransition {
                id,
                state: record.state,
                operation,
            });
        }

        // A queued deployment holds no reservation: no cluster lock needed.
        if record.state == DeploymentState::Pending {
            match self.registry.transition(id, DeploymentState::Pending, target) {
                Ok(updated) => {
                    out.push(Transition::new(&updated, DeploymentState::Pending, cause));
                    info!(deployment_id = id, state = %target, "pending deployment terminated");
                    self.cascade_failure(id, out)?;
                    return self.mirror(out, &[]);
                }
                Err(RegistryError::StaleState { actual, .. }) if actual.is_terminal() => {
                    return Err(SchedulerError::InvalidTransition {
                        id,
                        state: actual,
                        operation,
                    });
                }
                // Admitted in the meantime; fall through to the locked path.
                Err(_) => {}
            }
        }

        let guard = self.lock_cluster(record.cluster_id, deadline).await?;
        let start = out.len();
        let result = self.terminate_locked(&record, target, operation, cause, out);
        let mirrored = self.mirror(&out[start..], &[]);
        drop(guard);
        result?;
        mirrored
    }

    fn terminate_locked(
        &self,
        record: &DeploymentRecord,
        target: DeploymentState,
        operation: &'static str,
        cause: Cause,
        out: &mut Vec<Transition>,
    ) -> SchedulerResult<()> {
        let id = record.id;
        match self.lookup(id)?.state {
            DeploymentState::Pending => {
                let updated = self.registry.transition(id, DeploymentState::Pending, target)?;
                out.push(Transition::new(&updated, DeploymentState::Pending, cause));
                info!(deployment_id = id, state = %target, "pending deployment terminated");
                self.cascade_failure(id, out)
            }
            DeploymentState::Running => {
                let updated = self.registry.transition(id, DeploymentState::Running, target)?;
                self.release(record.cluster_id, &record.resources)?;
                out.push(Transition::new(&updated, DeploymentState::Running, cause));
                info!(deployment_id = id, state = %target, "running deployment terminated");
                self.cascade_failure(id, out)?;
                self.settle(record.cluster_id, out)
            }
            state => Err(SchedulerError::InvalidTransition { id, state, operation }),
        }
    }

    fn add_dependency_locked(
        &self,
        id: DeploymentId,
        depends_on: DeploymentId,
        out: &mut Vec<Transition>,
    ) -> SchedulerResult<()> {
        let state = self.lookup(id)?.state;
        if state != DeploymentState::Pending {
            return Err(SchedulerError::InvalidTransition {
                id,
                state,
                operation: "add a dependency to",
            });
        }

        if self.graph.add_edge(depends_on, id)? {
            self.registry.add_dependency(id, depends_on)?;
            self.persist_edge(depends_on, id)?;
        }

        if self.registry.state(depends_on).is_some_and(|s| s.poisons_dependents()) {
            self.fail_dependent(id, depends_on, out)?;
            self.cascade_failure(id, out)?;
        }
        Ok(())
    }

    async fn settle_cluster(
        &self,
        cluster: ClusterId,
        deadline: Option<Duration>,
        out: &mut Vec<Transition>,
    ) -> SchedulerResult<()> {
        let guard = self.lock_cluster(cluster, deadline).await?;
        let start = out.len();
        let result = self.settle(cluster, out);
        let mirrored = self.mirror(&out[start..], &[]);
        drop(guard);
        result?;
        mirrored
    }

    // ── Internal: the admission pass ────────────────────────────────

    /// Run the admission pass to a fixed point, retrying lost races.
    fn settle(&self, cluster: ClusterId, out: &mut Vec<Transition>) -> SchedulerResult<()> {
        let mut retries = 0;
        let result = loop {
            match self.admission_pass(cluster, out) {
                Err(SchedulerError::Conflict { id, expected, actual }) if retries < self.config.conflict_retries => {
                    retries += 1;
                    warn!(
                        cluster_id = cluster,
                        deployment_id = id,
                        %expected,
                        %actual,
                        retries,
                        "admission pass lost a race, re-running"
                    );
                }
                other => break other,
            }
        };
        self.check_books(cluster)?;
        result
    }

    fn admission_pass(&self, cluster: ClusterId, out: &mut Vec<Transition>) -> SchedulerResult<()> {
        let capacity = self.ledger.total(cluster)?;
        let mut rounds = 0usize;

        'fixed_point: loop {
            rounds += 1;
            let candidates: Vec<DeploymentRecord> = self
                .registry
                .pending_on(cluster)
                .into_iter()
                .filter(|d| self.is_ready(d.id))
                .collect();

            let mut admitted_any = false;
            // Candidates arrive in queue order, so only strictly lower
            // priorities may backfill around a blocked one.
            let mut blocked_priority: Option<i64> = None;
            for candidate in &candidates {
                if blocked_priority == Some(candidate.priority) {
                    continue;
                }
                match self.try_admit(cluster, candidate, &capacity, out)? {
                    Step::Admitted => admitted_any = true,
                    // Victims re-entered the queue and may outrank the rest.
                    Step::Preempted => continue 'fixed_point,
                    Step::Blocked => blocked_priority = Some(candidate.priority),
                    Step::Withdrawn => {}
                }
            }

            if !admitted_any {
                debug!(cluster_id = cluster, rounds, "admission pass reached a fixed point");
                return Ok(());
            }
        }
    }

    fn try_admit(
        &self,
        cluster: ClusterId,
        candidate: &DeploymentRecord,
        capacity: &Resources,
        out: &mut Vec<Transition>,
    ) -> SchedulerResult<Step> {
        // Cancellation of queued work does not take the cluster lock.
        if self.registry.state(candidate.id) != Some(DeploymentState::Pending) {
            return Ok(Step::Withdrawn);
        }

        let available = self.ledger.available(cluster)?;
        let running: Vec<RunningState> = self
            .registry
            .running_on(cluster)
            .iter()
            .map(RunningState::from)
            .collect();

        let Some(eviction) = select_victims(
            &candidate.resources,
            candidate.priority,
            &available,
            capacity,
            &running,
        ) else {
            debug!(
                deployment_id = candidate.id,
                priority = candidate.priority,
                %available,
                "candidate stays pending"
            );
            return Ok(Step::Blocked);
        };

        for victim in &eviction.victims {
            self.evict(cluster, victim, candidate.id, out)?;
        }
        self.admit(cluster, candidate, out)?;

        if eviction.victims.is_empty() {
            Ok(Step::Admitted)
        } else {
            info!(
                deployment_id = candidate.id,
                victims = eviction.victims.len(),
                freed = %eviction.freed,
                "admitted by preemption"
            );
            Ok(Step::Preempted)
        }
    }

    fn evict(
        &self,
        cluster: ClusterId,
        victim: &RunningState,
        by: DeploymentId,
        out: &mut Vec<Transition>,
    ) -> SchedulerResult<()> {
        let id = victim.deployment_id;
        let preempted = self
            .registry
            .transition(id, DeploymentState::Running, DeploymentState::Preempted)?;
        self.release(cluster, &victim.resources)?;
        out.push(Transition::new(&preempted, DeploymentState::Running, Cause::Preempted { by }));

        let requeued = self
            .registry
            .transition(id, DeploymentState::Preempted, DeploymentState::Pending)?;
        out.push(Transition::new(&requeued, DeploymentState::Preempted, Cause::Requeued));

        info!(
            deployment_id = id,
            cluster_id = cluster,
            preempted_by = by,
            priority = victim.priority,
            "deployment preempted"
        );
        Ok(())
    }

    fn admit(&self, cluster: ClusterId, candidate: &DeploymentRecord, out: &mut Vec<Transition>) -> SchedulerResult<()> {
        self.ledger
            .reserve(cluster, &candidate.resources)
            .map_err(|e| self.integrity(e.to_string()))?;

        match self
            .registry
            .transition(candidate.id, DeploymentState::Pending, DeploymentState::Running)
        {
            Ok(admitted) => {
                out.push(Transition::new(&admitted, DeploymentState::Pending, Cause::Admitted));
                info!(
                    deployment_id = candidate.id,
                    cluster_id = cluster,
                    priority = candidate.priority,
                    "deployment admitted"
                );
                Ok(())
            }
            Err(err) => {
                // Lost a race with a lock-free cancel: hand the capacity back.
                self.release(cluster, &candidate.resources)?;
                Err(err.into())
            }
        }
    }

    // ── Internal: dependency failure ────────────────────────────────

    /// Fail every transitive dependent of `root` that is still queued.
    fn cascade_failure(&self, root: DeploymentId, out: &mut Vec<Transition>) -> SchedulerResult<()> {
        for id in self.graph.transitive_dependents(root) {
            self.fail_dependent(id, root, out)?;
        }
        Ok(())
    }

    fn fail_dependent(
        &self,
        id: DeploymentId,
        dependency: DeploymentId,
        out: &mut Vec<Transition>,
    ) -> SchedulerResult<()> {
        match self
            .registry
            .transition(id, DeploymentState::Pending, DeploymentState::Failed)
        {
            Ok(failed) => {
                out.push(Transition::new(
                    &failed,
                    DeploymentState::Pending,
                    Cause::DependencyFailed { dependency },
                ));
                warn!(deployment_id = id, dependency, "dependency did not complete, deployment failed");
                Ok(())
            }
            Err(RegistryError::StaleState { actual, .. }) if actual.is_terminal() => Ok(()),
            // Only READY deployments run, and READY needs every dependency
            // completed; a running dependent of a failed one is a bug.
            Err(err) => Err(self.integrity(format!("failing dependent {id} of {dependency}: {err}"))),
        }
    }

    // ── Internal: helpers ───────────────────────────────────────────

    fn install_cluster(&self, spec: ClusterSpec) -> SchedulerResult<()> {
        self.ledger.register(spec.id, spec.capacity)?;
        self.locks
            .write()
            .expect("locks lock")
            .insert(spec.id, Arc::new(Mutex::new(())));
        self.clusters.write().expect("clusters lock").insert(spec.id, spec);
        Ok(())
    }

    fn cluster(&self, id: ClusterId) -> SchedulerResult<ClusterSpec> {
        self.clusters
            .read()
            .expect("clusters lock")
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::UnknownCluster(id))
    }

    fn lookup(&self, id: DeploymentId) -> SchedulerResult<DeploymentRecord> {
        self.registry.get(id).ok_or(SchedulerError::UnknownDeployment(id))
    }

    fn is_ready(&self, id: DeploymentId) -> bool {
        self.graph.is_ready(id, |dep| self.registry.state(dep))
    }

    /// Clusters, other than `own`, hosting dependents of `id`.
    fn dependent_clusters(&self, id: DeploymentId, own: ClusterId) -> BTreeSet<ClusterId> {
        self.graph
            .dependents(id)
            .into_iter()
            .filter_map(|dep| self.registry.get(dep))
            .map(|d| d.cluster_id)
            .filter(|&c| c != own)
            .collect()
    }

    /// Wait for a cluster's serialization token, up to the deadline.
    async fn lock_cluster(
        &self,
        cluster: ClusterId,
        deadline: Option<Duration>,
    ) -> SchedulerResult<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .read()
            .expect("locks lock")
            .get(&cluster)
            .cloned()
            .ok_or(SchedulerError::UnknownCluster(cluster))?;

        match deadline.or_else(|| self.config.lock_timeout()) {
            None => Ok(lock.lock_owned().await),
            Some(limit) => tokio::time::timeout(limit, lock.lock_owned())
                .await
                .map_err(|_| {
                    warn!(
                        cluster_id = cluster,
                        waited_ms = limit.as_millis() as u64,
                        "cluster lock not acquired before deadline"
                    );
                    SchedulerError::Busy {
                        cluster_id: cluster,
                        waited: limit,
                    }
                }),
        }
    }

    fn release(&self, cluster: ClusterId, amounts: &Resources) -> SchedulerResult<()> {
        self.ledger
            .release(cluster, amounts)
            .map_err(|e| self.integrity(e.to_string()))
    }

    /// Log and, in debug builds, abort on a broken invariant.
    fn integrity(&self, message: String) -> SchedulerError {
        error!(%message, "scheduler integrity violation");
        if cfg!(debug_assertions) {
            panic!("scheduler integrity violation: {message}");
        }
        SchedulerError::Integrity(message)
    }

    /// Persist every record touched by `transitions` plus `extra`.
    ///
    /// Records are read from the registry inside the store's write
    /// transaction, so a slower writer never commits a state older than
    /// the one a faster writer already stored.
    fn mirror(&self, transitions: &[Transition], extra: &[DeploymentId]) -> SchedulerResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let ids: BTreeSet<DeploymentId> = transitions
            .iter()
            .map(|t| t.deployment_id)
            .chain(extra.iter().copied())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        store.put_deployments_with(|| ids.iter().filter_map(|&id| self.registry.get(id)).collect())?;
        Ok(())
    }

    fn persist_edge(&self, dependency: DeploymentId, dependent: DeploymentId) -> SchedulerResult<()> {
        if let Some(store) = &self.store {
            store.put_edge(&DependencyEdge { dependency, dependent })?;
        }
        Ok(())
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORG: OrgId = 1;

    fn cluster(id: ClusterId, capacity: Resources) -> ClusterSpec {
        ClusterSpec {
            id,
            org_id: ORG,
            name: format!("cluster-{id}"),
            capacity,
        }
    }

    fn scheduler_with_cpu(cpu: u64) -> Scheduler {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.register_cluster(cluster(1, Resources::new(cpu, 0, 0))).unwrap();
        scheduler
    }

    fn request(cluster_id: ClusterId, cpu: u64, priority: i64) -> SubmitRequest {
        SubmitRequest {
            cluster_id,
            org_id: ORG,
            name: "job".to_string(),
            image: "busybox:latest".to_string(),
            resources: Resources::new(cpu, 0, 0),
            priority,
            dependencies: Vec::new(),
        }
    }

    async fn submit(scheduler: &Scheduler, cpu: u64, priority: i64) -> SubmitOutcome {
        scheduler.submit_deployment(request(1, cpu, priority), None).await.unwrap()
    }

    async fn submit_after(scheduler: &Scheduler, cpu: u64, deps: &[DeploymentId]) -> SubmitOutcome {
        let mut req = request(1, cpu, 0);
        req.dependencies = deps.to_vec();
        scheduler.submit_deployment(req, None).await.unwrap()
    }

    fn state(scheduler: &Scheduler, id: DeploymentId) -> DeploymentState {
        scheduler.get_deployment(id).unwrap().state
    }

    #[test]
    fn epoch_secs_returns_reasonable_value() {
        // Should be after 2024-01-01.
        assert!(epoch_secs() > 1_704_067_200);
    }

    // ── Admission and preemption ───────────────────────────────────

    #[tokio::test]
    async fn higher_priority_preempts_lower() {
        let scheduler = scheduler_with_cpu(4);
        let d1 = submit(&scheduler, 4, 1).await;
        assert_eq!(d1.state, DeploymentState::Running);

        let d2 = submit(&scheduler, 4, 5).await;
        assert_eq!(d2.state, DeploymentState::Running);
        assert_eq!(d2.preempted(), vec![d1.deployment_id]);
        assert_eq!(state(&scheduler, d1.deployment_id), DeploymentState::Pending);

        let d1_path: Vec<_> = d2
            .transitions
            .iter()
            .filter(|t| t.deployment_id == d1.deployment_id)
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            d1_path,
            vec![
                (DeploymentState::Running, DeploymentState::Preempted),
                (DeploymentState::Preempted, DeploymentState::Pending),
            ]
        );
        scheduler.check_books(1).unwrap();
    }

    #[tokio::test]
    async fn preemption_evicts_only_the_earliest_equal_victim() {
        let scheduler = scheduler_with_cpu(4);
        let d1 = submit(&scheduler, 2, 5).await;
        let d2 = submit(&scheduler, 2, 5).await;
        assert_eq!(d1.state, DeploymentState::Running);
        assert_eq!(d2.state, DeploymentState::Running);

        let d3 = submit(&scheduler, 2, 10).await;
        assert_eq!(d3.state, DeploymentState::Running);
        assert_eq!(d3.preempted(), vec![d1.deployment_id]);
        assert_eq!(state(&scheduler, d1.deployment_id), DeploymentState::Pending);
        assert_eq!(state(&scheduler, d2.deployment_id), DeploymentState::Running);
    }

    #[tokio::test]
    async fn equal_priority_never_preempts() {
        let scheduler = scheduler_with_cpu(4);
        let d1 = submit(&scheduler, 4, 5).await;
        let d2 = submit(&scheduler, 4, 5).await;

        assert_eq!(d2.state, DeploymentState::Pending);
        assert!(d2.transitions.is_empty());
        assert_eq!(state(&scheduler, d1.deployment_id), DeploymentState::Running);
    }

    #[tokio::test]
    async fn preempted_deployment_keeps_its_seniority() {
        let scheduler = scheduler_with_cpu(4);
        let victim = submit(&scheduler, 4, 1).await;
        let winner = submit(&scheduler, 4, 5).await;
        let latecomer = submit(&scheduler, 4, 1).await;
        assert_eq!(latecomer.state, DeploymentState::Pending);

        let report = scheduler.complete_deployment(winner.deployment_id, None).await.unwrap();

        // The earlier submission wins the tie despite being preempted.
        let record = scheduler.get_deployment(victim.deployment_id).unwrap();
        assert_eq!(record.state, DeploymentState::Running);
        assert_eq!(record.preemptions, 1);
        assert_eq!(state(&scheduler, latecomer.deployment_id), DeploymentState::Pending);
        assert!(report.transitions.iter().any(|t| t.deployment_id == victim.deployment_id
            && t.cause == Cause::Admitted));
    }

    #[tokio::test]
    async fn fifo_among_equal_priority() {
        let scheduler = scheduler_with_cpu(4);
        let blocker = submit(&scheduler, 4, 9).await;
        let first = submit(&scheduler, 4, 3).await;
        let second = submit(&scheduler, 4, 3).await;

        scheduler.complete_deployment(blocker.deployment_id, None).await.unwrap();

        assert_eq!(state(&scheduler, first.deployment_id), DeploymentState::Running);
        assert_eq!(state(&scheduler, second.deployment_id), DeploymentState::Pending);
    }

    #[tokio::test]
    async fn lower_priority_backfills_free_capacity() {
        let scheduler = scheduler_with_cpu(4);
        submit(&scheduler, 3, 9).await;
        let big = submit(&scheduler, 4, 5).await;
        let small = submit(&scheduler, 1, 1).await;

        assert_eq!(big.state, DeploymentState::Pending);
        assert_eq!(small.state, DeploymentState::Running);
        scheduler.check_books(1).unwrap();
    }

    #[tokio::test]
    async fn equal_priority_never_jumps_a_blocked_head() {
        let scheduler = scheduler_with_cpu(4);
        let r1 = submit(&scheduler, 2, 9).await;
        let r2 = submit(&scheduler, 2, 9).await;
        let first = submit(&scheduler, 4, 5).await;
        let later = submit(&scheduler, 2, 5).await;
        assert_eq!(later.state, DeploymentState::Pending);

        let report = scheduler.complete_deployment(r1.deployment_id, None).await.unwrap();
        assert_eq!(report.transitions.len(), 1);
        assert_eq!(state(&scheduler, first.deployment_id), DeploymentState::Pending);
        assert_eq!(state(&scheduler, later.deployment_id), DeploymentState::Pending);
        assert_eq!(scheduler.get_cluster_status(1).unwrap().available, Resources::new(2, 0, 0));

        scheduler.complete_deployment(r2.deployment_id, None).await.unwrap();
        assert_eq!(state(&scheduler, first.deployment_id), DeploymentState::Running);
        assert_eq!(state(&scheduler, later.deployment_id), DeploymentState::Pending);
        scheduler.check_books(1).unwrap();
    }

    #[tokio::test]
    async fn backfill_still_admits_strictly_lower_priority() {
        let scheduler = scheduler_with_cpu(4);
        let r1 = submit(&scheduler, 2, 9).await;
        submit(&scheduler, 2, 9).await;
        let first = submit(&scheduler, 4, 5).await;
        let tail = submit(&scheduler, 2, 4).await;

        scheduler.complete_deployment(r1.deployment_id, None).await.unwrap();
        assert_eq!(state(&scheduler, first.deployment_id), DeploymentState::Pending);
        assert_eq!(state(&scheduler, tail.deployment_id), DeploymentState::Running);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "scheduler integrity violation")]
    fn over_release_is_an_integrity_violation() {
        let scheduler = scheduler_with_cpu(4);
        let _ = scheduler.release(1, &Resources::new(1, 0, 0));
    }

    #[tokio::test]
    async fn preemption_refused_when_insufficient() {
        let scheduler = scheduler_with_cpu(4);
        let low = submit(&scheduler, 2, 1).await;
        let high = submit(&scheduler, 2, 9).await;

        let mid = submit(&scheduler, 4, 5).await;
        assert_eq!(mid.state, DeploymentState::Pending);
        assert!(mid.transitions.is_empty());
        assert_eq!(state(&scheduler, low.deployment_id), DeploymentState::Running);
        assert_eq!(state(&scheduler, high.deployment_id), DeploymentState::Running);
    }

    #[tokio::test]
    async fn all_dimensions_are_accounted() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.register_cluster(cluster(1, Resources::new(8000, 32768, 1))).unwrap();

        let mut gpu_job = request(1, 1000, 1);
        gpu_job.resources.gpu = 1;
        let first = scheduler.submit_deployment(gpu_job.clone(), None).await.unwrap();
        let second = scheduler.submit_deployment(gpu_job, None).await.unwrap();

        assert_eq!(first.state, DeploymentState::Running);
        assert_eq!(second.state, DeploymentState::Pending);

        let status = scheduler.get_cluster_status(1).unwrap();
        assert_eq!(status.available, Resources::new(7000, 32768, 0));
    }

    // ── Validation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn oversized_request_is_rejected_before_queueing() {
        let scheduler = scheduler_with_cpu(4);
        let err = scheduler.submit_deployment(request(1, 5, 1), None).await.unwrap_err();

        assert!(matches!(err, SchedulerError::InvalidResources(_)));
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
        assert!(scheduler.list_deployments(None).is_empty());
    }

    #[tokio::test]
    async fn unknown_or_foreign_cluster() {
        let scheduler = scheduler_with_cpu(4);
        let err = scheduler.submit_deployment(request(2, 1, 1), None).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownCluster(2)));

        let mut foreign = request(1, 1, 1);
        foreign.org_id = 99;
        let err = scheduler.submit_deployment(foreign, None).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownCluster(1)));
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let scheduler = scheduler_with_cpu(4);
        let mut req = request(1, 1, 1);
        req.dependencies = vec![77];
        let err = scheduler.submit_deployment(req, None).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownDeployment(77)));
        assert!(scheduler.list_deployments(None).is_empty());
    }

    // ── Completion, cancellation, failure ──────────────────────────

    #[tokio::test]
    async fn completing_twice_is_a_conflict() {
        let scheduler = scheduler_with_cpu(4);
        let d1 = submit(&scheduler, 2, 1).await;
        submit(&scheduler, 2, 1).await;

        scheduler.complete_deployment(d1.deployment_id, None).await.unwrap();
        let err = scheduler
            .complete_deployment(d1.deployment_id, None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
        let status = scheduler.get_cluster_status(1).unwrap();
        assert_eq!(status.committed, Resources::new(2, 0, 0));
        scheduler.check_books(1).unwrap();
    }

    #[tokio::test]
    async fn completing_pending_is_invalid() {
        let scheduler = scheduler_with_cpu(4);
        submit(&scheduler, 4, 1).await;
        let queued = submit(&scheduler, 4, 1).await;

        let err = scheduler
            .complete_deployment(queued.deployment_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { operation: "complete", .. }));
    }

    #[tokio::test]
    async fn cancel_pending_then_running() {
        let scheduler = scheduler_with_cpu(4);
        let running = submit(&scheduler, 4, 1).await;
        let queued = submit(&scheduler, 4, 1).await;
        let next = submit(&scheduler, 4, 1).await;

        let report = scheduler.cancel_deployment(queued.deployment_id, None).await.unwrap();
        assert_eq!(report.transitions.len(), 1);
        assert_eq!(state(&scheduler, queued.deployment_id), DeploymentState::Cancelled);

        let report = scheduler.cancel_deployment(running.deployment_id, None).await.unwrap();
        assert_eq!(state(&scheduler, running.deployment_id), DeploymentState::Cancelled);
        assert_eq!(state(&scheduler, next.deployment_id), DeploymentState::Running);
        assert!(report.transitions.iter().any(|t| t.cause == Cause::Admitted));

        let err = scheduler
            .cancel_deployment(running.deployment_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { operation: "cancel", .. }));
        scheduler.check_books(1).unwrap();
    }

    #[tokio::test]
    async fn only_owner_cancels() {
        let scheduler = scheduler_with_cpu(4);
        let d = submit(&scheduler, 1, 1).await;

        let err = scheduler
            .cancel_deployment_as(d.deployment_id, 42, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotOwner { org_id: 42, .. }));

        scheduler.cancel_deployment_as(d.deployment_id, ORG, None).await.unwrap();
        assert_eq!(state(&scheduler, d.deployment_id), DeploymentState::Cancelled);
    }

    #[tokio::test]
    async fn unknown_deployment_operations() {
        let scheduler = scheduler_with_cpu(4);
        assert!(matches!(
            scheduler.cancel_deployment(5, None).await,
            Err(SchedulerError::UnknownDeployment(5))
        ));
        assert!(matches!(
            scheduler.complete_deployment(5, None).await,
            Err(SchedulerError::UnknownDeployment(5))
        ));
    }

    // ── Dependencies ───────────────────────────────────────────────

    #[tokio::test]
    async fn dependent_waits_for_completion() {
        let scheduler = scheduler_with_cpu(4);
        let d1 = submit(&scheduler, 1, 1).await;
        let d2 = submit_after(&scheduler, 1, &[d1.deployment_id]).await;

        // Capacity is free, but D1 has not completed.
        assert_eq!(d2.state, DeploymentState::Pending);

        let report = scheduler.complete_deployment(d1.deployment_id, None).await.unwrap();
        assert_eq!(state(&scheduler, d2.deployment_id), DeploymentState::Running);
        assert!(report
            .transitions
            .iter()
            .any(|t| t.deployment_id == d2.deployment_id && t.cause == Cause::Admitted));
    }

    #[tokio::test]
    async fn failure_cascades_breadth_first() {
        let scheduler = scheduler_with_cpu(4);
        let d1 = submit(&scheduler, 1, 1).await;
        let d2 = submit_after(&scheduler, 1, &[d1.deployment_id]).await;
        let d3 = submit_after(&scheduler, 1, &[d2.deployment_id]).await;

        let report = scheduler.fail_deployment(d1.deployment_id, None).await.unwrap();

        assert_eq!(state(&scheduler, d1.deployment_id), DeploymentState::Failed);
        assert_eq!(state(&scheduler, d2.deployment_id), DeploymentState::Failed);
        assert_eq!(state(&scheduler, d3.deployment_id), DeploymentState::Failed);
        let cascaded: Vec<_> = report
            .transitions
            .iter()
            .filter(|t| matches!(t.cause, Cause::DependencyFailed { .. }))
            .map(|t| t.deployment_id)
            .collect();
        assert_eq!(cascaded, vec![d2.deployment_id, d3.deployment_id]);
        assert_eq!(scheduler.get_cluster_status(1).unwrap().committed, Resources::ZERO);
    }

    #[tokio::test]
    async fn cancelled_dependency_fails_dependents() {
        let scheduler = scheduler_with_cpu(4);
        let d1 = submit(&scheduler, 4, 1).await;
        let d2 = submit(&scheduler, 4, 1).await;
        let d3 = submit_after(&scheduler, 1, &[d2.deployment_id]).await;

        scheduler.cancel_deployment(d2.deployment_id, None).await.unwrap();
        assert_eq!(state(&scheduler, d3.deployment_id), DeploymentState::Failed);
        assert_eq!(state(&scheduler, d1.deployment_id), DeploymentState::Running);
    }

    #[tokio::test]
    async fn submitting_against_failed_dependency_fails_immediately() {
        let scheduler = scheduler_with_cpu(4);
        let d1 = submit(&scheduler, 1, 1).await;
        scheduler.fail_deployment(d1.deployment_id, None).await.unwrap();

        let d2 = submit_after(&scheduler, 1, &[d1.deployment_id]).await;
        assert_eq!(d2.state, DeploymentState::Failed);
        assert_eq!(
            d2.transitions[0].cause,
            Cause::DependencyFailed {
                dependency: d1.deployment_id
            }
        );
    }

    #[tokio::test]
    async fn add_dependency_rejects_cycles() {
        let scheduler = scheduler_with_cpu(4);
        submit(&scheduler, 4, 100).await;
        let d1 = submit(&scheduler, 1, 1).await;
        let d2 = submit_after(&scheduler, 1, &[d1.deployment_id]).await;

        let err = scheduler
            .add_dependency(d1.deployment_id, d2.deployment_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::CycleDetected { .. }));
        assert!(scheduler.get_deployment(d1.deployment_id).unwrap().dependencies.is_empty());
    }

    #[tokio::test]
    async fn add_dependency_requires_pending() {
        let scheduler = scheduler_with_cpu(4);
        let running = submit(&scheduler, 1, 1).await;
        let other = submit(&scheduler, 1, 1).await;

        let err = scheduler
            .add_dependency(running.deployment_id, other.deployment_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn completion_unlocks_dependents_on_other_clusters() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.register_cluster(cluster(1, Resources::new(4, 0, 0))).unwrap();
        scheduler.register_cluster(cluster(2, Resources::new(4, 0, 0))).unwrap();

        let d1 = submit(&scheduler, 1, 1).await;
        let mut req = request(2, 1, 1);
        req.dependencies = vec![d1.deployment_id];
        let d2 = scheduler.submit_deployment(req, None).await.unwrap();
        assert_eq!(d2.state, DeploymentState::Pending);

        let report = scheduler.complete_deployment(d1.deployment_id, None).await.unwrap();
        assert_eq!(state(&scheduler, d2.deployment_id), DeploymentState::Running);
        assert!(report
            .transitions
            .iter()
            .any(|t| t.deployment_id == d2.deployment_id && t.cluster_id == 2));
    }

    // ── Concurrency ────────────────────────────────────────────────

    #[tokio::test]
    async fn busy_when_cluster_lock_is_held() {
        let scheduler = scheduler_with_cpu(4);
        let guard = scheduler.lock_cluster(1, None).await.unwrap();

        let err = scheduler
            .submit_deployment(request(1, 1, 1), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Busy { cluster_id: 1, .. }));
        assert_eq!(err.kind(), crate::ErrorKind::Busy);
        assert!(scheduler.list_deployments(None).is_empty());

        drop(guard);
        submit(&scheduler, 1, 1).await;
    }

    #[tokio::test]
    async fn other_clusters_are_not_blocked() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        scheduler.register_cluster(cluster(1, Resources::new(4, 0, 0))).unwrap();
        scheduler.register_cluster(cluster(2, Resources::new(4, 0, 0))).unwrap();
        let _guard = scheduler.lock_cluster(1, None).await.unwrap();

        let outcome = scheduler
            .submit_deployment(request(2, 1, 1), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(outcome.state, DeploymentState::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_never_overcommit() {
        let scheduler = Arc::new(scheduler_with_cpu(16));

        let handles: Vec<_> = (0..64u64)
            .map(|i| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    scheduler
                        .submit_deployment(request(1, 1 + i % 5, (i % 7) as i64), None)
                        .await
                })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().deployment_id);
        }

        // Complete half of the running set concurrently.
        let running: Vec<_> = scheduler
            .get_cluster_status(1)
            .unwrap()
            .running
            .iter()
            .map(|d| d.id)
            .step_by(2)
            .collect();
        let handles: Vec<_> = running
            .into_iter()
            .map(|id| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.complete_deployment(id, None).await })
            })
            .collect();
        for handle in handles {
            // A freed slot may let queued work evict a deployment before
            // its own completion gets the lock.
            match handle.await.unwrap() {
                Ok(_) | Err(SchedulerError::InvalidTransition { .. }) => {}
                Err(e) => panic!("unexpected completion error: {e}"),
            }
        }

        scheduler.check_books(1).unwrap();
        let status = scheduler.get_cluster_status(1).unwrap();
        assert!(status.committed.fits_within(&status.total));
        assert_eq!(ids.len(), 64);
    }

    // ── Snapshot and persistence ───────────────────────────────────

    #[tokio::test]
    async fn status_lists_pending_in_queue_order() {
        let scheduler = scheduler_with_cpu(1);
        submit(&scheduler, 1, 50).await;
        let low = submit(&scheduler, 1, 1).await;
        let high = submit(&scheduler, 1, 10).await;

        let status = scheduler.get_cluster_status(1).unwrap();
        assert_eq!(status.running.len(), 1);
        let pending: Vec<_> = status.pending.iter().map(|d| d.id).collect();
        assert_eq!(pending, vec![high.deployment_id, low.deployment_id]);
        assert_eq!(status.available, Resources::ZERO);
    }

    #[tokio::test]
    async fn restore_rebuilds_books_and_queues() {
        let store = StateStore::open_in_memory().unwrap();
        let scheduler = Scheduler::new(SchedulerConfig::default()).with_store(store.clone());
        scheduler.register_cluster(cluster(1, Resources::new(4, 0, 0))).unwrap();

        let d1 = submit(&scheduler, 3, 1).await;
        let d2 = submit(&scheduler, 4, 5).await;
        let d3 = submit_after(&scheduler, 1, &[d2.deployment_id]).await;
        let before = scheduler.get_cluster_status(1).unwrap();

        let restored = Scheduler::restore(store, SchedulerConfig::default()).unwrap();
        let after = restored.get_cluster_status(1).unwrap();
        assert_eq!(after, before);
        restored.check_books(1).unwrap();
        assert_eq!(restored.get_deployment(d1.deployment_id).unwrap().preemptions, 1);

        // The restored graph still gates D3 on D2.
        restored.complete_deployment(d2.deployment_id, None).await.unwrap();
        assert_eq!(
            restored.get_deployment(d3.deployment_id).unwrap().state,
            DeploymentState::Running
        );
        let next = restored.submit_deployment(request(1, 1, 0), None).await.unwrap();
        assert!(next.deployment_id > d3.deployment_id);
    }

    #[tokio::test]
    async fn decisions_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capgrid.redb");

        let (running, queued) = {
            let store = StateStore::open(&path).unwrap();
            let scheduler = Scheduler::new(SchedulerConfig::default()).with_store(store);
            scheduler.register_cluster(cluster(1, Resources::new(2, 0, 0))).unwrap();
            let running = submit(&scheduler, 2, 1).await;
            let queued = submit(&scheduler, 2, 1).await;
            (running.deployment_id, queued.deployment_id)
        };

        let store = StateStore::open(&path).unwrap();
        let restored = Scheduler::restore(store, SchedulerConfig::default()).unwrap();
        assert_eq!(restored.list_clusters().len(), 1);
        assert_eq!(restored.get_deployment(running).unwrap().state, DeploymentState::Running);
        assert_eq!(restored.get_deployment(queued).unwrap().state, DeploymentState::Pending);
        assert_eq!(restored.get_cluster_status(1).unwrap().available, Resources::ZERO);
    }

    #[test]
    fn restore_rejects_overcommitted_snapshot() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_cluster(&cluster(1, Resources::new(4, 0, 0))).unwrap();
        for id in 1..=2 {
            store
                .put_deployments(&[DeploymentRecord {
                    id,
                    cluster_id: 1,
                    org_id: ORG,
                    name: "job".to_string(),
                    image: "busybox".to_string(),
                    resources: Resources::new(3, 0, 0),
                    priority: 0,
                    state: DeploymentState::Running,
                    created_tick: id,
                    submitted_at: 0,
                    preemptions: 0,
                    dependencies: Vec::new(),
                }])
                .unwrap();
        }

        let err = Scheduler::restore(store, SchedulerConfig::default()).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Integrity);
    }

    #[test]
    fn duplicate_cluster_is_rejected() {
        let scheduler = scheduler_with_cpu(4);
        let err = scheduler
            .register_cluster(cluster(1, Resources::new(8, 0, 0)))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateCluster(1)));
        assert_eq!(scheduler.list_clusters().len(), 1);
    }
}
