//! capgrid-scheduler — multi-tenant admission and priority preemption.
//!
//! Decides which deployments run on which cluster. The scheduler:
//!
//! - Keeps per-cluster capacity books that never over-commit
//! - Tracks every deployment's lifecycle behind compare-and-set transitions
//! - Holds deployments back until their dependencies have completed, and
//!   fails them when a dependency fails or is cancelled
//! - Admits the highest-priority ready work first, evicting strictly
//!   lower-priority deployments when that is the only way to make room
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── ResourceLedger     (total / committed per cluster)
//!   ├── DeploymentRegistry (records, ids, ticks, CAS transitions)
//!   ├── DependencyGraph    (acyclic "completes before" edges)
//!   ├── per-cluster lock   (FIFO, bounded wait → Busy)
//!   └── StateStore         (optional mirror of every decision)
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod ledger;
pub mod preemption;
pub mod registry;
pub mod report;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use error::{ErrorKind, GraphError, LedgerError, RegistryError, SchedulerError, SchedulerResult};
pub use graph::DependencyGraph;
pub use ledger::{LedgerSnapshot, ResourceLedger};
pub use preemption::{Eviction, RunningState, select_victims};
pub use registry::{DeploymentRegistry, NewDeployment};
pub use report::{Cause, ClusterStatus, ScheduleReport, SubmitOutcome, Transition};
pub use scheduler::{Scheduler, SubmitRequest};
