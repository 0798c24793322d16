//! redb table definitions for the capgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Ids are zero-padded so key order matches id order.

use redb::TableDefinition;

/// Cluster specs keyed by `{cluster_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Deployment records keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Dependency edges keyed by `{dependent}:{dependency}`.
pub const DEPENDENCY_EDGES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("dependency_edges");
