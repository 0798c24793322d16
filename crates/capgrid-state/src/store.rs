//! StateStore — redb-backed state persistence for capgrid.
//!
//! Provides typed writes and scans over clusters, deployments and
//! dependency edges.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(DEPENDENCY_EDGES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert or update a cluster spec.
    pub fn put_cluster(&self, cluster: &ClusterSpec) -> StateResult<()> {
        self.put_all(CLUSTERS, || vec![(cluster.table_key(), cluster)])?;
        debug!(cluster_id = cluster.id, "cluster stored");
        Ok(())
    }

    /// List all clusters in id order.
    pub fn list_clusters(&self) -> StateResult<Vec<ClusterSpec>> {
        self.scan_json(CLUSTERS)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update several deployment records in one transaction.
    pub fn put_deployments(&self, records: &[DeploymentRecord]) -> StateResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.put_all(DEPLOYMENTS, || records.iter().map(|r| (r.table_key(), r)).collect())?;
        debug!(count = records.len(), "deployments stored");
        Ok(())
    }

    /// Insert or update the records returned by `collect`.
    ///
    /// `collect` runs inside the write transaction. redb admits one writer
    /// at a time, so of two racing calls the one that commits last also
    /// observed the newer in-memory state.
    pub fn put_deployments_with<F>(&self, collect: F) -> StateResult<usize>
    where
        F: FnOnce() -> Vec<DeploymentRecord>,
    {
        let count = self.put_all(DEPLOYMENTS, || {
            collect().into_iter().map(|r| (r.table_key(), r)).collect()
        })?;
        debug!(count, "deployments stored");
        Ok(count)
    }

    /// List all deployments in id order.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        self.scan_json(DEPLOYMENTS)
    }

    // ── Dependency edges ───────────────────────────────────────────

    /// Record a dependency edge.
    pub fn put_edge(&self, edge: &DependencyEdge) -> StateResult<()> {
        self.put_all(DEPENDENCY_EDGES, || vec![(edge.table_key(), edge)])?;
        Ok(())
    }

    pub fn list_edges(&self) -> StateResult<Vec<DependencyEdge>> {
        self.scan_json(DEPENDENCY_EDGES)
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// Write the entries produced by `entries` in one transaction.
    /// Returns how many were written.
    fn put_all<T, F>(&self, table_def: JsonTable, entries: F) -> StateResult<usize>
    where
        T: Serialize,
        F: FnOnce() -> Vec<(String, T)>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let encoded = entries()
            .into_iter()
            .map(|(key, value)| {
                serde_json::to_vec(&value)
                    .map(|bytes| (key, bytes))
                    .map_err(map_err!(Serialize))
            })
            .collect::<StateResult<Vec<_>>>()?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            for (key, value) in &encoded {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(encoded.len())
    }

    /// Read every value of a table in key order.
    fn scan_json<T: DeserializeOwned>(&self, table_def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }
}
