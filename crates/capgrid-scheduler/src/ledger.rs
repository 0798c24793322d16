//! Resource ledger — committed vs. available capacity per cluster.
//!
//! Pure bookkeeping: the ledger never decides who runs. It trusts the
//! scheduler to pair each `reserve` with exactly one `release` per
//! RUNNING interval, and refuses any operation that would leave a book
//! over-committed or negative.

use std::collections::HashMap;
use std::sync::RwLock;

use capgrid_state::{ClusterId, Resources};
use serde::Serialize;
use tracing::debug;

use crate::error::LedgerError;

/// Point-in-time view of one cluster's book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub total: Resources,
    pub committed: Resources,
    pub available: Resources,
}

#[derive(Debug, Clone, Copy)]
struct Book {
    total: Resources,
    committed: Resources,
}

impl Book {
    fn available(&self) -> Resources {
        self.total.saturating_sub(&self.committed)
    }
}

/// Per-cluster capacity books.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    books: RwLock<HashMap<ClusterId, Book>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a book for a cluster with nothing committed.
    pub fn register(&self, cluster: ClusterId, total: Resources) -> Result<(), LedgerError> {
        let mut books = self.books.write().expect("ledger lock");
        if books.contains_key(&cluster) {
            return Err(LedgerError::DuplicateCluster(cluster));
        }
        books.insert(
            cluster,
            Book {
                total,
                committed: Resources::ZERO,
            },
        );
        debug!(cluster_id = cluster, %total, "ledger book opened");
        Ok(())
    }

    pub fn contains(&self, cluster: ClusterId) -> bool {
        self.books.read().expect("ledger lock").contains_key(&cluster)
    }

    /// Commit `amounts` on `cluster`.
    ///
    /// All-or-nothing: if any dimension would exceed the total, nothing
    /// is committed.
    pub fn reserve(&self, cluster: ClusterId, amounts: &Resources) -> Result<(), LedgerError> {
        let mut books = self.books.write().expect("ledger lock");
        let book = books
            .get_mut(&cluster)
            .ok_or(LedgerError::UnknownCluster(cluster))?;

        let committed = book
            .committed
            .checked_add(amounts)
            .filter(|next| next.fits_within(&book.total))
            .ok_or(LedgerError::InsufficientCapacity {
                cluster,
                requested: *amounts,
                available: book.available(),
            })?;

        book.committed = committed;
        debug!(cluster_id = cluster, %amounts, "reserved");
        Ok(())
    }

    /// Return `amounts` to `cluster`.
    ///
    /// Refuses (and changes nothing) if more would be released than is
    /// committed; that only happens on a double release.
    pub fn release(&self, cluster: ClusterId, amounts: &Resources) -> Result<(), LedgerError> {
        let mut books = self.books.write().expect("ledger lock");
        let book = books
            .get_mut(&cluster)
            .ok_or(LedgerError::UnknownCluster(cluster))?;

        book.committed = book
            .committed
            .checked_sub(amounts)
            .ok_or(LedgerError::ReleaseUnderflow {
                cluster,
                released: *amounts,
                committed: book.committed,
            })?;
        debug!(cluster_id = cluster, %amounts, "released");
        Ok(())
    }

    pub fn available(&self, cluster: ClusterId) -> Result<Resources, LedgerError> {
        Ok(self.snapshot(cluster)?.available)
    }

    pub fn total(&self, cluster: ClusterId) -> Result<Resources, LedgerError> {
        Ok(self.snapshot(cluster)?.total)
    }

    pub fn committed(&self, cluster: ClusterId) -> Result<Resources, LedgerError> {
        Ok(self.snapshot(cluster)?.committed)
    }

    pub fn snapshot(&self, cluster: ClusterId) -> Result<LedgerSnapshot, LedgerError> {
        let books = self.books.read().expect("ledger lock");
        let book = books
            .get(&cluster)
            .ok_or(LedgerError::UnknownCluster(cluster))?;
        Ok(LedgerSnapshot {
            total: book.total,
            committed: book.committed,
            available: book.available(),
        })
    }
}
