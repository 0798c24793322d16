//! capgrid-state — domain types and embedded state store for capgrid.
//!
//! Backed by [redb](https://docs.rs/redb), persists the three tables the
//! scheduler consumes as its contract with the outside world: cluster
//! capacities, deployment records (including the lifecycle state column)
//! and dependency edges.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Keys are zero-padded ids (`{id}`, `{dependent}:{dependency}`) so that
//! iteration order follows id order and edge lookups are prefix scans.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{NegativeResource, StateError, StateResult};
pub use store::StateStore;
pub use types::*;
