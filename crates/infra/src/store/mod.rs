//! Work item persistence.
//!
//! This module provides the **work store abstraction** plus two implementations: an
//! in-memory store for tests and single-process deployments, and a Postgres store for
//! multi-process deployments.
//!
//! ## Design
//!
//! - Status is never stored; selectors filter on the derived status
//! - One linearizable primitive (`allocate_atomic`); other writes are guarded updates
//! - Retention is a hard delete by creation time, independent of status

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryWorkStore;
pub use postgres::PostgresWorkStore;
pub use query::{Pagination, WorkQuery, WorkStats};
pub use r#trait::{
    Allocation, StoreError, WorkPatch, WorkSelector, WorkSort, WorkStore, WorkerFilter,
};
