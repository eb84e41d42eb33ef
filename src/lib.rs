//! Lease-based connection pooling and query execution.
//!
//! A fixed-capacity [`Pool`](db::Pool) hands out exclusive [`Lease`](db::Lease)s in FIFO
//! order with absolute deadlines. The [`QueryExecutor`](db::QueryExecutor) runs multi-statement
//! logical queries on them, and [`TransactionContext`](db::TransactionContext) keeps one lease
//! across several queries.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod scenario;

pub use config::Config;
pub use error::{DbError, DbResult, ErrorPhase, PoolTimeout};
