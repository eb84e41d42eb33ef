//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management with FIFO waiting
//! - Query execution on pooled or transaction-bound leases
//! - Transaction contexts and a registry for long-lived transactions
//! - The SQLite driver and its type mappings

pub mod connection;
pub mod executor;
pub mod pool;
pub mod sqlite;
pub mod transaction;
pub mod transaction_registry;
pub mod types;

pub use connection::{Connector, PhysicalConnection};
pub use executor::{ExecutionPhase, QueryExecutor};
pub use pool::{
    ConnectionId, Lease, LeaseState, Pool, PoolConfig, PoolMetrics, PoolStatus,
};
pub use sqlite::{SqliteConnector, SqliteSession};
pub use transaction::{TransactionContext, TransactionState};
pub use transaction_registry::{TransactionMetadata, TransactionRegistry};
