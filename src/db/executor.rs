//! Query execution engine.
//!
//! This module runs logical queries with support for:
//! - Caller-bound leases (transactions), which bypass the pool entirely
//! - Fresh leases from the pool, released on every exit path
//! - Per-statement timeouts
//!
//! One `execute` call moves through `Idle → Acquiring → Executing → Released`, or stops
//! at `Failed` when no connection could be acquired. A failed acquisition leaves nothing
//! behind in the pool, so the next call starts from a clean slate.

use crate::db::connection::{Connector, PhysicalConnection};
use crate::db::pool::{Lease, Pool};
use crate::db::transaction::TransactionContext;
use crate::error::{DbError, DbResult};
use crate::models::{
    DEFAULT_STATEMENT_TIMEOUT_SECS, LogicalQuery, MAX_STATEMENT_TIMEOUT_SECS, QueryOutput,
};
use std::fmt;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

/// Phase of a single `execute` call, reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Idle,
    Acquiring,
    Executing,
    Released,
    Failed,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Acquiring => write!(f, "acquiring"),
            Self::Executing => write!(f, "executing"),
            Self::Released => write!(f, "released"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Query executor that runs logical queries against a pool.
pub struct QueryExecutor<C: Connector> {
    pool: Pool<C>,
    acquire_timeout: Duration,
    statement_timeout: Duration,
}

impl<C: Connector> Clone for QueryExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            acquire_timeout: self.acquire_timeout,
            statement_timeout: self.statement_timeout,
        }
    }
}

impl<C: Connector> fmt::Debug for QueryExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("pool", &self.pool)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("statement_timeout", &self.statement_timeout)
            .finish()
    }
}

impl<C: Connector> QueryExecutor<C> {
    /// Create an executor using the pool's acquire timeout and the default statement timeout.
    pub fn new(pool: Pool<C>) -> Self {
        let acquire_timeout = pool.config().acquire_timeout;
        Self {
            pool,
            acquire_timeout,
            statement_timeout: Duration::from_secs(DEFAULT_STATEMENT_TIMEOUT_SECS),
        }
    }

    /// Create an executor with custom timeouts.
    pub fn with_timeouts(
        pool: Pool<C>,
        acquire_timeout: Duration,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            acquire_timeout,
            statement_timeout: statement_timeout
                .min(Duration::from_secs(MAX_STATEMENT_TIMEOUT_SECS)),
        }
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    /// Execute a logical query.
    ///
    /// With `bound` set, every statement runs on that lease and the pool is not touched.
    /// Otherwise a fresh lease is acquired and released again whether the statements
    /// succeed or fail. An acquisition timeout is reported as [`DbError::QueryTimeout`]
    /// and no statement runs.
    pub async fn execute(
        &self,
        query: &LogicalQuery,
        bound: Option<&mut Lease<C>>,
    ) -> DbResult<QueryOutput> {
        debug!(
            phase = %ExecutionPhase::Idle,
            statements = query.len(),
            bound = bound.is_some(),
            "Logical query received"
        );
        if query.is_empty() {
            return Err(DbError::invalid_input(
                "Logical query must contain at least one statement",
            ));
        }
        let start = Instant::now();

        if let Some(lease) = bound {
            debug!(
                phase = %ExecutionPhase::Executing,
                statements = query.len(),
                connection_id = ?lease.connection_id(),
                "Executing on bound lease"
            );
            return self.run_statements(lease, query, start).await;
        }

        debug!(
            phase = %ExecutionPhase::Acquiring,
            statements = query.len(),
            timeout_ms = self.acquire_timeout.as_millis() as u64,
            "Acquiring connection"
        );

        let mut lease = match self.pool.acquire_with_timeout(self.acquire_timeout).await {
            Ok(lease) => lease,
            Err(DbError::PoolTimeout(source)) => {
                warn!(
                    phase = %ExecutionPhase::Failed,
                    waited_ms = source.waited.as_millis() as u64,
                    premature = source.is_premature(),
                    "Query could not acquire a connection"
                );
                return Err(DbError::QueryTimeout { source });
            }
            Err(e) => {
                warn!(phase = %ExecutionPhase::Failed, error = %e, "Query could not acquire a connection");
                return Err(e);
            }
        };

        debug!(
            phase = %ExecutionPhase::Executing,
            connection_id = ?lease.connection_id(),
            "Executing on fresh lease"
        );
        let result = self.run_statements(&mut lease, query, start).await;
        lease.release();

        debug!(
            phase = %ExecutionPhase::Released,
            ok = result.is_ok(),
            execution_time_ms = start.elapsed().as_millis() as u64,
            "Logical query finished"
        );
        result
    }

    /// Execute a logical query inside an open transaction.
    pub async fn execute_in(
        &self,
        transaction: &mut TransactionContext<C>,
        query: &LogicalQuery,
    ) -> DbResult<QueryOutput> {
        let lease = transaction.lease_mut()?;
        self.execute(query, Some(lease)).await
    }

    /// Begin a transaction on this executor's pool.
    pub async fn begin(&self) -> DbResult<TransactionContext<C>> {
        TransactionContext::begin(&self.pool, self.acquire_timeout).await
    }

    async fn run_statements(
        &self,
        lease: &mut Lease<C>,
        query: &LogicalQuery,
        start: Instant,
    ) -> DbResult<QueryOutput> {
        let mut results = Vec::with_capacity(query.len());

        for (index, statement) in query.statements().iter().enumerate() {
            let connection = lease.connection_mut()?;
            let outcome = timeout(self.statement_timeout, connection.run(statement)).await;
            match outcome {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => {
                    debug!(index, sql = %statement.sql, error = %e, "Statement failed");
                    return Err(DbError::statement(index, e));
                }
                Err(_) => {
                    // The connection may still be mid-statement; it cannot be pooled.
                    lease.discard();
                    warn!(
                        index,
                        sql = %statement.sql,
                        timeout_secs = self.statement_timeout.as_secs(),
                        "Statement timed out, connection discarded"
                    );
                    return Err(DbError::timeout(
                        "statement execution",
                        self.statement_timeout.as_secs() as u32,
                    ));
                }
            }
        }

        Ok(QueryOutput {
            statements: results,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(ExecutionPhase::Idle.to_string(), "idle");
        assert_eq!(ExecutionPhase::Acquiring.to_string(), "acquiring");
        assert_eq!(ExecutionPhase::Failed.to_string(), "failed");
    }
}
