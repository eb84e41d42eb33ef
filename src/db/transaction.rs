//! Transaction contexts.
//!
//! A [`TransactionContext`] holds one lease for its whole open lifetime. The lease is
//! pinned, so releases routed through it (for example by the query executor) leave the
//! connection outside the pool until `commit` or `rollback`.

use crate::db::connection::{Connector, PhysicalConnection};
use crate::db::pool::{ConnectionId, Lease, Pool};
use crate::error::{DbError, DbResult};
use crate::models::Statement;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Lifecycle of a [`TransactionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// A lease held across several logical queries until commit or rollback.
///
/// Dropping an open context discards its connection: the transaction cannot be rolled
/// back without an `.await`, and a connection with an open transaction must never be
/// pooled.
pub struct TransactionContext<C: Connector> {
    id: String,
    lease: Lease<C>,
    state: TransactionState,
    started_at: Instant,
}

impl<C: Connector> fmt::Debug for TransactionContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("lease", &self.lease)
            .finish()
    }
}

impl<C: Connector> TransactionContext<C> {
    /// Acquire a connection (waiting at most `timeout`) and begin a transaction on it.
    pub async fn begin(pool: &Pool<C>, timeout: Duration) -> DbResult<Self> {
        let mut lease = pool.acquire_with_timeout(timeout).await?;
        // On failure the lease drops unpinned and goes straight back to the pool.
        lease
            .connection_mut()?
            .run(&Statement::execute("BEGIN"))
            .await?;
        lease.pin();

        let id = generate_transaction_id();
        info!(
            transaction_id = %id,
            connection_id = ?lease.connection_id(),
            "Transaction started"
        );

        Ok(Self {
            id,
            lease,
            state: TransactionState::Open,
            started_at: Instant::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state. An open transaction whose connection was discarded (for example
    /// after a statement timeout) reports `RolledBack`: closing the connection aborted it.
    pub fn state(&self) -> TransactionState {
        if self.state == TransactionState::Open && !self.lease.is_active() {
            TransactionState::RolledBack
        } else {
            self.state
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransactionState::Open
    }

    /// Time since the transaction began.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.lease.connection_id()
    }

    /// The pinned lease, for routing queries through this transaction.
    pub fn lease_mut(&mut self) -> DbResult<&mut Lease<C>> {
        self.ensure_open("use")?;
        Ok(&mut self.lease)
    }

    /// Commit and return the connection to the pool.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.finish(TransactionState::Committed, "COMMIT", "commit")
            .await
    }

    /// Roll back and return the connection to the pool.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.finish(TransactionState::RolledBack, "ROLLBACK", "roll back")
            .await
    }

    fn ensure_open(&mut self, operation: &str) -> DbResult<()> {
        if self.state == TransactionState::Open && !self.lease.is_active() {
            warn!(
                transaction_id = %self.id,
                "Transaction connection was discarded, treating it as rolled back"
            );
            self.state = TransactionState::RolledBack;
        }
        if self.state != TransactionState::Open {
            return Err(DbError::invalid_transaction_state(
                &self.id, self.state, operation,
            ));
        }
        Ok(())
    }

    async fn finish(
        &mut self,
        terminal: TransactionState,
        sql: &str,
        operation: &str,
    ) -> DbResult<()> {
        self.ensure_open(operation)?;

        let outcome = self
            .lease
            .connection_mut()?
            .run(&Statement::execute(sql))
            .await
            .map(|_| ());

        self.lease.unpin();
        match &outcome {
            Ok(()) => {
                self.state = terminal;
                self.lease.release();
                info!(
                    transaction_id = %self.id,
                    duration_ms = self.elapsed().as_millis() as u64,
                    "Transaction {}",
                    terminal
                );
            }
            Err(e) => {
                // The session state is unknown after a failed COMMIT/ROLLBACK. Closing the
                // connection aborts whatever the server still holds open.
                self.state = TransactionState::RolledBack;
                self.lease.discard();
                warn!(
                    transaction_id = %self.id,
                    error = %e,
                    "Failed to {} transaction, connection discarded",
                    operation
                );
            }
        }
        outcome
    }
}

impl<C: Connector> Drop for TransactionContext<C> {
    fn drop(&mut self) {
        if self.is_open() && self.lease.is_active() {
            warn!(
                transaction_id = %self.id,
                "Open transaction dropped, discarding its connection"
            );
            self.lease.discard();
        }
    }
}

/// Generate a unique transaction ID.
pub(crate) fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32); // "tx_" + 32 hex chars
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TransactionState::Open.to_string(), "open");
        assert_eq!(TransactionState::RolledBack.to_string(), "rolled back");
    }
}
