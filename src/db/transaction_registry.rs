//! Transaction registry for transactions that outlive a single call.
//!
//! Each registered transaction owns a [`TransactionContext`], and therefore a dedicated
//! pooled connection, until it is committed, rolled back or expires.

use crate::db::connection::Connector;
use crate::db::executor::QueryExecutor;
use crate::db::pool::ConnectionId;
use crate::db::transaction::TransactionContext;
use crate::error::{DbError, DbResult};
use crate::models::{LogicalQuery, QueryOutput};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default transaction timeout in seconds.
pub const DEFAULT_TRANSACTION_TIMEOUT_SECS: u32 = 60;

/// Maximum transaction timeout in seconds.
pub const MAX_TRANSACTION_TIMEOUT_SECS: u32 = 300;

/// Cleanup interval for expired transactions.
const CLEANUP_INTERVAL_SECS: u64 = 5;

struct ActiveTransaction<C: Connector> {
    context: TransactionContext<C>,
    created_at: Instant,
    timeout_secs: u32,
}

impl<C: Connector> ActiveTransaction<C> {
    /// Check if the transaction has expired.
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > Duration::from_secs(self.timeout_secs as u64)
    }
}

/// Metadata about an active transaction (for listing without consuming).
#[derive(Debug, Clone)]
pub struct TransactionMetadata {
    /// Unique transaction identifier
    pub transaction_id: String,
    /// Pooled connection the transaction is bound to
    pub connection_id: Option<ConnectionId>,
    /// When the transaction started (absolute time)
    pub started_at: DateTime<Utc>,
    /// Seconds since transaction started
    pub duration_secs: u64,
    /// Configured timeout for this transaction
    pub timeout_secs: u32,
}

pub struct TransactionRegistry<C: Connector> {
    executor: QueryExecutor<C>,
    transactions: Arc<Mutex<HashMap<String, ActiveTransaction<C>>>>,
    /// System start time for converting Instant to DateTime
    system_start_instant: Instant,
    /// System start time as UTC DateTime
    system_start_datetime: DateTime<Utc>,
}

impl<C: Connector> Clone for TransactionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            transactions: Arc::clone(&self.transactions),
            system_start_instant: self.system_start_instant,
            system_start_datetime: self.system_start_datetime,
        }
    }
}

impl<C: Connector> TransactionRegistry<C> {
    /// Create a new transaction registry running on `executor`'s pool.
    pub fn new(executor: QueryExecutor<C>) -> Self {
        Self {
            executor,
            transactions: Arc::new(Mutex::new(HashMap::new())),
            system_start_instant: Instant::now(),
            system_start_datetime: Utc::now(),
        }
    }

    /// List all active transactions with their metadata.
    pub async fn list_all(&self) -> Vec<TransactionMetadata> {
        let txs = self.transactions.lock().await;
        txs.iter()
            .map(|(id, entry)| {
                let duration_secs = entry.created_at.elapsed().as_secs();
                // Convert Instant to DateTime by calculating offset from system start
                let offset_from_start = entry.created_at.duration_since(self.system_start_instant);
                let started_at = self.system_start_datetime + offset_from_start;

                TransactionMetadata {
                    transaction_id: id.clone(),
                    connection_id: entry.context.connection_id(),
                    started_at,
                    duration_secs,
                    timeout_secs: entry.timeout_secs,
                }
            })
            .collect()
    }

    /// Start a background task to clean up expired transactions.
    ///
    /// This should be called once at startup.
    pub fn start_cleanup_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                self.cleanup_expired().await;
            }
        });
    }

    /// Begin a new transaction and register it.
    pub async fn begin(&self, timeout_secs: Option<u32>) -> DbResult<String> {
        let timeout_secs = timeout_secs
            .map(|t| t.min(MAX_TRANSACTION_TIMEOUT_SECS))
            .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT_SECS);

        let context = self.executor.begin().await?;
        let transaction_id = context.id().to_string();

        let entry = ActiveTransaction {
            context,
            created_at: Instant::now(),
            timeout_secs,
        };

        {
            let mut txs = self.transactions.lock().await;
            txs.insert(transaction_id.clone(), entry);
        }

        info!(
            transaction_id = %transaction_id,
            timeout_secs = timeout_secs,
            "Transaction registered"
        );

        Ok(transaction_id)
    }

    /// Run a logical query inside a registered transaction.
    pub async fn execute(
        &self,
        transaction_id: &str,
        query: &LogicalQuery,
    ) -> DbResult<QueryOutput> {
        let mut txs = self.transactions.lock().await;
        let entry = txs
            .get_mut(transaction_id)
            .ok_or_else(|| DbError::transaction("Transaction not found", transaction_id))?;

        if entry.is_expired() {
            return Err(DbError::transaction(
                "Transaction has expired",
                transaction_id,
            ));
        }

        let output = self.executor.execute_in(&mut entry.context, query).await?;

        debug!(
            transaction_id = %transaction_id,
            statements = query.len(),
            "Executed in transaction"
        );

        Ok(output)
    }

    /// Commit a transaction.
    pub async fn commit(&self, transaction_id: &str) -> DbResult<()> {
        let mut entry = self.take(transaction_id).await?;
        entry.context.commit().await
    }

    /// Rollback a transaction.
    pub async fn rollback(&self, transaction_id: &str) -> DbResult<()> {
        let mut entry = self.take(transaction_id).await?;
        entry.context.rollback().await
    }

    async fn take(&self, transaction_id: &str) -> DbResult<ActiveTransaction<C>> {
        let mut txs = self.transactions.lock().await;
        txs.remove(transaction_id)
            .ok_or_else(|| DbError::transaction("Transaction not found", transaction_id))
    }

    /// Roll back and remove expired transactions, returning how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<ActiveTransaction<C>> = {
            let mut txs = self.transactions.lock().await;
            let expired_ids: Vec<String> = txs
                .iter()
                .filter(|(_, entry)| entry.is_expired())
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids
                .iter()
                .filter_map(|id| txs.remove(id))
                .collect()
        };

        let count = expired.len();
        for mut entry in expired {
            warn!(
                transaction_id = %entry.context.id(),
                connection_id = ?entry.context.connection_id(),
                "Rolling back expired transaction"
            );
            // Best effort rollback; a failure discards the connection
            let _ = entry.context.rollback().await;
        }
        count
    }

    /// Get the number of active transactions.
    pub async fn count(&self) -> usize {
        let txs = self.transactions.lock().await;
        txs.len()
    }
}
