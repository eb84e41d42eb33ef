//! Error types for the lease pool and query execution core.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Every variant belongs to exactly one [`ErrorPhase`], so a caller can always tell an
//! acquisition failure apart from a statement failure.

use crate::db::transaction::TransactionState;
use std::time::Duration;
use thiserror::Error;

/// A queued pool acquisition whose deadline elapsed before a connection was handed to it.
///
/// `waited` is measured from the moment the request was enqueued; `timeout` is the wait
/// budget the deadline was computed from. A genuine timeout always has `waited >= timeout`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no connection became available after {}ms (budget {}ms)", .waited.as_millis(), .timeout.as_millis())]
pub struct PoolTimeout {
    pub waited: Duration,
    pub timeout: Duration,
}

impl PoolTimeout {
    /// True when the request failed before its budget could have elapsed.
    ///
    /// This never happens for a healthy pool; it indicates corrupted wait-queue bookkeeping.
    pub fn is_premature(&self) -> bool {
        self.waited < self.timeout
    }
}

/// Which phase of a request produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPhase {
    /// Waiting for or opening a pooled connection.
    Acquire,
    /// Running statements on a leased connection.
    Execute,
    /// Transaction bookkeeping (begin/commit/rollback state).
    Transaction,
    Other,
}

impl std::fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acquire => write!(f, "acquire"),
            Self::Execute => write!(f, "execute"),
            Self::Transaction => write!(f, "transaction"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Pool timeout: {0}")]
    PoolTimeout(#[from] PoolTimeout),

    #[error("Query timed out waiting for a connection: {source}")]
    QueryTimeout {
        #[source]
        source: PoolTimeout,
    },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "SQLITE_ERROR" or a SQLSTATE such as "42P01"
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Statement {index} failed: {source}")]
    Statement {
        /// Zero-based position of the failing statement within its logical query.
        index: usize,
        #[source]
        source: Box<DbError>,
    },

    #[error("Invalid transaction state: cannot {operation} transaction {transaction_id} (state: {state})")]
    InvalidTransactionState {
        transaction_id: String,
        state: TransactionState,
        operation: String,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Wrap a driver error with the index of the statement that produced it.
    pub fn statement(index: usize, source: DbError) -> Self {
        Self::Statement {
            index,
            source: Box::new(source),
        }
    }

    pub fn invalid_transaction_state(
        transaction_id: impl Into<String>,
        state: TransactionState,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidTransactionState {
            transaction_id: transaction_id.into(),
            state,
            operation: operation.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The phase of the request that failed.
    pub fn phase(&self) -> ErrorPhase {
        match self {
            Self::PoolTimeout(_)
            | Self::QueryTimeout { .. }
            | Self::PoolClosed
            | Self::Connection { .. } => ErrorPhase::Acquire,
            Self::Database { .. } | Self::Statement { .. } | Self::Timeout { .. } => {
                ErrorPhase::Execute
            }
            Self::InvalidTransactionState { .. } | Self::Transaction { .. } => {
                ErrorPhase::Transaction
            }
            Self::InvalidInput { .. } | Self::Internal { .. } => ErrorPhase::Other,
        }
    }

    /// The pool timeout behind this error, if it is one.
    pub fn pool_timeout(&self) -> Option<&PoolTimeout> {
        match self {
            Self::PoolTimeout(timeout) | Self::QueryTimeout { source: timeout } => Some(timeout),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::Statement { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Advisory only: nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::PoolTimeout(_)
                | Self::QueryTimeout { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("driver pool acquire", 0),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check that the database file is accessible",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database driver compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
