//! Data models for logical queries and their results.

pub mod query;

pub use query::{
    DEFAULT_STATEMENT_TIMEOUT_SECS, LogicalQuery, MAX_STATEMENT_TIMEOUT_SECS, QueryOutput,
    QueryParam, Statement, StatementKind, StatementResult,
};
