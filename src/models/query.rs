//! Query-related data models.
//!
//! This module defines logical queries (ordered statement sequences that must run on
//! one physical connection) and their results.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default statement timeout in seconds.
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;

/// Maximum statement timeout in seconds.
pub const MAX_STATEMENT_TIMEOUT_SECS: u64 = 300;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arbitrary JSON, bound as its serialized text
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Whether a statement produces rows or only a rows-affected count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Fetch,
    Execute,
}

/// One physical statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
    pub kind: StatementKind,
}

impl Statement {
    /// A statement whose rows are returned.
    pub fn fetch(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            kind: StatementKind::Fetch,
        }
    }

    /// A statement whose rows-affected count is returned.
    pub fn execute(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            kind: StatementKind::Execute,
        }
    }

    /// Add a parameter to this statement.
    pub fn bind(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }
}

/// An ordered sequence of statements that runs entirely on one physical connection.
///
/// Later statements may depend on session state (temporary tables, pragmas) set up by
/// earlier ones, so the whole sequence always shares a single lease. No statement is
/// treated specially: a metadata lookup is just another entry in the sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicalQuery {
    statements: Vec<Statement>,
}

impl LogicalQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// A logical query made of a single statement.
    pub fn single(statement: Statement) -> Self {
        Self {
            statements: vec![statement],
        }
    }

    /// Append a statement.
    pub fn then(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

impl From<Statement> for LogicalQuery {
    fn from(statement: Statement) -> Self {
        Self::single(statement)
    }
}

impl FromIterator<Statement> for LogicalQuery {
    fn from_iter<I: IntoIterator<Item = Statement>>(iter: I) -> Self {
        Self {
            statements: iter.into_iter().collect(),
        }
    }
}

/// Result of a single statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatementResult {
    pub rows: Vec<serde_json::Map<String, JsonValue>>,
    /// Present for [`StatementKind::Execute`] statements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

impl StatementResult {
    pub fn from_rows(rows: Vec<serde_json::Map<String, JsonValue>>) -> Self {
        Self {
            rows,
            rows_affected: None,
        }
    }

    pub fn from_rows_affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected: Some(rows_affected),
        }
    }
}

/// Result of a whole logical query, one entry per statement in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutput {
    pub statements: Vec<StatementResult>,
    pub execution_time_ms: u64,
}

impl QueryOutput {
    /// The result of the last statement, conventionally the main one.
    pub fn last(&self) -> Option<&StatementResult> {
        self.statements.last()
    }

    /// Rows of the last statement, or an empty slice.
    pub fn rows(&self) -> &[serde_json::Map<String, JsonValue>] {
        self.last().map(|r| r.rows.as_slice()).unwrap_or(&[])
    }
}
