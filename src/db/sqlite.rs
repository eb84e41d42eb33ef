//! SQLite physical connections backed by `sqlx`.

use crate::db::connection::{Connector, PhysicalConnection};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, Statement, StatementKind, StatementResult};
use futures_util::TryStreamExt;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Connection, Sqlite};
use std::str::FromStr;
use tracing::debug;

/// Opens [`SqliteSession`]s from a fixed set of connect options.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    options: SqliteConnectOptions,
    decode_binary: bool,
}

impl SqliteConnector {
    pub fn new(options: SqliteConnectOptions) -> Self {
        Self {
            options,
            decode_binary: false,
        }
    }

    /// Parse a `sqlite:` URL, e.g. `sqlite::memory:` or `sqlite:data.db?mode=rwc`.
    pub fn from_url(url: &str) -> DbResult<Self> {
        const URL_HINT: &str =
            "Check the connection URL format: sqlite:path/to/db.sqlite or sqlite::memory:";

        // sqlx treats anything without a `sqlite:` prefix as a bare filename.
        if !url.starts_with("sqlite:") {
            return Err(DbError::connection(
                "Invalid SQLite connection string: expected a sqlite: URL",
                URL_HINT,
            ));
        }
        let options = SqliteConnectOptions::from_str(url).map_err(|e| {
            DbError::connection(format!("Invalid SQLite connection string: {}", e), URL_HINT)
        })?;
        Ok(Self::new(options))
    }

    /// Render valid UTF-8 blobs as text instead of base64.
    pub fn decode_binary(mut self, decode_binary: bool) -> Self {
        self.decode_binary = decode_binary;
        self
    }
}

impl Connector for SqliteConnector {
    type Connection = SqliteSession;

    async fn connect(&self) -> DbResult<SqliteSession> {
        let conn = self.options.connect().await.map_err(|e| {
            DbError::connection(
                format!("Failed to connect: {}", e),
                "Verify the file path exists and is accessible: sqlite:path/to/db.sqlite",
            )
        })?;
        debug!("Opened SQLite connection");
        Ok(SqliteSession {
            conn,
            decode_binary: self.decode_binary,
        })
    }
}

/// One open SQLite connection.
#[derive(Debug)]
pub struct SqliteSession {
    conn: SqliteConnection,
    decode_binary: bool,
}

impl PhysicalConnection for SqliteSession {
    async fn run(&mut self, statement: &Statement) -> DbResult<StatementResult> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = bind_param(query, param);
        }

        match statement.kind {
            StatementKind::Fetch => {
                let rows: Vec<SqliteRow> = query.fetch(&mut self.conn).try_collect().await?;
                Ok(StatementResult::from_rows(
                    rows.iter()
                        .map(|r| r.to_json_map_with_options(self.decode_binary))
                        .collect(),
                ))
            }
            StatementKind::Execute => {
                let result = query.execute(&mut self.conn).await?;
                Ok(StatementResult::from_rows_affected(result.rows_affected()))
            }
        }
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.conn.ping().await.map_err(DbError::from)
    }

    async fn close(self) -> DbResult<()> {
        self.conn.close().await.map_err(DbError::from)
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        // SQLite doesn't have native JSON type, store as string
        QueryParam::Json(v) => query.bind(v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_accepts_memory() {
        assert!(SqliteConnector::from_url("sqlite::memory:").is_ok());
    }

    #[test]
    fn test_from_url_rejects_other_schemes() {
        for url in ["postgres://localhost/db", "mysql://localhost/db", "data.db"] {
            let err = SqliteConnector::from_url(url).unwrap_err();
            assert!(matches!(err, DbError::Connection { .. }), "{url}");
        }
    }
}
