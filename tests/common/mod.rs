//! In-memory connector used by the integration tests.
//!
//! Statements understood by [`MockConnection`]:
//! - `SLEEP <ms>` waits on the tokio clock
//! - `FAIL` returns a database error
//! - `SET <key>=<value>` / `GET <key>` keep per-connection session state
//! - `CONN` returns the mock connection number
//! - `COMMIT` fails while [`MockState::fail_commit`] is set
//! - anything else succeeds with zero rows affected

#![allow(dead_code)]

use db_lease_pool::db::{Connector, PhysicalConnection, Pool, PoolConfig};
use db_lease_pool::error::{DbError, DbResult};
use db_lease_pool::models::{Statement, StatementResult};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MockState {
    pub opened: AtomicU64,
    pub closed: AtomicU64,
    pub fail_connect: AtomicBool,
    pub fail_commit: AtomicBool,
    /// Every statement run, prefixed with the connection number.
    pub log: Mutex<Vec<String>>,
}

impl MockState {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self) -> DbResult<MockConnection> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::connection("mock refused", "try again"));
        }
        let number = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConnection {
            number,
            session: HashMap::new(),
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub struct MockConnection {
    number: u64,
    session: HashMap<String, String>,
    state: Arc<MockState>,
}

fn single_row(key: &str, value: Value) -> StatementResult {
    let mut row = Map::new();
    row.insert(key.to_string(), value);
    StatementResult::from_rows(vec![row])
}

impl PhysicalConnection for MockConnection {
    async fn run(&mut self, statement: &Statement) -> DbResult<StatementResult> {
        let sql = statement.sql.trim();
        self.state.log.lock().push(format!("{}:{}", self.number, sql));

        if let Some(ms) = sql.strip_prefix("SLEEP ") {
            let ms: u64 = ms
                .parse()
                .map_err(|_| DbError::invalid_input("bad sleep"))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(StatementResult::from_rows_affected(0));
        }
        if sql == "FAIL" || (sql == "COMMIT" && self.state.fail_commit.load(Ordering::SeqCst)) {
            return Err(DbError::database(
                "mock statement failed",
                Some("MOCK".to_string()),
                "none",
            ));
        }
        if let Some(assignment) = sql.strip_prefix("SET ") {
            if let Some((key, value)) = assignment.split_once('=') {
                self.session.insert(key.to_string(), value.to_string());
            }
            return Ok(StatementResult::from_rows_affected(1));
        }
        if let Some(key) = sql.strip_prefix("GET ") {
            let value = self
                .session
                .get(key)
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null);
            return Ok(single_row(key, value));
        }
        if sql == "CONN" {
            return Ok(single_row("conn", Value::from(self.number)));
        }
        Ok(StatementResult::from_rows_affected(0))
    }

    async fn ping(&mut self) -> DbResult<()> {
        Ok(())
    }

    async fn close(self) -> DbResult<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn mock_pool(max_connections: u32, acquire_timeout_ms: u64) -> (Pool<MockConnector>, Arc<MockState>) {
    let connector = MockConnector::default();
    let state = Arc::clone(&connector.state);
    let pool = Pool::new(
        connector,
        PoolConfig::new(max_connections, Duration::from_millis(acquire_timeout_ms)),
    )
    .unwrap();
    (pool, state)
}

/// Let spawned tasks and pending wakeups run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
