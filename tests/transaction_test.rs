//! Integration tests for transaction contexts and the transaction registry.

mod common;

use common::{MockConnector, mock_pool, settle};
use db_lease_pool::db::{QueryExecutor, TransactionRegistry, TransactionState};
use db_lease_pool::error::DbError;
use db_lease_pool::models::{LogicalQuery, Statement};
use std::time::Duration;

fn query(sql: &str) -> LogicalQuery {
    LogicalQuery::single(Statement::fetch(sql))
}

#[tokio::test(start_paused = true)]
async fn test_transaction_keeps_one_connection() {
    let (pool, state) = mock_pool(2, 2000);
    let executor = QueryExecutor::new(pool.clone());

    let mut tx = executor.begin().await.unwrap();
    assert!(tx.is_open());
    assert_eq!(pool.status().in_use, 1);

    executor.execute_in(&mut tx, &query("SET owner=tx")).await.unwrap();
    let output = executor.execute_in(&mut tx, &query("GET owner")).await.unwrap();
    assert_eq!(output.rows()[0]["owner"], "tx");

    // Executing through the transaction never hands the connection back.
    assert_eq!(pool.status().in_use, 1);
    assert_eq!(pool.status().idle, 0);

    // Other work gets a different connection.
    let other = executor.execute(&query("CONN"), None).await.unwrap();
    assert_eq!(other.rows()[0]["conn"], 2);

    tx.commit().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(pool.status().idle, 2);

    let log = state.log();
    assert_eq!(log.first().map(String::as_str), Some("1:BEGIN"));
    assert!(log.contains(&"1:COMMIT".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_commit_twice_is_invalid() {
    let (pool, _) = mock_pool(1, 2000);
    let executor = QueryExecutor::new(pool.clone());

    let mut tx = executor.begin().await.unwrap();
    tx.commit().await.unwrap();

    let err = tx.commit().await.unwrap_err();
    match err {
        DbError::InvalidTransactionState { state, .. } => {
            assert_eq!(state, TransactionState::Committed)
        }
        other => panic!("expected InvalidTransactionState, got {other:?}"),
    }
    assert!(matches!(
        tx.rollback().await,
        Err(DbError::InvalidTransactionState { .. })
    ));
    // The connection was released exactly once.
    assert_eq!(pool.status().idle, 1);
    assert_eq!(pool.status().size, 1);
}

#[tokio::test(start_paused = true)]
async fn test_execute_after_rollback_is_invalid() {
    let (pool, _) = mock_pool(1, 2000);
    let executor = QueryExecutor::new(pool.clone());

    let mut tx = executor.begin().await.unwrap();
    tx.rollback().await.unwrap();

    let err = executor.execute_in(&mut tx, &query("CONN")).await.unwrap_err();
    match err {
        DbError::InvalidTransactionState { state, .. } => {
            assert_eq!(state, TransactionState::RolledBack)
        }
        other => panic!("expected InvalidTransactionState, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_open_transaction_blocks_capacity_one_pool() {
    let (pool, _) = mock_pool(1, 2000);
    let executor = QueryExecutor::new(pool.clone());

    let mut tx = executor.begin().await.unwrap();
    let err = executor.execute(&query("CONN"), None).await.unwrap_err();
    assert!(matches!(err, DbError::QueryTimeout { .. }));

    tx.commit().await.unwrap();
    assert!(executor.execute(&query("CONN"), None).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_transaction_discards_connection() {
    let (pool, state) = mock_pool(1, 2000);
    let executor = QueryExecutor::new(pool.clone());

    let tx = executor.begin().await.unwrap();
    drop(tx);

    assert_eq!(pool.status().size, 0);
    assert_eq!(pool.metrics().connections_closed, 1);
    settle().await;
    assert_eq!(state.closed(), 1);

    let output = executor.execute(&query("CONN"), None).await.unwrap();
    assert_eq!(output.rows()[0]["conn"], 2);
}

fn registry(max_connections: u32) -> TransactionRegistry<MockConnector> {
    let (pool, _) = mock_pool(max_connections, 2000);
    TransactionRegistry::new(QueryExecutor::new(pool))
}

#[tokio::test(start_paused = true)]
async fn test_registry_execute_and_commit() {
    let registry = registry(1);

    let id = registry.begin(None).await.unwrap();
    assert!(id.starts_with("tx_"));
    assert_eq!(registry.count().await, 1);

    registry.execute(&id, &query("SET k=v")).await.unwrap();
    let output = registry.execute(&id, &query("GET k")).await.unwrap();
    assert_eq!(output.rows()[0]["k"], "v");

    registry.commit(&id).await.unwrap();
    assert_eq!(registry.count().await, 0);
    assert!(matches!(
        registry.commit(&id).await,
        Err(DbError::Transaction { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_registry_unknown_transaction() {
    let registry = registry(1);
    assert!(matches!(
        registry.execute("tx_nonexistent", &query("CONN")).await,
        Err(DbError::Transaction { .. })
    ));
    assert!(matches!(
        registry.rollback("tx_nonexistent").await,
        Err(DbError::Transaction { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_registry_clamps_timeout() {
    let registry = registry(2);
    registry.begin(Some(10_000)).await.unwrap();

    let list = registry.list_all().await;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].timeout_secs, 300);
    assert!(list[0].connection_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_registry_rolls_back_expired() {
    let (pool, state) = mock_pool(1, 2000);
    let registry = TransactionRegistry::new(QueryExecutor::new(pool.clone()));

    let id = registry.begin(Some(1)).await.unwrap();
    assert_eq!(registry.cleanup_expired().await, 0);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(matches!(
        registry.execute(&id, &query("CONN")).await,
        Err(DbError::Transaction { .. })
    ));
    assert_eq!(registry.cleanup_expired().await, 1);
    assert_eq!(registry.count().await, 0);

    assert!(state.log().contains(&"1:ROLLBACK".to_string()));
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test(start_paused = true)]
async fn test_statement_timeout_aborts_transaction() {
    let (pool, state) = mock_pool(1, 2000);
    let executor = QueryExecutor::with_timeouts(
        pool.clone(),
        Duration::from_millis(2000),
        Duration::from_secs(1),
    );

    let mut tx = executor.begin().await.unwrap();
    let err = executor
        .execute_in(&mut tx, &query("SLEEP 5000"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));

    // Closing the connection aborted the transaction.
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert!(!tx.is_open());
    assert_eq!(pool.status().size, 0);

    let err = executor.execute_in(&mut tx, &query("CONN")).await.unwrap_err();
    match err {
        DbError::InvalidTransactionState { state, .. } => {
            assert_eq!(state, TransactionState::RolledBack)
        }
        other => panic!("expected InvalidTransactionState, got {other:?}"),
    }
    assert!(matches!(
        tx.commit().await,
        Err(DbError::InvalidTransactionState { .. })
    ));
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert!(!state.log().iter().any(|s| s.ends_with("COMMIT")));

    settle().await;
    assert_eq!(state.closed(), 1);
    let output = executor.execute(&query("CONN"), None).await.unwrap();
    assert_eq!(output.rows()[0]["conn"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_commit_is_not_reported_committed() {
    let (pool, state) = mock_pool(1, 2000);
    let executor = QueryExecutor::new(pool.clone());

    let mut tx = executor.begin().await.unwrap();
    executor.execute_in(&mut tx, &query("SET k=v")).await.unwrap();

    state.fail_commit.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(matches!(tx.commit().await, Err(DbError::Database { .. })));
    assert_eq!(tx.state(), TransactionState::RolledBack);

    // The connection is closed rather than pooled.
    assert_eq!(pool.status().size, 0);
    assert_eq!(pool.metrics().connections_closed, 1);
    assert!(matches!(
        tx.rollback().await,
        Err(DbError::InvalidTransactionState { .. })
    ));
}
