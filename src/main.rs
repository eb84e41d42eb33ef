//! db-lease-pool - Main entry point.
//!
//! Runs the pool exhaustion scenario against a SQLite database and reports whether the
//! pool misbehaved.

use db_lease_pool::config::Config;
use db_lease_pool::db::{Pool, QueryExecutor, SqliteConnector, TransactionRegistry};
use db_lease_pool::models::{LogicalQuery, Statement};
use db_lease_pool::scenario::{ScenarioOptions, ScenarioReport, run_exhaustion_scenario};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print_report(report: &ScenarioReport) {
    println!(
        "capacity={} acquire_timeout={}ms",
        report.capacity, report.acquire_timeout_ms
    );
    for phase in &report.phases {
        let mut line = format!(
            "  {:<18} {:<10} {:>6}ms",
            phase.name, phase.outcome, phase.elapsed_ms
        );
        if let Some(rows) = phase.rows {
            line.push_str(&format!("  rows={rows}"));
        }
        if let Some(error) = &phase.error {
            line.push_str(&format!("  error=\"{error}\""));
        }
        println!("{line}");
    }
    println!(
        "defect_observed={} opened={} timeouts={} handoffs={}",
        report.defect_observed,
        report.metrics.connections_opened,
        report.metrics.timeouts,
        report.metrics.handoffs
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    info!("Starting db-lease-pool v{}", env!("CARGO_PKG_VERSION"));

    let db_config = config.database_config()?;
    let pool_config = db_config.pool_options.to_pool_config();
    if db_config.connection_string.contains(":memory:") && pool_config.max_connections > 1 {
        warn!(
            max_connections = pool_config.max_connections,
            "Each in-memory SQLite connection has its own database; use a file for more than one connection"
        );
    }

    let connector = SqliteConnector::from_url(&db_config.connection_string)?;
    let pool = Pool::new(connector, pool_config)?;
    let executor = QueryExecutor::with_timeouts(
        pool.clone(),
        pool_config.acquire_timeout,
        db_config.pool_options.statement_timeout_or_default(),
    );

    let registry = Arc::new(TransactionRegistry::new(executor.clone()));
    TransactionRegistry::start_cleanup_task(registry.clone());

    let report = run_exhaustion_scenario(&executor, &ScenarioOptions::default()).await?;

    // The pool must still serve transactions once the scenario has released everything.
    let transaction_id = registry
        .begin(Some(config.transaction_timeout))
        .await?;
    let counted = registry
        .execute(
            &transaction_id,
            &LogicalQuery::single(Statement::fetch("SELECT COUNT(*) AS posts FROM posts")),
        )
        .await;
    registry.rollback(&transaction_id).await?;
    match counted {
        Ok(output) => info!(rows = ?output.rows(), "Transaction check passed"),
        Err(e) => error!(error = %e, "Transaction check failed"),
    }

    if config.json_report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    pool.close().await;

    if report.defect_observed {
        error!("Pool defect observed");
        std::process::exit(2);
    }

    info!("Shutdown complete");
    Ok(())
}
