//! Pool exhaustion scenario.
//!
//! Holds every pooled connection, issues a relation fetch that has to wait for one, then
//! releases everything and checks that an unrelated fetch still gets through. A correct
//! pool fails the blocked fetch only once its full wait budget has passed and serves the
//! unrelated fetch immediately afterwards.

use crate::db::connection::Connector;
use crate::db::executor::QueryExecutor;
use crate::db::pool::{Lease, PoolMetrics, PoolStatus};
use crate::error::{DbError, DbResult};
use crate::models::{LogicalQuery, Statement};
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;
use tracing::{info, warn};

/// Which rows the scenario fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioOptions {
    /// Author whose posts are fetched while the pool is exhausted.
    pub author_id: i64,
    /// Post whose comments are fetched after the pool has been released.
    pub post_id: i64,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            author_id: 1,
            post_id: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Succeeded,
    TimedOut,
    Failed,
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Succeeded => "succeeded",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub name: &'static str,
    pub outcome: PhaseOutcome,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub capacity: usize,
    pub acquire_timeout_ms: u64,
    pub phases: Vec<PhaseReport>,
    /// A timeout fired before its budget, a fetch got a connection it could not have, or
    /// the pool stayed unusable after everything was released.
    pub defect_observed: bool,
    pub status: PoolStatus,
    pub metrics: PoolMetrics,
}

impl ScenarioReport {
    pub fn phase(&self, name: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.name == name)
    }
}

/// Create the `authors`, `posts` and `comments` tables.
pub fn schema_query() -> LogicalQuery {
    LogicalQuery::new()
        .then(Statement::execute(
            "CREATE TABLE IF NOT EXISTS authors (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            )",
        ))
        .then(Statement::execute(
            "CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY,
                author_id INTEGER NOT NULL REFERENCES authors(id),
                title TEXT NOT NULL,
                body TEXT
            )",
        ))
        .then(Statement::execute(
            "CREATE TABLE IF NOT EXISTS comments (
                id INTEGER PRIMARY KEY,
                post_id INTEGER NOT NULL REFERENCES posts(id),
                author_id INTEGER NOT NULL REFERENCES authors(id),
                body TEXT NOT NULL
            )",
        ))
}

/// Insert a small fixed data set. Safe to run more than once.
pub fn seed_query() -> LogicalQuery {
    let authors = [(1, "ada"), (2, "grace")];
    let posts = [
        (1, 1, "Pools", "On waiting"),
        (2, 1, "Leases", "On giving back"),
        (3, 2, "Deadlines", "On time"),
    ];
    let comments = [
        (1, 1, 2, "Nice"),
        (2, 2, 2, "Agreed"),
        (3, 2, 1, "Thanks"),
        (4, 3, 1, "Late reply"),
    ];

    let mut query = LogicalQuery::new();
    for (id, name) in authors {
        query = query.then(
            Statement::execute("INSERT OR IGNORE INTO authors (id, name) VALUES (?, ?)")
                .bind(id as i64)
                .bind(name),
        );
    }
    for (id, author_id, title, body) in posts {
        query = query.then(
            Statement::execute(
                "INSERT OR IGNORE INTO posts (id, author_id, title, body) VALUES (?, ?, ?, ?)",
            )
            .bind(id as i64)
            .bind(author_id as i64)
            .bind(title)
            .bind(body),
        );
    }
    for (id, post_id, author_id, body) in comments {
        query = query.then(
            Statement::execute(
                "INSERT OR IGNORE INTO comments (id, post_id, author_id, body) VALUES (?, ?, ?, ?)",
            )
            .bind(id as i64)
            .bind(post_id as i64)
            .bind(author_id as i64)
            .bind(body),
        );
    }
    query
}

/// An author and their posts: a column metadata lookup followed by the main select.
pub fn author_with_posts(author_id: i64) -> LogicalQuery {
    LogicalQuery::new()
        .then(Statement::fetch("PRAGMA table_info(posts)"))
        .then(
            Statement::fetch(
                "SELECT a.id AS author_id, a.name, p.id AS post_id, p.title
                 FROM authors a JOIN posts p ON p.author_id = a.id
                 WHERE a.id = ?
                 ORDER BY p.id",
            )
            .bind(author_id),
        )
}

/// A post and its comments: a column metadata lookup followed by the main select.
pub fn post_with_comments(post_id: i64) -> LogicalQuery {
    LogicalQuery::new()
        .then(Statement::fetch("PRAGMA table_info(comments)"))
        .then(
            Statement::fetch(
                "SELECT p.id AS post_id, p.title, c.id AS comment_id, c.body
                 FROM posts p LEFT JOIN comments c ON c.post_id = p.id
                 WHERE p.id = ?
                 ORDER BY c.id",
            )
            .bind(post_id),
        )
}

/// Run the exhaustion scenario on `executor`'s pool.
///
/// Setup failures (schema, seed, holding the pool) are returned as errors; the outcome of
/// the two fetches is recorded in the report.
pub async fn run_exhaustion_scenario<C: Connector>(
    executor: &QueryExecutor<C>,
    options: &ScenarioOptions,
) -> DbResult<ScenarioReport> {
    let pool = executor.pool();
    let capacity = pool.config().max_connections as usize;
    let budget = executor.acquire_timeout();
    let mut phases = Vec::with_capacity(5);
    let mut defect_observed = false;

    // Setup
    let start = Instant::now();
    executor.execute(&schema_query(), None).await?;
    let seeded = executor.execute(&seed_query(), None).await?;
    phases.push(PhaseReport {
        name: "setup",
        outcome: PhaseOutcome::Succeeded,
        elapsed_ms: elapsed_ms(start),
        rows: Some(
            seeded
                .statements
                .iter()
                .filter_map(|s| s.rows_affected)
                .sum::<u64>() as usize,
        ),
        error: None,
    });

    // Exhaust
    let start = Instant::now();
    let mut held: Vec<Lease<C>> = Vec::with_capacity(capacity);
    for _ in 0..capacity {
        held.push(pool.acquire_with_timeout(budget).await?);
    }
    info!(held = held.len(), status = ?pool.status(), "Pool exhausted");
    phases.push(PhaseReport {
        name: "exhaust",
        outcome: PhaseOutcome::Succeeded,
        elapsed_ms: elapsed_ms(start),
        rows: None,
        error: None,
    });

    // Blocked fetch
    let start = Instant::now();
    let blocked = executor
        .execute(&author_with_posts(options.author_id), None)
        .await;
    let elapsed = start.elapsed();
    let report = match blocked {
        Err(DbError::QueryTimeout { source }) => {
            if source.is_premature() || elapsed < budget {
                warn!(
                    waited_ms = source.waited.as_millis() as u64,
                    budget_ms = budget.as_millis() as u64,
                    "Blocked fetch timed out early"
                );
                defect_observed = true;
            }
            PhaseReport {
                name: "blocked_fetch",
                outcome: PhaseOutcome::TimedOut,
                elapsed_ms: elapsed.as_millis() as u64,
                rows: None,
                error: Some(DbError::QueryTimeout { source }.to_string()),
            }
        }
        Ok(output) => {
            warn!("Blocked fetch obtained a connection while the pool was exhausted");
            defect_observed = true;
            PhaseReport {
                name: "blocked_fetch",
                outcome: PhaseOutcome::Succeeded,
                elapsed_ms: elapsed.as_millis() as u64,
                rows: Some(output.rows().len()),
                error: None,
            }
        }
        Err(e) => {
            defect_observed = true;
            failed_phase("blocked_fetch", elapsed.as_millis() as u64, &e)
        }
    };
    phases.push(report);

    // Release
    let start = Instant::now();
    for lease in &mut held {
        lease.release();
    }
    drop(held);
    info!(status = ?pool.status(), "Held connections released");
    phases.push(PhaseReport {
        name: "release",
        outcome: PhaseOutcome::Succeeded,
        elapsed_ms: elapsed_ms(start),
        rows: None,
        error: None,
    });

    // Independent fetch
    let start = Instant::now();
    let report = match executor
        .execute(&post_with_comments(options.post_id), None)
        .await
    {
        Ok(output) => PhaseReport {
            name: "independent_fetch",
            outcome: PhaseOutcome::Succeeded,
            elapsed_ms: elapsed_ms(start),
            rows: Some(output.rows().len()),
            error: None,
        },
        Err(e) => {
            warn!(error = %e, "Independent fetch failed after release");
            defect_observed = true;
            failed_phase("independent_fetch", elapsed_ms(start), &e)
        }
    };
    phases.push(report);

    info!(defect_observed, "Exhaustion scenario finished");

    Ok(ScenarioReport {
        capacity,
        acquire_timeout_ms: budget.as_millis() as u64,
        phases,
        defect_observed,
        status: pool.status(),
        metrics: pool.metrics(),
    })
}

fn failed_phase(name: &'static str, elapsed_ms: u64, error: &DbError) -> PhaseReport {
    PhaseReport {
        name,
        outcome: if error.pool_timeout().is_some() {
            PhaseOutcome::TimedOut
        } else {
            PhaseOutcome::Failed
        },
        elapsed_ms,
        rows: None,
        error: Some(error.to_string()),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
