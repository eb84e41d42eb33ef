//! Connection pool management.
//!
//! This module provides a fixed-capacity pool of physical connections with a strict
//! FIFO wait queue. Guarantees:
//!
//! - A queued request's deadline is fixed when it is enqueued and never extended.
//! - A request that times out is removed from the queue before `acquire` returns, so a
//!   later release can never be matched against it.
//! - A released connection goes straight to the head of the queue, inside `release`,
//!   before anyone else can see it as idle.
//!
//! All queue and idle-set mutation happens under one short, synchronous lock that is
//! never held across an `.await`.

use crate::db::connection::{Connector, PhysicalConnection};
use crate::error::{DbError, DbResult, PoolTimeout};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Identifier of one physical connection, unique within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sizing and wait budget for a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of physical connections (leased + idle).
    pub max_connections: u32,
    /// Default wait budget for [`Pool::acquire`].
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    pub fn new(max_connections: u32, acquire_timeout: Duration) -> Self {
        Self {
            max_connections,
            acquire_timeout,
        }
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.max_connections == 0 {
            return Err(DbError::invalid_input(
                "max_connections must be greater than 0",
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(DbError::invalid_input(
                "acquire_timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Point-in-time snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    /// Leased + idle + being opened.
    pub size: usize,
    pub idle: usize,
    /// Leased or being opened.
    pub in_use: usize,
    /// Requests queued for a connection.
    pub waiting: usize,
}

/// Cumulative pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolMetrics {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub acquisitions: u64,
    pub timeouts: u64,
    /// Releases that went directly to a queued request.
    pub handoffs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    handoffs: AtomicU64,
}

struct Live<T> {
    id: ConnectionId,
    raw: T,
}

/// What a release hands to the head of the queue.
enum Handoff<T> {
    /// A ready connection.
    Connection(Live<T>),
    /// A freed capacity slot; the receiver opens a fresh connection in it.
    Slot,
}

struct Waiter<T> {
    id: u64,
    deadline: Instant,
    sender: oneshot::Sender<Handoff<T>>,
}

struct PoolState<T> {
    idle: VecDeque<Live<T>>,
    waiters: VecDeque<Waiter<T>>,
    /// Leased connections plus slots reserved for connections being opened.
    outstanding: usize,
    closed: bool,
    next_waiter_id: u64,
}

impl<T> PoolState<T> {
    fn size(&self) -> usize {
        self.outstanding + self.idle.len()
    }

    /// Give `handoff` to the first live waiter, evicting expired ones on the way.
    ///
    /// Returns the handoff if nobody took it.
    fn hand_to_waiter(
        &mut self,
        mut handoff: Handoff<T>,
        counters: &Counters,
    ) -> Option<Handoff<T>> {
        let now = Instant::now();
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.deadline <= now {
                // Dropping the sender tells the waiter it timed out.
                trace!(waiter_id = waiter.id, "Evicted expired waiter");
                continue;
            }
            match waiter.sender.send(handoff) {
                Ok(()) => {
                    counters.handoffs.fetch_add(1, Ordering::Relaxed);
                    trace!(waiter_id = waiter.id, "Handed off to waiter");
                    return None;
                }
                Err(returned) => handoff = returned,
            }
        }
        Some(handoff)
    }
}

struct PoolShared<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<PoolState<C::Connection>>,
    next_connection_id: AtomicU64,
    counters: Counters,
}

impl<C: Connector> PoolShared<C> {
    fn release_live(&self, live: Live<C::Connection>) {
        let mut state = self.state.lock();
        if state.closed {
            state.outstanding -= 1;
            drop(state);
            self.close_in_background(live);
            return;
        }
        // A successful handoff keeps the connection counted as leased.
        if let Some(returned) = state.hand_to_waiter(Handoff::Connection(live), &self.counters) {
            state.outstanding -= 1;
            if let Handoff::Connection(live) = returned {
                trace!(connection_id = %live.id, "Connection returned to idle set");
                state.idle.push_back(live);
            }
        }
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        if state.closed {
            state.outstanding -= 1;
            return;
        }
        if state
            .hand_to_waiter(Handoff::Slot, &self.counters)
            .is_some()
        {
            state.outstanding -= 1;
        }
    }

    fn return_handoff(&self, handoff: Handoff<C::Connection>) {
        match handoff {
            Handoff::Connection(live) => self.release_live(live),
            Handoff::Slot => self.release_slot(),
        }
    }

    fn discard_live(&self, live: Live<C::Connection>) {
        debug!(connection_id = %live.id, "Discarding connection");
        self.close_in_background(live);
        self.release_slot();
    }

    fn close_in_background(&self, live: Live<C::Connection>) {
        self.counters
            .connections_closed
            .fetch_add(1, Ordering::Relaxed);
        let Live { id, raw } = live;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = raw.close().await {
                        debug!(connection_id = %id, error = %e, "Error while closing connection");
                    }
                });
            }
            // Outside a runtime the connection can only be dropped.
            Err(_) => drop(raw),
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Fixed-capacity connection pool with FIFO waiting.
///
/// `Pool` is cheap to clone; clones share the same connections. Create one per database at
/// startup and pass it to whatever needs it.
pub struct Pool<C: Connector>(Arc<PoolShared<C>>);

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.0.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Pool<C> {
    /// Create a pool. No connection is opened until the first acquisition.
    pub fn new(connector: C, config: PoolConfig) -> DbResult<Self> {
        config.validate()?;

        info!(
            max_connections = config.max_connections,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "Connection pool created"
        );

        Ok(Self(Arc::new(PoolShared {
            connector,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                outstanding: 0,
                closed: false,
                next_waiter_id: 0,
            }),
            next_connection_id: AtomicU64::new(1),
            counters: Counters::default(),
        })))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.0.config
    }

    /// Acquire a connection using the configured acquire timeout.
    pub async fn acquire(&self) -> DbResult<Lease<C>> {
        self.acquire_with_timeout(self.0.config.acquire_timeout)
            .await
    }

    /// Acquire a connection, waiting at most `timeout` if the pool is exhausted.
    ///
    /// Returns [`DbError::PoolTimeout`] if no connection was handed over before the
    /// deadline. The request is out of the queue by the time this returns.
    pub async fn acquire_with_timeout(&self, timeout: Duration) -> DbResult<Lease<C>> {
        let pending = {
            let mut state = self.0.state.lock();
            if state.closed {
                return Err(DbError::PoolClosed);
            }

            // Idle connections only exist while nobody is queued, so taking one here
            // cannot overtake a waiter.
            if state.waiters.is_empty() {
                if let Some(live) = state.idle.pop_front() {
                    state.outstanding += 1;
                    drop(state);
                    debug!(connection_id = %live.id, "Acquired idle connection");
                    return Ok(self.lease(live));
                }
            }

            if state.waiters.is_empty()
                && state.size() < self.0.config.max_connections as usize
            {
                state.outstanding += 1;
                None
            } else {
                let enqueued_at = Instant::now();
                let (sender, receiver) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push_back(Waiter {
                    id,
                    deadline: enqueued_at + timeout,
                    sender,
                });
                trace!(
                    waiter_id = id,
                    queue_len = state.waiters.len(),
                    "Pool exhausted, waiting"
                );
                Some(PendingAcquire {
                    pool: self,
                    id,
                    enqueued_at,
                    timeout,
                    receiver,
                    settled: false,
                })
            }
        };

        match pending {
            None => self.open_reserved().await,
            Some(pending) => pending.wait().await,
        }
    }

    /// Take an idle connection without waiting.
    ///
    /// Returns `None` if no connection is idle or other requests are already queued.
    pub fn try_acquire(&self) -> Option<Lease<C>> {
        let mut state = self.0.state.lock();
        if state.closed || !state.waiters.is_empty() {
            return None;
        }
        let live = state.idle.pop_front()?;
        state.outstanding += 1;
        drop(state);
        Some(self.lease(live))
    }

    /// Get the current pool status.
    pub fn status(&self) -> PoolStatus {
        let state = self.0.state.lock();
        PoolStatus {
            capacity: self.0.config.max_connections as usize,
            size: state.size(),
            idle: state.idle.len(),
            in_use: state.outstanding,
            waiting: state.waiters.len(),
        }
    }

    /// Get pool metrics.
    pub fn metrics(&self) -> PoolMetrics {
        let c = &self.0.counters;
        PoolMetrics {
            connections_opened: c.connections_opened.load(Ordering::Relaxed),
            connections_closed: c.connections_closed.load(Ordering::Relaxed),
            acquisitions: c.acquisitions.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            handoffs: c.handoffs.load(Ordering::Relaxed),
        }
    }

    /// Close the pool.
    ///
    /// Queued requests fail with [`DbError::PoolClosed`], idle connections are closed and
    /// leases returned afterwards close their connection instead of pooling it.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.0.state.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };

        drop(waiters);

        for live in idle {
            self.0
                .counters
                .connections_closed
                .fetch_add(1, Ordering::Relaxed);
            if let Err(e) = live.raw.close().await {
                warn!(connection_id = %live.id, error = %e, "Failed to close idle connection");
            }
        }

        info!("Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.0.state.lock().closed
    }

    fn lease(&self, live: Live<C::Connection>) -> Lease<C> {
        self.0
            .counters
            .acquisitions
            .fetch_add(1, Ordering::Relaxed);
        Lease {
            pool: Arc::clone(&self.0),
            live: Some(live),
            pinned: false,
        }
    }

    /// Open a connection in a slot already counted in `outstanding`.
    async fn open_reserved(&self) -> DbResult<Lease<C>> {
        let mut reservation = SlotReservation {
            shared: &self.0,
            armed: true,
        };

        let raw = self.0.connector.connect().await?;
        reservation.armed = false;

        let id = self.0.next_connection_id();
        self.0
            .counters
            .connections_opened
            .fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = %id, "Opened physical connection");
        Ok(self.lease(Live { id, raw }))
    }
}

/// Returns a reserved capacity slot if opening a connection fails or is cancelled.
struct SlotReservation<'a, C: Connector> {
    shared: &'a PoolShared<C>,
    armed: bool,
}

impl<C: Connector> Drop for SlotReservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

/// A request sitting in the wait queue.
struct PendingAcquire<'a, C: Connector> {
    pool: &'a Pool<C>,
    id: u64,
    enqueued_at: Instant,
    timeout: Duration,
    receiver: oneshot::Receiver<Handoff<C::Connection>>,
    /// Set once the queue entry and any delivered handoff have been dealt with.
    settled: bool,
}

impl<C: Connector> PendingAcquire<'_, C> {
    async fn wait(mut self) -> DbResult<Lease<C>> {
        let deadline = self.enqueued_at + self.timeout;
        let handoff = match tokio::time::timeout_at(deadline, &mut self.receiver).await {
            Ok(Ok(handoff)) => handoff,
            // Sender dropped: evicted after expiry, or the pool closed.
            Ok(Err(_)) => {
                self.settled = true;
                return Err(self.expired());
            }
            Err(_) => {
                let removed = {
                    let mut state = self.pool.0.state.lock();
                    match state.waiters.iter().position(|w| w.id == self.id) {
                        Some(pos) => {
                            state.waiters.remove(pos);
                            true
                        }
                        None => false,
                    }
                };
                if removed {
                    self.settled = true;
                    return Err(self.expired());
                }
                // A release reached us between the timer firing and taking the lock; the
                // handoff was made while we were still queued, so honour it.
                match self.receiver.try_recv() {
                    Ok(handoff) => handoff,
                    Err(_) => {
                        self.settled = true;
                        return Err(self.expired());
                    }
                }
            }
        };
        self.settled = true;

        match handoff {
            Handoff::Connection(live) => {
                debug!(
                    connection_id = %live.id,
                    waited_ms = self.enqueued_at.elapsed().as_millis() as u64,
                    "Acquired connection from queue"
                );
                Ok(self.pool.lease(live))
            }
            Handoff::Slot => self.pool.open_reserved().await,
        }
    }

    fn expired(&self) -> DbError {
        if self.pool.is_closed() {
            return DbError::PoolClosed;
        }
        self.pool
            .0
            .counters
            .timeouts
            .fetch_add(1, Ordering::Relaxed);
        let timeout = PoolTimeout {
            waited: self.enqueued_at.elapsed(),
            timeout: self.timeout,
        };
        warn!(
            waited_ms = timeout.waited.as_millis() as u64,
            timeout_ms = timeout.timeout.as_millis() as u64,
            "Timed out waiting for a pooled connection"
        );
        DbError::PoolTimeout(timeout)
    }
}

impl<C: Connector> Drop for PendingAcquire<'_, C> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Cancelled while queued.
        let removed = {
            let mut state = self.pool.0.state.lock();
            match state.waiters.iter().position(|w| w.id == self.id) {
                Some(pos) => {
                    state.waiters.remove(pos);
                    true
                }
                None => false,
            }
        };
        if !removed {
            if let Ok(handoff) = self.receiver.try_recv() {
                self.pool.0.return_handoff(handoff);
            }
        }
    }
}

/// Lifecycle of a [`Lease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Active,
    Released,
}

/// Exclusive handle to one pooled physical connection.
///
/// [`release`](Lease::release) returns the connection to the pool and may be called any
/// number of times; only the first call has an effect. Dropping an active lease releases
/// it. While a lease is pinned by an open transaction, `release` does nothing.
pub struct Lease<C: Connector> {
    pool: Arc<PoolShared<C>>,
    live: Option<Live<C::Connection>>,
    pinned: bool,
}

impl<C: Connector> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection_id", &self.connection_id())
            .field("state", &self.state())
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl<C: Connector> Lease<C> {
    /// Id of the leased connection, `None` once released.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.live.as_ref().map(|live| live.id)
    }

    pub fn state(&self) -> LeaseState {
        if self.live.is_some() {
            LeaseState::Active
        } else {
            LeaseState::Released
        }
    }

    pub fn is_active(&self) -> bool {
        self.live.is_some()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// The underlying connection.
    pub fn connection_mut(&mut self) -> DbResult<&mut C::Connection> {
        self.live
            .as_mut()
            .map(|live| &mut live.raw)
            .ok_or_else(|| DbError::internal("Lease has already been released"))
    }

    /// Return the connection to the pool. Idempotent; a no-op while pinned.
    pub fn release(&mut self) {
        if self.pinned {
            trace!("Release of pinned lease ignored");
            return;
        }
        if let Some(live) = self.live.take() {
            trace!(connection_id = %live.id, "Releasing lease");
            self.pool.release_live(live);
        }
    }

    /// Close the connection instead of pooling it, freeing its capacity slot.
    ///
    /// Used when the connection's session state can no longer be trusted.
    pub fn discard(&mut self) {
        self.pinned = false;
        if let Some(live) = self.live.take() {
            self.pool.discard_live(live);
        }
    }

    pub(crate) fn pin(&mut self) {
        self.pinned = true;
    }

    pub(crate) fn unpin(&mut self) {
        self.pinned = false;
    }
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        if self.pinned {
            self.discard();
        } else {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Statement, StatementResult};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingConnector {
        opened: Arc<AtomicUsize>,
    }

    struct NullConnection;

    impl PhysicalConnection for NullConnection {
        async fn run(&mut self, _statement: &Statement) -> DbResult<StatementResult> {
            Ok(StatementResult::from_rows_affected(0))
        }

        async fn ping(&mut self) -> DbResult<()> {
            Ok(())
        }

        async fn close(self) -> DbResult<()> {
            Ok(())
        }
    }

    impl Connector for CountingConnector {
        type Connection = NullConnection;

        async fn connect(&self) -> DbResult<NullConnection> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(NullConnection)
        }
    }

    fn pool(max: u32) -> Pool<CountingConnector> {
        Pool::new(
            CountingConnector::default(),
            PoolConfig::new(max, Duration::from_millis(100)),
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(PoolConfig::new(0, Duration::from_secs(1)).validate().is_err());
        assert!(PoolConfig::new(1, Duration::ZERO).validate().is_err());
        assert!(PoolConfig::new(1, Duration::from_millis(1)).validate().is_ok());
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }

    #[tokio::test]
    async fn test_new_pool_is_empty() {
        let pool = pool(3);
        assert_eq!(
            pool.status(),
            PoolStatus {
                capacity: 3,
                size: 0,
                idle: 0,
                in_use: 0,
                waiting: 0,
            }
        );
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_release_returns_connection_to_idle_set() {
        let pool = pool(2);
        let mut lease = pool.acquire().await.unwrap();
        assert_eq!(pool.status().in_use, 1);

        lease.release();
        assert_eq!(lease.state(), LeaseState::Released);
        assert_eq!(pool.status().idle, 1);
        assert_eq!(pool.status().in_use, 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let pool = pool(1);
        let mut lease = pool.acquire().await.unwrap();
        lease.release();
        lease.release();
        drop(lease);
        let status = pool.status();
        assert_eq!(status.idle, 1);
        assert_eq!(status.size, 1);
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let pool = pool(2);
        let first = pool.acquire().await.unwrap();
        let id = first.connection_id();
        drop(first);

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.connection_id(), id);
        assert_eq!(pool.metrics().connections_opened, 1);
        assert_eq!(pool.metrics().acquisitions, 2);
    }

    #[tokio::test]
    async fn test_pinned_lease_ignores_release() {
        let pool = pool(1);
        let mut lease = pool.acquire().await.unwrap();
        lease.pin();
        lease.release();
        assert!(lease.is_active());
        assert_eq!(pool.status().idle, 0);

        lease.unpin();
        lease.release();
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_discard_frees_capacity() {
        let pool = pool(1);
        let mut lease = pool.acquire().await.unwrap();
        lease.discard();
        assert_eq!(pool.status().size, 0);

        let fresh = pool.acquire().await.unwrap();
        assert_ne!(fresh.connection_id(), Some(ConnectionId(1)));
        assert_eq!(pool.metrics().connections_opened, 2);
        assert_eq!(pool.metrics().connections_closed, 1);
    }

    #[tokio::test]
    async fn test_try_acquire_takes_idle_only() {
        let pool = pool(1);
        drop(pool.acquire().await.unwrap());
        let lease = pool.try_acquire();
        assert!(lease.is_some());
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn test_acquire_on_closed_pool_fails() {
        let pool = pool(1);
        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_lease_returned_after_close_is_not_pooled() {
        let pool = pool(1);
        let lease = pool.acquire().await.unwrap();
        pool.close().await;
        drop(lease);
        assert_eq!(pool.status().size, 0);
        assert_eq!(pool.metrics().connections_closed, 1);
    }
}
