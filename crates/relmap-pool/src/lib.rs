//! Connection pooling for relmap using asupersync.
//!
//! A [`Pool`] hands out at most `max_connections` connections. Idle
//! connections are reused first; below the bound new ones are opened through
//! the caller's factory; at the bound `acquire` waits, without holding the
//! executor thread, until a connection is released or `acquire_timeout_ms`
//! elapses.
//!
//! A [`PooledConnection`] returns itself to the pool on drop unless it was
//! discarded, in which case the underlying connection is closed instead and
//! its slot freed.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use asupersync::sync::Notify;
use asupersync::time::{timeout, wall_now};

use relmap_core::{
    Connection, Cx, Dialect, Error, Outcome, PoolError, PoolErrorKind, Result, Row, Value,
};

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections opened by [`Pool::warm_up`]
    pub min_connections: usize,
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Connection idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Maximum lifetime of a connection in milliseconds
    pub max_lifetime_ms: u64,
    /// Ping idle connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout_ms: 600_000,   // 10 minutes
            acquire_timeout_ms: 30_000, // 30 seconds
            max_lifetime_ms: 1_800_000, // 30 minutes
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(pool_error(
                PoolErrorKind::Config,
                "max_connections must be at least 1",
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(pool_error(
                PoolErrorKind::Config,
                format!(
                    "min_connections ({}) exceeds max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            ));
        }
        Ok(())
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of checked-out connections
    pub active_connections: usize,
    /// Number of callers blocked in `acquire`
    pub pending_requests: usize,
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}

struct IdleConnection<C> {
    conn: Arc<C>,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    total: usize,
    pending: usize,
    closed: bool,
}

struct PoolInner<C> {
    config: PoolConfig,
    state: Mutex<PoolState<C>>,
    /// Signalled whenever a slot or idle connection frees up.
    released: Notify,
}

impl<C> PoolInner<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, idle: &IdleConnection<C>, now: Instant) -> bool {
        let idle_for = now.duration_since(idle.idle_since);
        let lived = now.duration_since(idle.created_at);
        idle_for >= Duration::from_millis(self.config.idle_timeout_ms)
            || lived >= Duration::from_millis(self.config.max_lifetime_ms)
    }

    fn forget_slot(&self) {
        let mut state = self.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.released.notify_one();
    }
}

enum Checkout<C> {
    Reuse(IdleConnection<C>),
    Open,
    Wait(Duration),
}

/// A bounded connection pool.
///
/// Cloning a pool is cheap; clones share the same connections.
pub struct Pool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: Connection> Pool<C> {
    /// Create a new connection pool. No connection is opened yet.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    pending: 0,
                    closed: false,
                }),
                released: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle.len(),
            active_connections: state.total.saturating_sub(state.idle.len()),
            pending_requests: state.pending,
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.inner.lock().total >= self.inner.config.max_connections
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Open connections until `min_connections` exist.
    pub async fn warm_up<F, Fut>(&self, cx: &Cx, factory: F) -> Outcome<usize, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Outcome<C, Error>>,
    {
        let mut opened = 0;
        loop {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            {
                let mut state = self.inner.lock();
                if state.closed || state.total >= self.inner.config.min_connections {
                    break;
                }
                state.total += 1;
            }
            let conn = match factory().await {
                Outcome::Ok(conn) => conn,
                Outcome::Err(e) => {
                    self.inner.forget_slot();
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.inner.forget_slot();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.inner.forget_slot();
                    return Outcome::Panicked(p);
                }
            };
            let now = Instant::now();
            self.inner.lock().idle.push_back(IdleConnection {
                conn: Arc::new(conn),
                created_at: now,
                idle_since: now,
            });
            opened += 1;
        }
        tracing::debug!(opened, "pool warmed up");
        Outcome::Ok(opened)
    }

    /// Check out a connection, opening one through `factory` if the pool has
    /// room and nothing idle is usable.
    ///
    /// Waits while the pool is at capacity, up to `acquire_timeout_ms`.
    /// Other tasks on the same runtime keep running, so a release from any of
    /// them wakes the waiter.
    #[tracing::instrument(level = "debug", skip(self, cx, factory))]
    pub async fn acquire<F, Fut>(&self, cx: &Cx, factory: F) -> Outcome<PooledConnection<C>, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Outcome<C, Error>>,
    {
        let deadline =
            Instant::now() + Duration::from_millis(self.inner.config.acquire_timeout_ms);
        loop {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }

            let checkout = match self.checkout(deadline) {
                Ok(checkout) => checkout,
                Err(e) => return Outcome::Err(e),
            };

            match checkout {
                Checkout::Reuse(idle) => {
                    if self.inner.config.test_on_checkout && !idle.conn.is_valid(cx).await {
                        tracing::warn!("idle connection failed its checkout ping, closing it");
                        self.inner.forget_slot();
                        continue;
                    }
                    return Outcome::Ok(PooledConnection::new(
                        Arc::clone(&self.inner),
                        idle.conn,
                        idle.created_at,
                    ));
                }
                Checkout::Wait(remaining) => {
                    let now = cx.timer_driver().map_or_else(wall_now, |d| d.now());
                    let woken = timeout(now, remaining, self.inner.released.notified()).await;
                    self.inner.lock().pending -= 1;
                    if woken.is_err() {
                        tracing::debug!("timed out waiting for a pooled connection");
                    }
                }
                Checkout::Open => match factory().await {
                    Outcome::Ok(conn) => {
                        tracing::debug!("opened new pooled connection");
                        return Outcome::Ok(PooledConnection::new(
                            Arc::clone(&self.inner),
                            Arc::new(conn),
                            Instant::now(),
                        ));
                    }
                    Outcome::Err(e) => {
                        self.inner.forget_slot();
                        return Outcome::Err(e);
                    }
                    Outcome::Cancelled(r) => {
                        self.inner.forget_slot();
                        return Outcome::Cancelled(r);
                    }
                    Outcome::Panicked(p) => {
                        self.inner.forget_slot();
                        return Outcome::Panicked(p);
                    }
                },
            }
        }
    }

    /// Reserve an idle connection or a slot to open a new one, or report
    /// how long the caller may wait for a release.
    fn checkout(&self, deadline: Instant) -> Result<Checkout<C>> {
        let inner = &self.inner;
        let mut state = inner.lock();
        if state.closed {
            return Err(pool_error(PoolErrorKind::Closed, "pool is closed"));
        }

        let now = Instant::now();
        while let Some(idle) = state.idle.pop_front() {
            if inner.is_expired(&idle, now) {
                state.total = state.total.saturating_sub(1);
                tracing::debug!("closing expired idle connection");
                continue;
            }
            return Ok(Checkout::Reuse(idle));
        }

        if state.total < inner.config.max_connections {
            state.total += 1;
            return Ok(Checkout::Open);
        }

        match deadline.checked_duration_since(now) {
            Some(remaining) if !remaining.is_zero() => {
                state.pending += 1;
                Ok(Checkout::Wait(remaining))
            }
            _ => Err(pool_error(
                PoolErrorKind::Timeout,
                format!(
                    "no connection available within {}ms ({} in use)",
                    inner.config.acquire_timeout_ms, state.total
                ),
            )),
        }
    }

    /// Close the pool: idle connections are dropped, checked-out ones are
    /// dropped when released, and further `acquire` calls fail.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        let dropped = state.idle.len();
        state.total = state.total.saturating_sub(dropped);
        state.idle.clear();
        drop(state);
        self.inner.released.notify_waiters();
        tracing::debug!(dropped, "pool closed");
    }
}

/// A connection borrowed from the pool.
///
/// Returned to the pool when dropped unless [`discard`](Connection::discard)
/// was called on it.
pub struct PooledConnection<C> {
    pool: Arc<PoolInner<C>>,
    conn: Arc<C>,
    created_at: Instant,
    discarded: AtomicBool,
}

impl<C> PooledConnection<C> {
    fn new(pool: Arc<PoolInner<C>>, conn: Arc<C>, created_at: Instant) -> Self {
        Self {
            pool,
            conn,
            created_at,
            discarded: AtomicBool::new(false),
        }
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<C> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("discarded", &self.is_discarded())
            .finish_non_exhaustive()
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        let expired = self.created_at.elapsed()
            >= Duration::from_millis(self.pool.config.max_lifetime_ms);
        if self.is_discarded() || state.closed || expired {
            state.total = state.total.saturating_sub(1);
            if self.is_discarded() {
                tracing::warn!("discarding pooled connection in unknown state");
            }
        } else {
            state.idle.push_back(IdleConnection {
                conn: Arc::clone(&self.conn),
                created_at: self.created_at,
                idle_since: Instant::now(),
            });
        }
        drop(state);
        self.pool.released.notify_one();
    }
}

impl<C: Connection> Connection for PooledConnection<C> {
    fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.conn.query(cx, sql, params)
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        self.conn.query_one(cx, sql, params)
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.conn.execute(cx, sql, params)
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        self.conn.insert(cx, sql, params)
    }

    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.conn.ping(cx)
    }

    fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
    }
}
