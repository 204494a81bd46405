//! Connection pool core
//!
//! The pool amortizes session setup (transport handshake, authentication,
//! namespace selection, schema bootstrap) across many short-lived logical
//! operations while enforcing bounded resource usage:
//!
//! - Elastic sizing between `min_size` and `max_size`, with in-flight
//!   constructions counted against the maximum
//! - LIFO idle set (keeps a small working set hot; cold connections age out
//!   through idle reaping)
//! - Strict-FIFO waiter queue with per-waiter deadlines and cancellation
//! - Retirement on failure, usage count, lifetime, and idleness
//! - Retrying session establishment with exponential backoff and jitter
//!
//! All state transitions happen under one mutex; network I/O (connect,
//! probe, reset, close) never runs while the lock is held.
//!
//! # Example
//!
//! ```rust,ignore
//! use tidepool::prelude::*;
//!
//! let config = PoolConfig::new("wss://db.example.com/rpc")
//!     .with_namespace("app", "main")
//!     .with_min_size(2)
//!     .with_max_size(10);
//!
//! let pool = Pool::new(config, factory).await?;
//! let mut conn = pool.acquire().await?;
//! let rows = conn.execute("SELECT * FROM user", serde_json::json!({})).await?;
//! // Connection returns to the pool when the guard drops
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::conn::{PooledConn, RetireReason};
use crate::error::{Error, Result};
use crate::session::{Session, SessionFactory};
use crate::stats::PoolStats;
use crate::waiter::WaitQueue;

// ============================================================================
// Pool state
// ============================================================================

pub(crate) struct PoolState {
    /// Idle connections, hottest at the back (push/pop back = LIFO).
    pub(crate) idle: VecDeque<PooledConn>,
    pub(crate) waiters: WaitQueue,
    /// Live connections: idle + borrowed + being probed.
    pub(crate) total: usize,
    pub(crate) in_use: usize,
    /// Connections temporarily pulled from `idle` by the maintainer.
    pub(crate) checking: usize,
    /// In-flight constructions; counts against `max_size`.
    pub(crate) creating: usize,
    pub(crate) closed: bool,
    next_conn_id: u64,
    pub(crate) stats: PoolStats,
}

impl PoolState {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            waiters: WaitQueue::new(),
            total: 0,
            in_use: 0,
            checking: 0,
            creating: 0,
            closed: false,
            next_conn_id: 0,
            stats: PoolStats::default(),
        }
    }

    /// Admit a freshly established session into the pool.
    pub(crate) fn register(&mut self, session: Box<dyn Session>) -> PooledConn {
        self.next_conn_id += 1;
        self.total += 1;
        self.stats.on_created(self.total);
        PooledConn::new(self.next_conn_id, session)
    }

    /// Account for a connection leaving the pool (closed outside the lock).
    pub(crate) fn note_closed(&mut self) {
        self.total -= 1;
        self.stats.on_closed(self.total);
    }

    /// Stamp and account a direct handout to the calling acquirer.
    fn handout(&mut self, mut conn: PooledConn, wait_ms: u64) -> PooledConn {
        conn.mark_used();
        self.in_use += 1;
        self.stats.on_acquire(self.in_use, wait_ms);
        conn
    }

    /// Offer a free connection to the oldest live waiter, or park it.
    ///
    /// A waiter can die between the liveness check and the send (racing
    /// cancellation); the connection then comes back and the next waiter is
    /// considered.
    pub(crate) fn dispatch_or_park(&mut self, mut conn: PooledConn) {
        debug_assert!(!conn.in_use);
        while let Some(waiter) = self.waiters.pop_live() {
            let waited_ms = waiter.enrolled_at.elapsed().as_millis() as u64;
            self.stats.on_waiters_changed(self.waiters.live_len());
            debug!("handing connection {} to waiter {}", conn.id, waiter.id);
            conn.mark_used();
            match waiter.deliver(conn) {
                Ok(()) => {
                    self.in_use += 1;
                    self.stats.on_acquire(self.in_use, waited_ms);
                    return;
                }
                Err(mut returned) => {
                    returned.in_use = false;
                    returned.usage_count -= 1;
                    conn = returned;
                }
            }
        }
        self.idle.push_back(conn);
    }
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) factory: Arc<dyn SessionFactory>,
    pub(crate) state: Mutex<PoolState>,
    shutdown: watch::Sender<bool>,
    maintainer: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// Pool handle
// ============================================================================

/// An elastic pool of database sessions.
///
/// Cheap to clone; all clones share the same pool. Dropping the last clone
/// stops the health maintainer, but [`Pool::close`] should be called for an
/// orderly shutdown that drains waiters and closes idle sessions.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl Pool {
    /// Construct and warm up a pool.
    ///
    /// Validates the configuration, concurrently establishes `min_size`
    /// sessions (each governed by the retry policy), runs the schema
    /// bootstrap statement once on the first session, and starts the health
    /// maintainer. If any warm-up connection fails after retries, the
    /// already-established sessions are torn down and the error is returned.
    pub async fn new(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Result<Pool> {
        config.validate()?;

        let warmups = (0..config.min_size).map(|_| establish_session(&config, factory.as_ref()));
        let mut sessions = Vec::with_capacity(config.min_size);
        let mut first_err = None;
        for result in join_all(warmups).await {
            match result {
                Ok(session) => sessions.push(session),
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        if let Some(err) = first_err {
            for session in sessions {
                let _ = session.close().await;
            }
            return Err(err);
        }

        if let Some(statement) = &config.schema_bootstrap {
            // Exactly once, on the first established session.
            if let Some(first) = sessions.first() {
                if let Err(e) = first.execute(statement, serde_json::Value::Null).await {
                    warn!("schema bootstrap failed: {}", e);
                    for session in sessions {
                        let _ = session.close().await;
                    }
                    return Err(e);
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            config,
            factory,
            state: Mutex::new(PoolState::new()),
            shutdown: shutdown_tx,
            maintainer: Mutex::new(None),
        });

        {
            let mut st = inner.state.lock();
            for session in sessions {
                let conn = st.register(session);
                st.idle.push_back(conn);
            }
        }

        let handle = crate::health::spawn(Arc::downgrade(&inner), shutdown_rx);
        *inner.maintainer.lock() = Some(handle);

        info!(
            "pool initialized with {} connections (min={}, max={})",
            inner.config.min_size, inner.config.min_size, inner.config.max_size
        );
        Ok(Pool { inner })
    }

    /// Borrow a connection, waiting up to `acquisition_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquisition_timeout)
            .await
    }

    /// Borrow a connection with a caller deadline.
    ///
    /// The effective deadline is clamped to the configured
    /// `acquisition_timeout`.
    pub async fn acquire_timeout(&self, limit: Duration) -> Result<PooledConnection> {
        let budget = limit.min(self.inner.config.acquisition_timeout);
        let started = Instant::now();

        enum Plan {
            Ready(PooledConn),
            Create,
            Wait(oneshot::Receiver<Result<PooledConn>>),
        }

        let (plan, stale, below_min) = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(Error::PoolClosed);
            }

            // Hottest idle connection first; anything due for retirement is
            // closed outside the lock.
            let mut stale = Vec::new();
            let mut ready = None;
            while let Some(conn) = st.idle.pop_back() {
                let over_min = st.total > self.inner.config.min_size;
                match conn.retire_reason(&self.inner.config, over_min) {
                    Some(reason) => {
                        debug!("retiring connection {} on acquire: {}", conn.id, reason);
                        st.note_closed();
                        stale.push(conn);
                    }
                    None => {
                        ready = Some(conn);
                        break;
                    }
                }
            }

            let plan = match ready {
                Some(conn) => {
                    let wait_ms = started.elapsed().as_millis() as u64;
                    Plan::Ready(st.handout(conn, wait_ms))
                }
                None if st.total + st.creating < self.inner.config.max_size => {
                    st.creating += 1;
                    Plan::Create
                }
                None => {
                    let (_, rx) = st.waiters.enroll();
                    let live_len = st.waiters.live_len();
                    st.stats.on_waiters_changed(live_len);
                    Plan::Wait(rx)
                }
            };
            let below_min = st.total + st.creating < self.inner.config.min_size;
            (plan, stale, below_min)
        };

        for conn in stale {
            conn.close().await;
        }
        if below_min {
            spawn_replenish(&self.inner);
        }

        match plan {
            Plan::Ready(conn) => Ok(PooledConnection::new(conn, self.clone())),

            Plan::Create => {
                match establish_session(&self.inner.config, self.inner.factory.as_ref()).await {
                    Ok(session) => {
                        let handed = {
                            let mut st = self.inner.state.lock();
                            st.creating -= 1;
                            if st.closed {
                                Err(session)
                            } else {
                                let conn = st.register(session);
                                let wait_ms = started.elapsed().as_millis() as u64;
                                Ok(st.handout(conn, wait_ms))
                            }
                        };
                        match handed {
                            Ok(conn) => Ok(PooledConnection::new(conn, self.clone())),
                            Err(session) => {
                                let _ = session.close().await;
                                Err(Error::PoolClosed)
                            }
                        }
                    }
                    Err(e) => {
                        let woken = {
                            let mut st = self.inner.state.lock();
                            st.creating -= 1;
                            st.stats.on_error();
                            let waiter = st.waiters.pop_live();
                            if waiter.is_some() {
                                let live_len = st.waiters.live_len();
                                st.stats.on_waiters_changed(live_len);
                            }
                            waiter
                        };
                        // A waiter may be queued behind our in-flight
                        // construction; it gets the same failure.
                        if let Some(waiter) = woken {
                            waiter.fail(Error::connection(e.to_string()));
                        }
                        Err(e)
                    }
                }
            }

            Plan::Wait(mut rx) => {
                debug!("pool saturated, enrolling waiter (budget {:?})", budget);
                let remaining = budget.saturating_sub(started.elapsed());
                match timeout(remaining, &mut rx).await {
                    Ok(Ok(Ok(conn))) => Ok(PooledConnection::new(conn, self.clone())),
                    Ok(Ok(Err(e))) => Err(e),
                    Ok(Err(_)) => Err(Error::PoolClosed),
                    Err(_) => {
                        // Deadline passed. Re-check the channel under the
                        // lock: a racing delivery must be accepted, not
                        // leaked, and dropping the receiver under the lock
                        // makes the dead-waiter mark race-free.
                        let mut st = self.inner.state.lock();
                        match rx.try_recv() {
                            Ok(Ok(conn)) => {
                                drop(st);
                                Ok(PooledConnection::new(conn, self.clone()))
                            }
                            Ok(Err(e)) => Err(e),
                            Err(_) => {
                                drop(rx);
                                st.stats.on_timeout();
                                let live_len = st.waiters.live_len();
                                st.stats.on_waiters_changed(live_len);
                                Err(Error::AcquireTimeout {
                                    waited: started.elapsed(),
                                })
                            }
                        }
                    }
                }
            }
        }
    }

    /// Run an operation on a pooled connection with guaranteed release.
    ///
    /// The closure receives the guard and must give it back alongside the
    /// result; the pool releases it on every exit path.
    pub async fn with_connection<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(PooledConnection) -> Fut,
        Fut: std::future::Future<Output = (PooledConnection, Result<T>)>,
    {
        let conn = self.acquire().await?;
        let (conn, result) = op(conn).await;
        conn.release().await;
        result
    }

    /// Return a connection to the pool.
    pub(crate) async fn release_conn(&self, mut conn: PooledConn, failed: bool) {
        // Phase 1: bookkeeping and the retirement decision under the lock.
        let (pool_closed, retire) = {
            let mut st = self.inner.state.lock();
            st.in_use -= 1;
            let in_use = st.in_use;
            st.stats.on_release(in_use);
            conn.mark_free();
            if failed {
                conn.mark_unhealthy();
            }
            let retire = if st.closed {
                None
            } else {
                conn.retire_reason(&self.inner.config, false)
            };
            if st.closed || retire.is_some() {
                st.note_closed();
                if matches!(retire, Some(RetireReason::Unhealthy)) {
                    st.stats.on_unhealthy();
                }
            }
            (st.closed, retire)
        };

        if pool_closed {
            conn.close().await;
            return;
        }
        if let Some(reason) = retire {
            debug!("retiring connection {} on release: {}", conn.id, reason);
            conn.close().await;
            spawn_replenish(&self.inner);
            return;
        }

        // Phase 2: optional reset, outside the lock. A reset failure means
        // the session state is unknown; retire it.
        if self.inner.config.reset_on_return {
            if let Err(e) = conn.session.reset().await {
                warn!("reset failed for connection {}: {}", conn.id, e);
                {
                    let mut st = self.inner.state.lock();
                    st.note_closed();
                    st.stats.on_unhealthy();
                }
                conn.close().await;
                spawn_replenish(&self.inner);
                return;
            }
        }

        // Phase 3: hand to a waiter or park. The pool may have closed while
        // we were resetting.
        let leftover = {
            let mut st = self.inner.state.lock();
            if st.closed {
                st.note_closed();
                Some(conn)
            } else {
                st.dispatch_or_park(conn);
                None
            }
        };
        if let Some(conn) = leftover {
            conn.close().await;
        }
    }

    /// Close the pool.
    ///
    /// Idempotent. Fails all enrolled waiters with [`Error::PoolClosed`],
    /// closes idle sessions, and joins the health maintainer. Borrowed
    /// connections are closed as their guards release them. Every operation
    /// after close fails with `PoolClosed`, except close itself.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            let waiters = st.waiters.drain();
            st.stats.on_waiters_changed(0);
            let idle: Vec<PooledConn> = st.idle.drain(..).collect();
            for _ in 0..idle.len() {
                st.note_closed();
            }
            (idle, waiters)
        };

        let _ = self.inner.shutdown.send(true);

        let drained = waiters.len();
        for waiter in waiters {
            waiter.fail(Error::PoolClosed);
        }
        for conn in idle {
            conn.close().await;
        }

        let handle = self.inner.maintainer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("pool closed ({} waiters drained)", drained);
    }

    /// A consistent snapshot of pool statistics.
    pub fn stats(&self) -> PoolStats {
        let st = self.inner.state.lock();
        let mut snapshot = st.stats.clone();
        snapshot.current_waiters = st.waiters.live_len() as u64;
        snapshot
    }

    /// Number of live connections (idle + borrowed + being probed).
    pub fn size(&self) -> usize {
        self.inner.state.lock().total
    }

    /// Number of connections currently borrowed.
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use
    }

    /// Number of idle connections available for immediate handover.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

// ============================================================================
// Guard
// ============================================================================

/// A connection borrowed from the pool.
///
/// Dropping the guard returns the connection; [`release`](Self::release)
/// does the same but lets the caller await the hand-back (useful when the
/// next acquire must observe this release). Transport-fatal errors observed
/// through [`execute`](Self::execute) retire the connection on release;
/// query-level failures do not.
pub struct PooledConnection {
    conn: Option<PooledConn>,
    pool: Pool,
    failed: bool,
}

impl PooledConnection {
    pub(crate) fn new(conn: PooledConn, pool: Pool) -> Self {
        Self {
            conn: Some(conn),
            pool,
            failed: false,
        }
    }

    fn entry(&self) -> &PooledConn {
        self.conn.as_ref().expect("connection already released")
    }

    /// Stable identifier of the underlying connection, for logs.
    pub fn id(&self) -> u64 {
        self.entry().id
    }

    /// How many times this connection has been acquired.
    pub fn usage_count(&self) -> u64 {
        self.entry().usage_count
    }

    /// Age of the underlying connection.
    pub fn age(&self) -> Duration {
        self.entry().age()
    }

    /// Direct access to the driver session.
    ///
    /// Failures observed through this handle are invisible to the pool;
    /// call [`mark_failed`](Self::mark_failed) when the session breaks.
    pub fn session(&self) -> &dyn Session {
        self.entry().session.as_ref()
    }

    /// Execute a statement on this connection.
    ///
    /// Transport-fatal failures mark the connection for retirement; the
    /// error is returned either way.
    pub async fn execute(
        &mut self,
        statement: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let result = self.entry().session.execute(statement, params).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                self.failed = true;
            }
        }
        result
    }

    /// Report that the session failed in a way the pool cannot observe.
    ///
    /// The connection will be retired instead of returned to the idle set.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Release the connection and wait for the hand-back to complete.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            let failed = self.failed;
            drop(self);
            pool.release_conn(conn, failed).await;
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            let failed = self.failed;
            tokio::spawn(async move {
                pool.release_conn(conn, failed).await;
            });
        }
    }
}

// ============================================================================
// Session establishment and background replenishment
// ============================================================================

/// Establish one session: connect, authenticate, select namespace.
///
/// Each attempt is bounded by `connection_timeout`; attempts are separated
/// by at least `retry_delay` (exponential backoff with positive jitter).
/// Authentication rejections are never retried.
pub(crate) async fn establish_session(
    config: &PoolConfig,
    factory: &dyn SessionFactory,
) -> Result<Box<dyn Session>> {
    let attempts = config.retry_attempts.max(1);
    let mut last_err = Error::connection("no attempts made");

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(retry_backoff(attempt - 1, config.retry_delay)).await;
        }
        match timeout(config.connection_timeout, try_establish(config, factory)).await {
            Ok(Ok(session)) => return Ok(session),
            Ok(Err(err @ Error::AuthenticationFailed { .. })) => {
                warn!("authentication rejected, not retrying: {}", err);
                return Err(err);
            }
            Ok(Err(err)) => {
                warn!(
                    "connection attempt {}/{} failed: {}",
                    attempt + 1,
                    attempts,
                    err
                );
                last_err = err;
            }
            Err(_) => {
                warn!(
                    "connection attempt {}/{} timed out after {:?}",
                    attempt + 1,
                    attempts,
                    config.connection_timeout
                );
                last_err = Error::connection(format!(
                    "attempt timed out after {:?}",
                    config.connection_timeout
                ));
            }
        }
    }

    Err(Error::connection(format!(
        "failed to establish session after {attempts} attempts: {last_err}"
    )))
}

async fn try_establish(
    config: &PoolConfig,
    factory: &dyn SessionFactory,
) -> Result<Box<dyn Session>> {
    let session = factory.connect(config).await?;
    if let Some(credentials) = &config.credentials {
        if let Err(e) = session.authenticate(credentials).await {
            let _ = session.close().await;
            return Err(e);
        }
    }
    if let (Some(ns), Some(db)) = (&config.namespace, &config.database) {
        if let Err(e) = session.use_namespace(ns, db).await {
            let _ = session.close().await;
            return Err(e);
        }
    }
    Ok(session)
}

/// Exponential backoff with positive jitter.
///
/// Never below `base` (the configured `retry_delay`); the exponential part
/// is capped at 30 seconds.
fn retry_backoff(attempt: u32, base: Duration) -> Duration {
    const CAP: Duration = Duration::from_secs(30);
    let exp = base.saturating_mul(2u32.saturating_pow(attempt)).min(CAP);
    exp + exp.mul_f64(0.25 * rand::random::<f64>())
}

/// Launch a background replenish pass.
pub(crate) fn spawn_replenish(inner: &Arc<PoolInner>) {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        if let Some(inner) = weak.upgrade() {
            replenish(&inner).await;
        }
    });
}

/// Create connections while the pool is below `min_size`, or while live
/// waiters could be served with spare capacity.
///
/// Never raises: a failed construction is logged, counted, forwarded to at
/// most one waiter, and stops the pass.
pub(crate) async fn replenish(inner: &Arc<PoolInner>) {
    loop {
        let should_create = {
            let mut st = inner.state.lock();
            if st.closed {
                return;
            }
            let below_min = st.total + st.creating < inner.config.min_size;
            let waiter_demand =
                !st.waiters.is_empty() && st.total + st.creating < inner.config.max_size;
            if below_min || waiter_demand {
                st.creating += 1;
                true
            } else {
                false
            }
        };
        if !should_create {
            return;
        }

        match establish_session(&inner.config, inner.factory.as_ref()).await {
            Ok(session) => {
                let closed = {
                    let mut st = inner.state.lock();
                    st.creating -= 1;
                    st.closed
                };
                if closed {
                    let _ = session.close().await;
                    return;
                }
                let mut st = inner.state.lock();
                let conn = st.register(session);
                debug!("replenished pool with connection {}", conn.id);
                st.dispatch_or_park(conn);
            }
            Err(e) => {
                let woken = {
                    let mut st = inner.state.lock();
                    st.creating -= 1;
                    st.stats.on_error();
                    let waiter = st.waiters.pop_live();
                    if waiter.is_some() {
                        let live_len = st.waiters.live_len();
                        st.stats.on_waiters_changed(live_len);
                    }
                    waiter
                };
                warn!("background connection construction failed: {}", e);
                if let Some(waiter) = woken {
                    waiter.fail(e);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_floor() {
        let base = Duration::from_millis(100);
        for attempt in 0..5 {
            assert!(retry_backoff(attempt, base) >= base);
        }
    }

    #[test]
    fn test_retry_backoff_growth_and_cap() {
        let base = Duration::from_millis(100);

        // Exponential part doubles per attempt: 100, 200, 400 (± jitter).
        let d0 = retry_backoff(0, base);
        let d2 = retry_backoff(2, base);
        assert!(d0 <= Duration::from_millis(125));
        assert!(d2 >= Duration::from_millis(400));
        assert!(d2 <= Duration::from_millis(500));

        // Deep attempts saturate at the cap plus jitter.
        let deep = retry_backoff(30, base);
        assert!(deep <= Duration::from_secs(30) + Duration::from_millis(7500));
    }
}
