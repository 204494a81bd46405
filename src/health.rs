//! Background health maintainer
//!
//! A single long-lived task per pool. Each tick it probes idle connections
//! that have been sitting long enough to be suspect, retires the ones that
//! fail, reaps idle connections beyond `min_size`, and refills the pool
//! toward `min_size`. It holds only a weak handle to the pool, so the pool
//! is never kept alive by its own maintainer; `Pool::close` signals the
//! watch channel and joins the task.
//!
//! The lock is never held across network I/O: probe candidates are pulled
//! out of the idle set (tracked by the `checking` count) and re-admitted or
//! retired afterwards.

use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

use crate::conn::PooledConn;
use crate::pool::{replenish, PoolInner};

pub(crate) fn spawn(pool: Weak<PoolInner>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = match pool.upgrade() {
            Some(inner) => inner.config.health_check_interval,
            None => return,
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // interval yields immediately on the first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("health maintainer stopping");
                        return;
                    }
                    continue;
                }
            }
            let Some(inner) = pool.upgrade() else { return };
            run_tick(&inner).await;
        }
    })
}

async fn run_tick(inner: &Arc<PoolInner>) {
    let period = inner.config.health_check_interval;

    // Pull probe candidates out of the idle set: connections idle for at
    // least half a tick, or within one tick of their lifetime limit. They
    // remain counted in the pool total through `checking`.
    let candidates: Vec<PooledConn> = {
        let mut st = inner.state.lock();
        if st.closed {
            return;
        }
        let mut keep = std::collections::VecDeque::with_capacity(st.idle.len());
        let mut picked = Vec::new();
        while let Some(conn) = st.idle.pop_front() {
            let probe_due = conn.idle_duration() >= period / 2
                || conn.age() + period >= inner.config.max_lifetime;
            if probe_due {
                picked.push(conn);
            } else {
                keep.push_back(conn);
            }
        }
        st.idle = keep;
        st.checking += picked.len();
        picked
    };

    // Probe outside the lock, each bounded by connection_timeout.
    for mut conn in candidates {
        let probe = timeout(inner.config.connection_timeout, conn.session.ping()).await;
        let failure = match probe {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("probe timed out".to_string()),
        };

        let retired = {
            let mut st = inner.state.lock();
            st.checking -= 1;
            st.stats.on_health_check();
            if st.closed {
                st.note_closed();
                Some(conn)
            } else if failure.is_none() {
                st.dispatch_or_park(conn);
                None
            } else {
                conn.mark_unhealthy();
                st.note_closed();
                st.stats.on_unhealthy();
                Some(conn)
            }
        };
        if let Some(conn) = retired {
            if let Some(reason) = failure {
                warn!("probe failed for connection {}: {}", conn.id, reason);
            }
            conn.close().await;
        }
    }

    // Reap cold idle connections while the pool stays above min_size. The
    // front of the idle deque is the coldest (LIFO from the back).
    let reaped: Vec<PooledConn> = {
        let mut st = inner.state.lock();
        if st.closed {
            return;
        }
        // Every probe candidate has been re-admitted or retired by now.
        debug_assert_eq!(st.checking, 0);
        let mut reaped = Vec::new();
        while st.total > inner.config.min_size {
            let due = st
                .idle
                .front()
                .map(|c| c.idle_duration() >= inner.config.max_idle_time)
                .unwrap_or(false);
            if !due {
                break;
            }
            if let Some(conn) = st.idle.pop_front() {
                st.note_closed();
                reaped.push(conn);
            }
        }
        reaped
    };
    for conn in reaped {
        debug!("reaping idle connection {}", conn.id);
        conn.close().await;
    }

    // Refill toward min_size.
    replenish(inner).await;
}
