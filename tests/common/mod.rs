//! Shared mock transport driver for integration tests.
//!
//! The driver is scripted through a shared [`DriverState`]: tests flip
//! failure switches and read counters to observe what the pool did.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tidepool::config::{Credentials, PoolConfig};
use tidepool::error::{Error, Result};
use tidepool::session::{Session, SessionFactory};

/// Observable state shared between a test and its mock driver.
#[derive(Default)]
pub struct DriverState {
    /// Connect attempts (including ones that are scripted to fail).
    pub connects: AtomicU64,
    /// Fail this many upcoming connect attempts.
    pub fail_next_connects: AtomicU32,
    /// Delay applied to every connect.
    pub connect_delay_ms: AtomicU64,
    /// Reject every authentication attempt.
    pub reject_auth: AtomicBool,
    /// Authentication attempts.
    pub auths: AtomicU64,
    /// Namespace selections.
    pub namespace_selects: AtomicU64,
    /// Fail every ping.
    pub fail_pings: AtomicBool,
    /// Pings served (pass or fail).
    pub pings: AtomicU64,
    /// Make every execute fail fatally (session unusable).
    pub fatal_executes: AtomicBool,
    /// Make every execute fail at the query level (session fine).
    pub query_failures: AtomicBool,
    /// Statements seen by any session.
    pub statements: Mutex<Vec<String>>,
    /// Reset calls.
    pub resets: AtomicU64,
    /// Fail every reset.
    pub fail_resets: AtomicBool,
    /// Sessions closed (each session counted once).
    pub sessions_closed: AtomicU64,
}

pub struct MockFactory {
    state: Arc<DriverState>,
}

impl MockFactory {
    /// Build a factory and the state handle used to script and observe it.
    pub fn new() -> (Arc<DriverState>, Arc<MockFactory>) {
        let state = Arc::new(DriverState::default());
        let factory = Arc::new(MockFactory {
            state: state.clone(),
        });
        (state, factory)
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn connect(&self, _config: &PoolConfig) -> Result<Box<dyn Session>> {
        let delay = self.state.connect_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let scripted_failure = self
            .state
            .fail_next_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(Error::connection("mock connect refused"));
        }
        Ok(Box::new(MockSession {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MockSession {
    state: Arc<DriverState>,
    closed: AtomicBool,
}

#[async_trait]
impl Session for MockSession {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<()> {
        self.state.auths.fetch_add(1, Ordering::SeqCst);
        if self.state.reject_auth.load(Ordering::SeqCst) {
            return Err(Error::authentication("mock rejected credentials"));
        }
        Ok(())
    }

    async fn use_namespace(&self, _namespace: &str, _database: &str) -> Result<()> {
        self.state.namespace_selects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(
        &self,
        statement: &str,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.state.statements.lock().push(statement.to_string());
        if self.state.fatal_executes.load(Ordering::SeqCst) {
            return Err(Error::session_invalid("mock transport broke"));
        }
        if self.state.query_failures.load(Ordering::SeqCst) {
            return Err(Error::query("mock query rejected"));
        }
        Ok(serde_json::json!({ "ok": true }))
    }

    async fn ping(&self) -> Result<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(Error::probe("mock ping failed"));
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.state.resets.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_resets.load(Ordering::SeqCst) {
            return Err(Error::session_invalid("mock reset failed"));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Base configuration with test-friendly timings.
pub fn test_config() -> PoolConfig {
    PoolConfig::new("ws://mock.local/rpc")
        .with_connection_timeout(Duration::from_secs(1))
        .with_acquisition_timeout(Duration::from_secs(2))
        .with_retry(1, Duration::from_millis(50))
}
