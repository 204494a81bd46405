//! Pooled connection record
//!
//! Wraps one transport session with the bookkeeping the pool core needs:
//! usage counting, health, and the timestamps that drive retirement.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::PoolConfig;
use crate::session::Session;

/// Why a connection was removed from the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// A probe or caller-observed failure invalidated the session
    Unhealthy,
    /// The connection served `max_usage_count` acquisitions
    MaxUsage,
    /// The connection reached `max_lifetime`
    Expired,
    /// The connection idled past `max_idle_time` with the pool above minimum
    Idle,
}

impl std::fmt::Display for RetireReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::MaxUsage => write!(f, "max usage"),
            Self::Expired => write!(f, "expired"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// One live session plus pool bookkeeping.
///
/// Owned by exactly one place at a time: the idle set, a borrower's guard,
/// the maintainer (while probing), or a waiter's delivery slot.
pub(crate) struct PooledConn {
    pub(crate) id: u64,
    pub(crate) session: Box<dyn Session>,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) usage_count: u64,
    pub(crate) in_use: bool,
    pub(crate) healthy: bool,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("usage_count", &self.usage_count)
            .field("in_use", &self.in_use)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl PooledConn {
    pub(crate) fn new(id: u64, session: Box<dyn Session>) -> Self {
        let now = Instant::now();
        Self {
            id,
            session,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
            in_use: false,
            healthy: true,
        }
    }

    /// Stamp an acquisition
    pub(crate) fn mark_used(&mut self) {
        self.in_use = true;
        self.usage_count += 1;
        self.last_used_at = Instant::now();
    }

    /// Stamp a release
    pub(crate) fn mark_free(&mut self) {
        self.in_use = false;
        self.last_used_at = Instant::now();
    }

    /// Invalidate the session. Idempotent; never transitions back.
    pub(crate) fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn idle_duration(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// Check the retirement criteria against `config`.
    ///
    /// `over_min` tells whether the pool currently holds more than
    /// `min_size` connections; the idle criterion only applies then.
    pub(crate) fn retire_reason(
        &self,
        config: &PoolConfig,
        over_min: bool,
    ) -> Option<RetireReason> {
        if !self.healthy {
            return Some(RetireReason::Unhealthy);
        }
        if self.usage_count >= config.max_usage_count {
            return Some(RetireReason::MaxUsage);
        }
        if self.age() >= config.max_lifetime {
            return Some(RetireReason::Expired);
        }
        if over_min && !self.in_use && self.idle_duration() >= config.max_idle_time {
            return Some(RetireReason::Idle);
        }
        None
    }

    /// Terminate the session. Close failures are logged and swallowed; the
    /// driver's close is best-effort by contract.
    pub(crate) async fn close(self) {
        if let Err(e) = self.session.close().await {
            debug!("error closing connection {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::error::Result;
    use async_trait::async_trait;

    struct StubSession;

    #[async_trait]
    impl Session for StubSession {
        async fn authenticate(&self, _credentials: &Credentials) -> Result<()> {
            Ok(())
        }

        async fn use_namespace(&self, _namespace: &str, _database: &str) -> Result<()> {
            Ok(())
        }

        async fn execute(
            &self,
            _statement: &str,
            _params: serde_json::Value,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn conn() -> PooledConn {
        PooledConn::new(1, Box::new(StubSession))
    }

    #[test]
    fn test_mark_used_and_free() {
        let mut c = conn();
        assert!(!c.in_use);
        assert_eq!(c.usage_count, 0);

        c.mark_used();
        assert!(c.in_use);
        assert_eq!(c.usage_count, 1);

        c.mark_used();
        assert_eq!(c.usage_count, 2);
    }

    #[test]
    fn test_mark_unhealthy_is_sticky() {
        let mut c = conn();
        assert!(c.healthy);
        c.mark_unhealthy();
        assert!(!c.healthy);
        c.mark_unhealthy();
        assert!(!c.healthy);
    }

    #[test]
    fn test_retire_reason_ordering() {
        let config = PoolConfig::new("ws://localhost/rpc").with_max_usage_count(2);
        let mut c = conn();
        c.mark_free();

        assert_eq!(c.retire_reason(&config, false), None);

        c.mark_used();
        c.mark_used();
        c.mark_free();
        assert_eq!(c.retire_reason(&config, false), Some(RetireReason::MaxUsage));

        // Unhealthy takes precedence over everything else
        c.mark_unhealthy();
        assert_eq!(c.retire_reason(&config, false), Some(RetireReason::Unhealthy));
    }

    #[test]
    fn test_retire_reason_expired() {
        let config = PoolConfig::new("ws://localhost/rpc").with_max_lifetime(Duration::ZERO);
        // Duration::ZERO would fail validate(); fine for exercising the check.
        let mut c = conn();
        c.mark_free();
        assert_eq!(c.retire_reason(&config, false), Some(RetireReason::Expired));
    }

    #[test]
    fn test_retire_reason_idle_requires_over_min() {
        let config = PoolConfig::new("ws://localhost/rpc").with_max_idle_time(Duration::ZERO);
        let mut c = conn();
        c.mark_free();

        assert_eq!(c.retire_reason(&config, false), None);
        assert_eq!(c.retire_reason(&config, true), Some(RetireReason::Idle));
    }

    #[test]
    fn test_retire_reason_display() {
        assert_eq!(RetireReason::Unhealthy.to_string(), "unhealthy");
        assert_eq!(RetireReason::MaxUsage.to_string(), "max usage");
        assert_eq!(RetireReason::Expired.to_string(), "expired");
        assert_eq!(RetireReason::Idle.to_string(), "idle");
    }
}
