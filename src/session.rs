//! Transport seam for tidepool
//!
//! The pool does not speak to the database itself. It drives an external
//! driver through two object-safe traits:
//! - [`Session`]: one live RPC session (authenticate, namespace selection,
//!   statement execution, liveness probe)
//! - [`SessionFactory`]: opens new sessions
//!
//! Statements and parameters are [`serde_json::Value`]s, which is the shape
//! document/graph databases exchange over their WebSocket RPC protocols.
//!
//! # Error contract
//!
//! Drivers must distinguish transport-fatal failures from query-level
//! failures: return [`Error::SessionInvalid`] (or `ConnectionFailed`) when
//! the session can no longer be used, and [`Error::QueryFailed`] when the
//! statement failed but the session is fine. The pool retires connections
//! only on fatal errors.
//!
//! [`Error::SessionInvalid`]: crate::error::Error::SessionInvalid
//! [`Error::QueryFailed`]: crate::error::Error::QueryFailed

use async_trait::async_trait;

use crate::config::{Credentials, PoolConfig};
use crate::error::Result;

/// A live session with the database server.
///
/// A session is owned by exactly one pooled connection and is never shared;
/// the pool guarantees single-caller access while a connection is borrowed.
#[async_trait]
pub trait Session: Send + Sync {
    /// Authenticate the session
    async fn authenticate(&self, credentials: &Credentials) -> Result<()>;

    /// Select the namespace and database for subsequent statements
    async fn use_namespace(&self, namespace: &str, database: &str) -> Result<()>;

    /// Execute a statement with JSON parameters
    async fn execute(&self, statement: &str, params: serde_json::Value)
        -> Result<serde_json::Value>;

    /// Lightweight liveness probe
    async fn ping(&self) -> Result<()>;

    /// Restore the session to a known-good state before it is reused.
    ///
    /// Called on release when `reset_on_return` is configured. What "reset"
    /// means is driver-specific (commonly re-issuing namespace/database
    /// selection); the default is a no-op. A reset failure retires the
    /// connection.
    async fn reset(&self) -> Result<()> {
        Ok(())
    }

    /// Close the session. Idempotent best-effort.
    async fn close(&self) -> Result<()>;
}

/// Factory for opening new sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a raw session to `config.uri`, honoring `config.tls` when set.
    ///
    /// The pool applies `connection_timeout`, authentication, and
    /// namespace selection around this call; implementations only need to
    /// establish the transport.
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn Session>>;
}
