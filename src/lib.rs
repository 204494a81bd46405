//! # tidepool
//!
//! An async connection pool for document/graph databases accessed over a
//! WebSocket-based RPC protocol.
//!
//! The pool amortizes session setup (transport handshake, optional TLS,
//! authentication, namespace/database selection, one-time schema bootstrap)
//! across many short-lived logical operations, enforces bounded resource
//! usage, and admits concurrent acquirers fairly with bounded latency.
//!
//! ## Features
//!
//! - **Elastic sizing**: warm `min_size` connections eagerly, grow on
//!   demand to `max_size`, shrink through idle reaping
//! - **Fair admission**: strict-FIFO waiter queue with per-waiter deadlines
//!   and cancellation
//! - **Self-healing**: background maintainer probes idle connections,
//!   retires stale or broken ones, and refills toward the minimum
//! - **Driver-agnostic**: any transport implementing the [`Session`] /
//!   [`SessionFactory`] seam can be pooled
//! - **Observable**: consistent [`PoolStats`] snapshots
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tidepool::prelude::*;
//!
//! let config = PoolConfig::new("wss://db.example.com/rpc")
//!     .with_credentials(Credentials::new("app", "secret"))
//!     .with_namespace("app", "main")
//!     .with_min_size(2)
//!     .with_max_size(10);
//!
//! let pool = Pool::new(config, factory).await?;
//!
//! // Guard-style: the connection returns to the pool on drop
//! let mut conn = pool.acquire().await?;
//! let users = conn.execute("SELECT * FROM user", serde_json::json!({})).await?;
//! drop(conn);
//!
//! // Scoped: release is guaranteed on every exit path
//! let n = pool
//!     .with_connection(|mut conn| async move {
//!         let r = conn.execute("SELECT count() FROM user", serde_json::json!({})).await;
//!         (conn, r)
//!     })
//!     .await?;
//!
//! pool.close().await;
//! ```
//!
//! [`Session`]: session::Session
//! [`SessionFactory`]: session::SessionFactory
//! [`PoolStats`]: stats::PoolStats

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
mod conn;
pub mod error;
mod health;
pub mod pool;
pub mod registry;
pub mod session;
pub mod stats;
mod waiter;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Configuration
    pub use crate::config::{Credentials, PoolConfig, TlsConfig};

    // Transport seam
    pub use crate::session::{Session, SessionFactory};

    // Pool types
    pub use crate::pool::{Pool, PooledConnection};
    pub use crate::registry::PoolRegistry;
    pub use crate::stats::PoolStats;
}

// Re-export commonly used items at crate root
pub use config::PoolConfig;
pub use error::{Error, Result};
pub use pool::{Pool, PooledConnection};
pub use stats::PoolStats;
