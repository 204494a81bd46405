//! Error types for tidepool
//!
//! Provides granular error classification for proper retry handling:
//! - Retriable errors (connection establishment, timeouts)
//! - Non-retriable errors (authentication, configuration)
//! - Transport-fatal vs query-level failures, which gates connection
//!   retirement on release

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for tidepool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration errors (raised at construction only)
    Configuration,
    /// Connection establishment errors (retriable)
    Connection,
    /// Authentication failures (never retried)
    Authentication,
    /// Timeout errors (retriable)
    Timeout,
    /// Query execution errors (non-fatal to the session)
    Query,
    /// Health probe failures (internal, cause retirement)
    Probe,
    /// Operations on a closed pool
    Closed,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

/// Main error type for tidepool
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid pool configuration
    #[error("configuration error: {message}")]
    Configuration {
        /// What was wrong with the configuration
        message: String,
    },

    /// Connection establishment failed after exhausting retries
    #[error("connection failed: {message}")]
    ConnectionFailed {
        /// Description of the failure
        message: String,
        /// Underlying transport error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication was rejected by the server
    #[error("authentication failed: {message}")]
    AuthenticationFailed {
        /// Server-reported reason
        message: String,
    },

    /// No connection became available before the acquisition deadline
    #[error("acquire timed out after {waited:?}")]
    AcquireTimeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// The pool has been closed
    #[error("pool is closed")]
    PoolClosed,

    /// A liveness probe failed
    #[error("health probe failed: {message}")]
    ProbeFailed {
        /// Description of the probe failure
        message: String,
    },

    /// Query execution failed; the session itself remains usable
    #[error("query failed: {message}")]
    QueryFailed {
        /// Server-reported failure
        message: String,
        /// Underlying transport error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The underlying session is no longer usable
    #[error("session invalid: {message}")]
    SessionInvalid {
        /// Why the session became unusable
        message: String,
    },

    /// Internal invariant violation
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violation
        message: String,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::ConnectionFailed { .. } | Self::SessionInvalid { .. } => {
                ErrorCategory::Connection
            }
            Self::AuthenticationFailed { .. } => ErrorCategory::Authentication,
            Self::AcquireTimeout { .. } => ErrorCategory::Timeout,
            Self::QueryFailed { .. } => ErrorCategory::Query,
            Self::ProbeFailed { .. } => ErrorCategory::Probe,
            Self::PoolClosed => ErrorCategory::Closed,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error means the session can no longer be trusted.
    ///
    /// A fatal error retires the connection on release; a query-level
    /// failure does not.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::SessionInvalid { .. }
                | Self::AuthenticationFailed { .. }
                | Self::ProbeFailed { .. }
        )
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::QueryFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a probe error
    pub fn probe(message: impl Into<String>) -> Self {
        Self::ProbeFailed {
            message: message.into(),
        }
    }

    /// Create a session-invalid error
    pub fn session_invalid(message: impl Into<String>) -> Self {
        Self::SessionInvalid {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Connection => write!(f, "connection"),
            Self::Authentication => write!(f, "authentication"),
            Self::Timeout => write!(f, "timeout"),
            Self::Query => write!(f, "query"),
            Self::Probe => write!(f, "probe"),
            Self::Closed => write!(f, "closed"),
            Self::Other => write!(f, "other"),
        }
    }
}
