//! Error taxonomy for the GoMind core.
//!
//! Every failure is a result value carrying a classified kind:
//! - `invalid-configuration`: unparseable URL, invalid port, bad config
//! - `connection-failed`: store unreachable after bounded startup retries
//! - `service-not-found`: lookup or health update hit an expired/unknown id
//! - `marshal`/`unmarshal`: JSON (de)serialization failures
//! - `transient-store-error`: any other store I/O error, retried internally

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the registry, discovery, and store layers.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("marshal error: {0}")]
    Marshal(#[source] serde_json::Error),

    #[error("unmarshal error: {0}")]
    Unmarshal(#[source] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("store operation '{op}' timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
}

/// Coarse error classification used by callers that branch on kind
/// rather than on the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfiguration,
    ConnectionFailed,
    ServiceNotFound,
    Marshal,
    Unmarshal,
    TransientStore,
}

impl CoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            CoreError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            CoreError::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            CoreError::Marshal(_) => ErrorKind::Marshal,
            CoreError::Unmarshal(_) => ErrorKind::Unmarshal,
            CoreError::Store(_) | CoreError::Timeout { .. } => ErrorKind::TransientStore,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientStore
    }

    /// Whether this is the distinguished `service-not-found` kind that
    /// triggers heartbeat self-healing.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::ServiceNotFound
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;
