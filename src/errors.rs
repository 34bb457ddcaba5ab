//! Error hierarchy for the election bridge
//!
//! Errors are grouped by the component that raises them. None of them cross
//! the boundary directly: [`crate::gateway`] folds every one into an
//! [`crate::ErrorCode`].

use std::time::Duration;

use config::ConfigError;
use tonic::Code;

use crate::registry::Handle;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failures reported by (or while talking to) the key-value store
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Handle resolution failures
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Lease/session lifecycle failures
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Campaign, observe and resign failures
    #[error(transparent)]
    Election(#[from] ElectionError),

    /// Settings loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Store-side error taxonomy
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A gRPC status returned by the store
    #[error("store returned {code:?}: {message}")]
    Status { code: Code, message: String },

    /// The caller gave up on the operation
    #[error("operation canceled")]
    Canceled,

    /// The per-call deadline elapsed
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The requested revision is no longer part of the store history
    #[error("required revision {requested} has been compacted (compacted at {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    /// A watch stream ended without being asked to
    #[error("watch stream closed")]
    WatchClosed,

    /// Connection could not be established or was torn down
    #[error("transport failure: {0}")]
    Transport(String),

    /// Request rejected before reaching the store
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    pub(crate) fn status(
        code: Code,
        message: impl Into<String>,
    ) -> Self {
        StoreError::Status {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn unavailable() -> Self {
        Self::status(Code::Unavailable, "store is unreachable")
    }
}

impl From<tonic::Status> for StoreError {
    fn from(status: tonic::Status) -> Self {
        StoreError::Status {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::DeadlineExceeded(Duration::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No entry under this handle (never allocated or already released)
    #[error("object {0} does not exist")]
    NotFound(Handle),

    /// The entry holds a different variant than the caller asked for
    #[error("object {handle} is a {found}, expected {expected}")]
    TypeMismatch {
        handle: Handle,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Lease could not be granted
    #[error("lease grant with ttl {ttl}s failed: {source}")]
    Grant {
        ttl: i64,
        #[source]
        source: StoreError,
    },

    /// ttl must be a positive number of seconds
    #[error("invalid session ttl: {0}")]
    InvalidTtl(i64),

    /// Keepalive gave up or the store reported the lease gone
    #[error("session for lease {0:x} expired")]
    Expired(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// No candidate entry exists under the prefix
    #[error("election {0} has no leader")]
    NoLeader(String),

    /// Compare-guarded resign found no matching leader record
    #[error("not the current leader of {0}")]
    NotLeader(String),

    /// Operation not permitted in the current state
    #[error("election is {actual}, operation requires {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The session backing the campaign was lost
    #[error("session lost during {0}")]
    SessionLost(&'static str),

    /// Campaign or observe was canceled by the caller
    #[error("{0} canceled")]
    Canceled(&'static str),

    /// Campaign did not finish before its deadline
    #[error("campaign timed out after {0:?}")]
    Timeout(Duration),

    /// Observer stream ended before a leadership change was seen
    #[error("observer stream closed prematurely")]
    ObserverClosed,

    /// The liveness probe failed while observing
    #[error("liveness probe failed: {0}")]
    ProbeFailed(#[source] StoreError),
}
