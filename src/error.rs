//! Crate-wide error taxonomy.
//!
//! Every fallible public operation returns `Result<T>`. Background tasks never
//! propagate `Error` to external callers: they log it and update health state
//! instead (see `health::monitor`).

use thiserror::Error;

/// A single, internally consistent error enum covering every kind named in
/// the error handling design: transient network, no quorum, conflict, not
/// holder, configuration, and fatal.
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("backpressure: queue full, retry later")]
    Overloaded,

    #[error("no quorum: {0}")]
    NoQuorum(String),

    #[error("compare-and-swap failed: expected version {expected}, found {found:?}")]
    CasFailed { expected: u64, found: Option<u64> },

    #[error("replication conflict for record {record_id}: {reason}")]
    ReplicationConflict { record_id: String, reason: String },

    #[error("caller does not hold lock on {resource_key} (fencing token {presented} stale)")]
    NotHolder { resource_key: String, presented: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("check '{0}' is already registered with a different probe")]
    AlreadyRegistered(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse-grained error kind, matching the `(kind, message, retryable)`
/// surfaced shape external callers rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Timeout,
    Overloaded,
    NoQuorum,
    CasFailed,
    ReplicationConflict,
    NotHolder,
    Config,
    AlreadyRegistered,
    Network,
    Serialization,
    Repository,
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Overloaded => ErrorKind::Overloaded,
            Error::NoQuorum(_) => ErrorKind::NoQuorum,
            Error::CasFailed { .. } => ErrorKind::CasFailed,
            Error::ReplicationConflict { .. } => ErrorKind::ReplicationConflict,
            Error::NotHolder { .. } => ErrorKind::NotHolder,
            Error::Config(_) => ErrorKind::Config,
            Error::AlreadyRegistered(_) => ErrorKind::AlreadyRegistered,
            Error::Network(_) => ErrorKind::Network,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Repository(_) => ErrorKind::Repository,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether re-issuing the same call with the same arguments is safe.
    /// Writes are idempotent keyed by `record_id` or `(key, expected_version)`,
    /// so transient and capacity errors are retryable; conflicts and
    /// configuration errors are not (the caller must re-read state first).
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Overloaded | Error::NoQuorum(_) | Error::Network(_)
        )
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}
