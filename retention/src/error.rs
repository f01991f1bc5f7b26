//! Error types for the write-retention buffer.
//!
//! This module defines [`Error`], returned by buffer construction and
//! shutdown, along with a convenient [`Result`] type alias. Buffered writes
//! themselves report failures through [`StoreError`], the error type of the
//! [`Store`](common::Store) contract the buffer implements.

use common::StoreError;

/// Error type for write-retention buffer lifecycle operations.
///
/// # Error Categories
///
/// - [`InvalidConfig`](Error::InvalidConfig): the buffer was configured with
///   values it cannot honour, such as a zero retention window.
/// - [`Store`](Error::Store): an error from the backing store surfaced
///   outside of a buffered flush.
/// - [`Internal`](Error::Internal): unexpected failures such as a panicked
///   eviction worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid configuration, detected at construction.
    InvalidConfig(String),

    /// Errors from the backing store.
    Store(StoreError),

    /// Internal errors indicating bugs or invariant violations.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::Store(err) => write!(f, "Store error: {}", err),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("eviction worker failed: {}", err))
    }
}

/// Result type alias for write-retention buffer operations.
pub type Result<T> = std::result::Result<T, Error>;
