//! Error types for row store operations.

/// Error type returned by [`Store`](crate::Store) implementations.
///
/// The write-retention buffer never reinterprets these errors: they are
/// either returned to the caller (pass-through writes and reads) or logged
/// when a buffered flush fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or rejected the request.
    ///
    /// Typically transient: network failures, region moves, timeouts.
    Unavailable(String),

    /// Internal errors indicating bugs or invariant violations, such as a
    /// counter column holding a value that is not an 8-byte integer.
    Internal(String),
}

impl std::error::Error for StoreError {}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            StoreError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// Result type alias for row store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
