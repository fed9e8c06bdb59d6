//! Error types for Ratebucket.

use thiserror::Error;

use crate::store::{BackendError, LifecycleError};

/// Main error type for Ratebucket operations.
#[derive(Error, Debug)]
pub enum RateBucketError {
    /// Limiter parameters failed validation
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    /// A non-positive token count was requested
    #[error("Invalid token count: {0} (must be at least 1)")]
    InvalidTokenCount(i64),

    /// Errors surfaced by a storage backend, passed through unchanged
    #[error(transparent)]
    Backend(BackendError),

    /// Store lifecycle errors
    #[error("Store lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratebucket operations.
pub type Result<T> = std::result::Result<T, RateBucketError>;
