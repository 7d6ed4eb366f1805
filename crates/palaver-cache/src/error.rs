use thiserror::Error;

/// Errors produced by the cache layer.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Backend-specific failure (connection, protocol, ...).
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// Cached value did not round-trip through JSON.
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
