//! Error types for mhaug-core.

use thiserror::Error;

/// Errors raised by the graph store, the samplers and the multi-view loader.
#[derive(Error, Debug)]
pub enum Error {
    /// The org/prev/cur views disagree on seeds, batch boundaries or batch count.
    #[error("view alignment violated: {0}")]
    Alignment(String),

    /// A mask write was rejected (wrong length, negative weight, immutable view).
    #[error("mask error: {0}")]
    Mask(String),

    /// Partition book or node split misuse.
    #[error("partition error: {0}")]
    Partition(String),

    /// Invalid sampler or loader configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Malformed dataset (inconsistent lengths, dangling edges).
    #[error("dataset error: {0}")]
    Dataset(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for mhaug-core.
pub type Result<T> = std::result::Result<T, Error>;
