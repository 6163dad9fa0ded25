//! Error types for mhaug-nn.

use thiserror::Error;

/// Errors raised by the model, the augmentation controller and the trainer.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Graph store, mask or loader error.
    #[error(transparent)]
    Core(#[from] mhaug_core::Error),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// No proposal was accepted within the attempt bound.
    #[error("no augmentation accepted after {attempts} proposals")]
    AcceptanceExhausted { attempts: usize },

    /// No proposal was accepted before the deadline.
    #[error("no augmentation accepted within {secs:.1}s ({attempts} proposals)")]
    AcceptanceTimeout { secs: f64, attempts: usize },

    /// A collective round could not complete.
    #[error("collective error: {0}")]
    Collective(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
