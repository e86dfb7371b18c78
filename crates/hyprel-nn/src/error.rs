//! Error types for hyprel-nn.

use thiserror::Error;

/// Layer-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Composition operator name not recognised.
    #[error("unsupported composition operator: {0}")]
    UnsupportedOperator(String),

    /// Rotation composition needs real and imaginary halves.
    #[error("rotate composition needs an even embedding dimension, got {0}")]
    OddDimension(usize),

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Graph arrays reference ids outside the declared vocabulary.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
