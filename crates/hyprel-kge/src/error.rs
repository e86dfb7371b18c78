use thiserror::Error;

/// Errors that can occur in hyprel-kge.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Candle tensor error.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    /// Error raised by a convolution layer or graph builder.
    #[error("Layer error: {0}")]
    Layer(#[from] hyprel_nn::Error),
    /// Invalid or inconsistent configuration.
    #[error("Config error: {0}")]
    Config(String),
    /// Malformed dataset line.
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    /// Entity name not present in the vocabulary.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
    /// Relation name not present in the vocabulary.
    #[error("Relation not found: {0}")]
    RelationNotFound(String),
    /// Validation error.
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias for hyprel-kge.
pub type Result<T> = std::result::Result<T, Error>;
