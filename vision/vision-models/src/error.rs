//! Error types for vision-models crate.

use thiserror::Error;
use vision_layers::LayerError;
use vision_types::ShapeError;

/// Errors that can occur while building or running models.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Invalid model configuration.
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    /// A block failed to materialize or run.
    #[error(transparent)]
    Layer(#[from] LayerError),

    /// Shape arithmetic or rank validation failed.
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

impl ModelError {
    /// Creates an invalid config error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }
}

impl From<ModelError> for LayerError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidConfig(reason) => Self::InvalidConfig(reason),
            ModelError::Layer(err) => err,
            ModelError::Shape(err) => Self::Shape(err),
        }
    }
}

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;
