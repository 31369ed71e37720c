//! Error type for the data model and post-processing stages.

use thiserror::Error;

/// Errors raised while building or post-processing field-line data.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown preset '{name}'. Available presets: {available}")]
    UnknownPreset { name: String, available: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
