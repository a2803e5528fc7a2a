//! Error types for progan-rs.
//!
//! Configuration problems (image size that does not match the stage count, a non-zero
//! momentum term, an epoch budget too small for the schedule, an unknown adversarial mode)
//! are reported as [`ProGanError::Config`] while the model is being built and abort
//! initialization. Numerically unstable losses are *not* errors: the training step skips
//! backpropagation for that loss and records the skip in the loss record.
//!
//! # Example
//!
//! ```rust
//! use progan_rs::{ProGanConfig, ProGanError};
//!
//! match ProGanConfig::from_preset("no-such-preset") {
//!     Ok(_) => unreachable!(),
//!     Err(ProGanError::Config(msg)) => assert!(msg.contains("no-such-preset")),
//!     Err(e) => panic!("unexpected error: {e}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for progan-rs operations.
pub type Result<T> = std::result::Result<T, ProGanError>;

/// Errors that can occur in progan-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProGanError {
    /// Invalid configuration, fatal at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Two parameter sets that must mirror each other do not.
    #[error("parameter mismatch between {target} and {source_set}: {detail}")]
    ParameterMismatch {
        /// Set being written.
        target: String,
        /// Set being read.
        source_set: String,
        /// What differs.
        detail: String,
    },

    /// Training step error.
    #[error("training error: {0}")]
    Training(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Image decode/encode error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl ProGanError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a dataset error.
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a parameter mismatch error.
    pub fn parameter_mismatch(
        target: impl Into<String>,
        source_set: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::ParameterMismatch {
            target: target.into(),
            source_set: source_set.into(),
            detail: detail.into(),
        }
    }

    /// True for errors that must abort initialization.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ConfigParse(_))
    }
}

impl From<indicatif::style::TemplateError> for ProGanError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        ProGanError::Template(err.to_string())
    }
}
