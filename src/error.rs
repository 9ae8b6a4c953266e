//! Error types for the standard sequencer.

use crate::event::ReadError;
use std::fmt;
use thiserror::Error;

/// Result type alias for sequencer operations.
pub type Result<T, E = SequencerError> = std::result::Result<T, E>;

/// The two policy stages a feature is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyStage {
    Resampling,
    Filling,
}

impl fmt::Display for PolicyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyStage::Resampling => write!(f, "resampling"),
            PolicyStage::Filling => write!(f, "filling"),
        }
    }
}

/// Main error type of the sequencing engine.
#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ambiguous {stage} policy for feature '{feature}': {count} functions resolved, expected exactly one")]
    AmbiguousPolicy {
        stage: PolicyStage,
        feature: String,
        count: usize,
    },

    #[error("Missing {stage} policy for feature '{feature}'")]
    MissingPolicy { stage: PolicyStage, feature: String },

    #[error("Unknown {stage} method '{name}'")]
    UnknownMethod { stage: PolicyStage, name: String },

    #[error("Invalid parameter '{name}' for method '{method}': {reason}")]
    InvalidParameter {
        method: String,
        name: String,
        reason: String,
    },

    #[error("Method '{method}' cannot be applied to {kind} feature '{feature}'")]
    InapplicableMethod {
        method: String,
        kind: String,
        feature: String,
    },

    #[error("Event has no value for required column '{0}'")]
    MissingColumn(String),

    #[error("Failed to parse timestamp '{value}': {reason}")]
    Timestamp { value: String, reason: String },

    #[error("Cell '{feature}' holds {len} values, expected a scalar")]
    NonScalarCell { feature: String, len: usize },

    #[error("Cannot cast value {value} of feature '{feature}' to {target}")]
    Coercion {
        feature: String,
        value: String,
        target: String,
    },

    #[error("Invalid input {0}")]
    Read(#[from] ReadError),

    #[error("Worker pool error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SequencerError {
    /// Whether this error stems from configuration rather than data.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SequencerError::Config(_)
                | SequencerError::AmbiguousPolicy { .. }
                | SequencerError::MissingPolicy { .. }
                | SequencerError::UnknownMethod { .. }
                | SequencerError::InvalidParameter { .. }
                | SequencerError::InapplicableMethod { .. }
        )
    }
}
