//! Error type for preference-GP fitting and prediction.

use thiserror::Error;

/// Error type for fit and predict operations.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Input arrays disagree in length.
    #[error("Length mismatch: {context} has length {actual}, expected {expected}")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A coordinate row does not match the declared feature count.
    #[error("Dimension mismatch: coordinate has {actual} features, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A preference label fell outside the range declared by the input type.
    #[error("Label {value} outside the declared {input_type} range {range}")]
    LabelOutOfRange {
        value: f64,
        input_type: &'static str,
        range: &'static str,
    },

    /// A comparison total was zero, negative, or non-finite.
    #[error("Comparison totals must be positive and finite, got {value}")]
    InvalidTotal { value: f64 },

    /// Fit was called with no usable pairwise observations.
    #[error("No pairwise observations to fit")]
    EmptyObservations,

    /// Prediction was requested before a successful fit.
    #[error("No fitted posterior available; call fit() first")]
    NotFitted,

    /// Minibatch redraws exhausted without finding a subset that contains
    /// at least one observed pair.
    #[error("No informative minibatch found after {attempts} draws")]
    MinibatchExhausted { attempts: usize },

    /// A linear solve failed even after jitter escalation.
    #[error("Numerical failure: {0}")]
    Numerical(String),
}
