//! Error types for the metric family model.

use thiserror::Error;

use crate::model::MetricKind;

/// Result type alias for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while constructing or validating a metric family.
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("invalid metric name: {0:?}")]
    InvalidMetricName(String),

    #[error("invalid label name {label:?} in family {family}")]
    InvalidLabelName { family: String, label: String },

    #[error("family {family} is of kind {expected} but contains a {found} sample")]
    KindMismatch {
        family: String,
        expected: MetricKind,
        found: MetricKind,
    },
}
