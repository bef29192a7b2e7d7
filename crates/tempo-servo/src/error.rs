//! Error types for servo construction

use thiserror::Error;

use crate::ServoKind;

/// Errors raised while building a servo.
///
/// Once a [`Servo`](crate::Servo) exists none of its operations fail;
/// measurement problems surface as state transitions instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServoError {
    #[error("Unknown servo algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Servo algorithm {kind} failed to initialize: {reason}")]
    AlgorithmInitFailed { kind: ServoKind, reason: String },
}

impl ServoError {
    pub(crate) fn init_failed(kind: ServoKind, reason: impl Into<String>) -> Self {
        ServoError::AlgorithmInitFailed {
            kind,
            reason: reason.into(),
        }
    }
}

/// Result type for servo construction
pub type ServoResult<T> = Result<T, ServoError>;
