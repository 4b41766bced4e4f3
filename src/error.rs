use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ExperimentId;

/// Represents a result type for operations of the trigger engine.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-level [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing errors that can be returned to the host application.
///
/// Most evaluation problems never show up here: anything that can be interpreted as "rule did not
/// match" is recovered locally and reported as a normal
/// [`EvaluationOutcome::NoMatch`](crate::EvaluationOutcome::NoMatch).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Reading or writing the confirmed assignment cache failed. Stickiness of assignments cannot
    /// be guaranteed, so this is surfaced to the caller.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The experiment has no variants to choose from.
    #[error(transparent)]
    Assignment(#[from] AssignmentError),

    /// Two different variants were confirmed for the same experiment. This should be unreachable
    /// because all writes go through the orchestrator queue.
    #[error("conflicting confirmation for experiment {experiment_id}: {existing} is already confirmed, got {attempted}")]
    ConcurrencyInvariantViolation {
        /// Experiment which received the conflicting confirmation.
        experiment_id: ExperimentId,
        /// Variant that is already confirmed.
        existing: String,
        /// Variant that was attempted to be confirmed.
        attempted: String,
    },

    /// The orchestrator worker has stopped and cannot accept new work.
    #[error("orchestrator worker is not running")]
    WorkerUnavailable,

    /// Indicates that the orchestrator worker thread panicked. This should normally never happen.
    #[error("orchestrator worker thread panicked")]
    WorkerPanicked,

    /// An I/O error (e.g., the worker thread could not be started).
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl Error {
    /// Classify the error for reporting inside an
    /// [`EvaluationOutcome::Error`](crate::EvaluationOutcome::Error).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Persistence(_) => ErrorKind::Persistence,
            Error::Assignment(_) => ErrorKind::NoVariants,
            Error::ConcurrencyInvariantViolation { .. } => ErrorKind::ConcurrencyInvariantViolation,
            Error::WorkerUnavailable | Error::WorkerPanicked | Error::Io(_) => {
                ErrorKind::WorkerUnavailable
            }
        }
    }
}

/// Coarse classification of an evaluation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Confirmed assignment cache could not be read or written.
    Persistence,
    /// The matched experiment has no variants.
    NoVariants,
    /// Conflicting writes to the confirmed assignment cache were detected.
    ConcurrencyInvariantViolation,
    /// The orchestrator is not running.
    WorkerUnavailable,
}

/// Failure of the key-value persistence collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum PersistenceError {
    /// The underlying store failed to read a key.
    #[error("failed to read {key}: {message}")]
    Read {
        #[allow(missing_docs)]
        key: String,
        #[allow(missing_docs)]
        message: String,
    },

    /// The underlying store failed to write a key.
    #[error("failed to write {key}: {message}")]
    Write {
        #[allow(missing_docs)]
        key: String,
        #[allow(missing_docs)]
        message: String,
    },

    /// The stored value does not have the expected shape.
    #[error("failed to decode {key}: {message}")]
    Decode {
        #[allow(missing_docs)]
        key: String,
        #[allow(missing_docs)]
        message: String,
    },
}

/// Failure of the event history collaborator. Recovered locally: the computed property that
/// needed the read falls back to its documented default.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("event history store failed: {0}")]
pub struct StoreError(pub String);

/// Failure to pick a variant for an experiment.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AssignmentError {
    /// The variant list is empty.
    #[error("no variants found")]
    NoVariantsFound,
}
