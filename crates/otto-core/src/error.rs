//! Error taxonomy of the Otto control plane.
//!
//! `ConfigInvalid` and `ExperimentMismatch` are fatal at startup.
//! `Transport`, `Timeout` and `Canceled` are converted into trial statuses by
//! the driver and never abort the optimization loop.

use thiserror::Error;

use crate::status::Status;

/// Errors surfaced by the control plane.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("invalid value for tunable {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("loss of precision: {name}={value}")]
    PrecisionLoss { name: String, value: f64 },

    #[error("experiment {experiment_id} is incompatible with prior runs: {reason}")]
    ExperimentMismatch {
        experiment_id: String,
        reason: String,
    },

    #[error("status {status} and score are inconsistent")]
    InconsistentObservation { status: Status },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("operation timed out after {elapsed_s:.1}s")]
    Timeout { elapsed_s: f64 },

    #[error("operation canceled")]
    Canceled,

    #[error("storage error: {reason}")]
    Storage { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport {
            reason: err.to_string(),
        }
    }
}

impl Error {
    /// Shortcut for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        Error::ConfigInvalid {
            reason: reason.into(),
        }
    }

    /// Shortcut for storage backend faults.
    pub fn storage(reason: impl Into<String>) -> Self {
        Error::Storage {
            reason: reason.into(),
        }
    }
}

/// Result type used across the Otto crates.
pub type Result<T> = std::result::Result<T, Error>;
