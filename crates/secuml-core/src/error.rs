//! Error types for secuml-core.
//!
//! Two families of domain errors are recognized: [`CoreError`] for failures
//! in reusable foundations (configuration, persistence, supervision) and
//! [`ExperimentError`] for failures specific to running an experiment.
//! Anything else travels as [`Error::Unexpected`] with its cause chain intact.

use std::fmt::Display;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot connect to {descriptor}: {reason}")]
    Connection { descriptor: String, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error(
        "Supervised learning models require that the training dataset contains at least two classes"
    )]
    AtLeastTwoClasses,
}

impl CoreError {
    pub(crate) fn persistence(e: impl Display) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Invalid experiment parameters: {0}")]
    Config(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Algorithm failure: {0}")]
    Algorithm(String),
}

/// Top-level error returned by the experiment lifecycle.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl Error {
    pub fn unexpected(cause: impl Into<anyhow::Error>) -> Self {
        Error::Unexpected(cause.into())
    }

    /// Domain errors are operator-actionable; everything else is a defect.
    pub fn is_domain(&self) -> bool {
        !matches!(self, Error::Unexpected(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
