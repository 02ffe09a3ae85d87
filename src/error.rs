//! Error taxonomy for forecast runs.
//!
//! Run-level failures are variants of [`Error`]. Per-account failures are
//! [`ModelExecutionError`]s, which the orchestrator records on the affected
//! model run instead of propagating.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::RunId;

/// All run-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid run parameters. No run is created.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another run is still active. No run is created.
    #[error("conflict: run {active} is still active")]
    Conflict { active: RunId },

    /// Data preparation failed. The run fails before any model run exists.
    #[error(transparent)]
    Data(#[from] DataException),

    /// One account's model failed.
    #[error(transparent)]
    ModelExecution(#[from] ModelExecutionError),

    /// The run record store cannot be reached.
    #[error("database connection failure: {0}")]
    DatabaseConnection(String),

    /// The store answered but rejected a statement or returned an unreadable
    /// record. Run bookkeeping can still be written.
    #[error("store error: {0}")]
    Store(String),

    /// The run was moved to an end state outside this process (forced abort).
    #[error("run closed: {0}")]
    RunClosed(String),

    /// A write would break a run bookkeeping invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Forecast artifacts could not be written.
    #[error("output error: {0}")]
    Output(String),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short tag stored as the terminal cause of a failed run.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Conflict { .. } => "conflict",
            Error::Data(_) => "data",
            Error::ModelExecution(_) => "model_execution",
            Error::DatabaseConnection(_) => "database_connection",
            Error::Store(_) => "store",
            Error::RunClosed(_) => "run_closed",
            Error::InvariantViolation(_) => "invariant_violation",
            Error::Output(_) => "output",
        }
    }

    /// Whether run bookkeeping can still be written after this error.
    pub fn store_reachable(&self) -> bool {
        !matches!(self, Error::DatabaseConnection(_))
    }
}

impl From<surrealdb::Error> for Error {
    fn from(err: surrealdb::Error) -> Self {
        use surrealdb::error::Api;
        match &err {
            surrealdb::Error::Api(
                Api::Http(_)
                | Api::Ws(_)
                | Api::Scheme(_)
                | Api::InvalidUrl(_)
                | Api::ConnectionUninitialised,
            ) => Error::DatabaseConnection(err.to_string()),
            _ => Error::Store(err.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Output(err.to_string())
    }
}

/// Missing or malformed source data.
#[derive(Debug, Error)]
pub enum DataException {
    #[error("input extract not found: {0}")]
    MissingExtract(String),

    #[error("malformed input extract at line {line}: {reason}")]
    Malformed { line: u64, reason: String },

    #[error("input extract contains no usable rows: {0}")]
    Empty(String),

    #[error("no cleaned data available: {0}")]
    NoCleanedData(String),
}

/// Category of a model execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionCause {
    /// Lost the connection to the modeling engine.
    ConnectionLost,
    /// Input data rejected by the model config or the engine.
    MalformedInput,
    /// The engine produced no usable (finite) forecast.
    NonConvergence,
    /// Not enough history to fit the configured method.
    InsufficientHistory,
}

impl ExecutionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionLost => "connection_lost",
            Self::MalformedInput => "malformed_input",
            Self::NonConvergence => "non_convergence",
            Self::InsufficientHistory => "insufficient_history",
        }
    }

    /// Transient causes may succeed when dispatched again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }
}

impl fmt::Display for ExecutionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single model config against the modeling engine.
#[derive(Debug, Clone, Error)]
#[error("model execution failed ({cause}): {message}")]
pub struct ModelExecutionError {
    pub cause: ExecutionCause,
    pub message: String,
}

impl ModelExecutionError {
    pub fn new(cause: ExecutionCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }
}
