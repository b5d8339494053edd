//! Typed errors for the reaper crate.

use thiserror::Error;

/// A call to an external collaborator (registry, store, sender, runtime) failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator could not be reached or returned a transport failure.
    #[error("{collaborator} unavailable: {message}")]
    Unavailable {
        collaborator: &'static str,
        message: String,
    },
    /// The addressed record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The collaborator returned data that cannot be interpreted.
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl CollaboratorError {
    pub fn unavailable(collaborator: &'static str, message: impl ToString) -> Self {
        CollaboratorError::Unavailable {
            collaborator,
            message: message.to_string(),
        }
    }
}

/// Errors surfaced by the stuck-job reporter.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("stuck job query failed: {0}")]
    Query(#[source] CollaboratorError),
    #[error("alert delivery failed: {0}")]
    Send(#[source] CollaboratorError),
}

/// Errors that make a whole reap pass impossible.
///
/// Failures scoped to a single pipeline or job record are not errors; they
/// are collected in the pass outcome.
#[derive(Debug, Error)]
pub enum ReapError {
    #[error("listing recent job records failed: {0}")]
    ListJobs(#[source] CollaboratorError),
    #[error("listing root pipelines failed: {0}")]
    ListPipelines(#[source] CollaboratorError),
}

/// Errors from a cleanup aggregator run.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("missing job parameter: {0}")]
    MissingParam(&'static str),
    #[error("invalid job parameter {name}: {value}")]
    InvalidParam { name: &'static str, value: String },
    #[error("auxiliary scan failed: {0}")]
    Scan(#[source] CollaboratorError),
}
