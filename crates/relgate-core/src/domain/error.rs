//! Configuration error taxonomy.
//!
//! Every variant is detected before any job runs and aborts the whole run.

use std::path::PathBuf;

use crate::graph::GraphError;
use crate::matrix::MatrixError;
use crate::package::PackageError;

/// Errors in a workflow definition.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("failed to parse workflow: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read workflow {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("workflow declares no jobs")]
    NoJobs,

    #[error("invalid trigger filter '{field}': {reason}")]
    InvalidTrigger { field: String, reason: String },

    #[error("invalid job '{job}': {reason}")]
    InvalidJob { job: String, reason: String },

    #[error("invalid step '{step}' in job '{job}': {reason}")]
    InvalidStep {
        job: String,
        step: String,
        reason: String,
    },

    #[error("invalid matrix in job '{job}': {source}")]
    Matrix {
        job: String,
        #[source]
        source: MatrixError,
    },

    #[error("job graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("package metadata error: {0}")]
    Package(#[from] PackageError),

    #[error("failed to encode workflow: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for workflow configuration operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;
