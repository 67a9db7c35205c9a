//! Workflow definition error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::trigger::ScheduleError;

/// Result type for workflow loading.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors found while loading or validating a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The file could not be read.
    #[error("Failed to read workflow {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The YAML did not match the workflow schema.
    #[error("Invalid workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// No jobs were declared.
    #[error("Workflow must declare at least one job")]
    NoJobs,

    /// A job has no steps.
    #[error("Job '{0}' has no steps")]
    EmptyJob(String),

    /// A step sets both or neither of `uses` and `run`.
    #[error("Step '{step}' in job '{job}' must set exactly one of 'uses' or 'run'")]
    AmbiguousStep { job: String, step: String },

    /// A step uses an action dailyrun does not provide.
    #[error("Step '{step}' in job '{job}' uses unsupported action '{uses}'")]
    UnsupportedAction { job: String, step: String, uses: String },

    /// A step names an unknown shell.
    #[error("Step '{step}' in job '{job}': {reason}")]
    InvalidShell { job: String, step: String, reason: String },

    /// A timeout is zero, negative or not a number.
    #[error("Invalid timeout-minutes in '{0}': must be a positive number")]
    InvalidTimeout(String),

    /// A cron schedule did not parse.
    #[error("Invalid schedule '{cron}': {source}")]
    InvalidSchedule {
        cron: String,
        #[source]
        source: ScheduleError,
    },

    /// No workflow matched the requested name.
    #[error("Workflow '{0}' not found")]
    NotFound(String),

    /// No workflow files were found.
    #[error("No workflow files found (looked in .dailyrun/workflows and .github/workflows)")]
    NoneFound,

    /// Several workflows were found and none was selected.
    #[error("Several workflows found ({}); pick one with --workflow", .0.join(", "))]
    Ambiguous(Vec<String>),
}
