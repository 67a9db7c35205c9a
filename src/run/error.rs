//! Run failure types.

use std::time::Duration;

use thiserror::Error;

use super::StepStatus;
use crate::provision::ProvisionError;

/// Why a step failed.
#[derive(Debug, Error)]
pub enum RunError {
    /// Checkout, runtime setup or dependency installation failed.
    #[error("'{step}' failed during environment setup: {source}")]
    Setup {
        step: String,
        #[source]
        source: ProvisionError,
    },

    /// The script exited non-zero.
    #[error("'{step}' failed{}", .code.map(|c| format!(" with exit code {c}")).unwrap_or_else(|| " (terminated by signal)".to_string()))]
    StepFailed { step: String, code: Option<i32> },

    /// The step ran longer than `timeout-minutes`.
    #[error("'{step}' timed out after {}s", .limit.as_secs())]
    Timeout { step: String, limit: Duration },

    /// The step's process could not be started.
    #[error("'{step}' could not be started: {source}")]
    Spawn {
        step: String,
        #[source]
        source: std::io::Error,
    },

    /// The step names an action that is not built in.
    #[error("'{step}' uses unsupported action '{uses}'")]
    UnsupportedAction { step: String, uses: String },
}

impl RunError {
    /// Status recorded for the failed step.
    pub fn step_status(&self) -> StepStatus {
        match self {
            Self::Timeout { .. } => StepStatus::TimedOut,
            _ => StepStatus::Failure,
        }
    }

    /// Exit code of the failed process, if it exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::StepFailed { code, .. } => *code,
            Self::Setup { source: ProvisionError::Install { code }, .. } => *code,
            _ => None,
        }
    }
}
