//! Run and step reports.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provision::Revision;
use crate::trigger::Trigger;

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
    TimedOut,
}

impl StepStatus {
    /// Status icon for terminal output.
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Success => "✓",
            Self::Failure => "✗",
            Self::Skipped => "○",
            Self::TimedOut => "⏱",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Job the step belongs to
    pub job: String,

    /// Step display name
    pub name: String,

    /// Outcome
    pub status: StepStatus,

    /// Process exit code, when one ran and exited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Wall-clock time in milliseconds
    pub duration_ms: u64,

    /// What the step did, for built-in actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Why it failed or was skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepReport {
    /// A report for a step that did not run.
    pub fn skipped(job: &str, name: String, reason: impl Into<String>) -> Self {
        Self {
            job: job.to_string(),
            name,
            status: StepStatus::Skipped,
            exit_code: None,
            duration_ms: 0,
            summary: None,
            error: Some(reason.into()),
        }
    }

    /// Step duration.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Result of a whole run. Holds metadata only, never secret values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run id
    pub run_id: String,

    /// Workflow name
    pub workflow: String,

    /// What started the run
    pub trigger: Trigger,

    /// Start time
    pub started_at: DateTime<Utc>,

    /// End time
    pub finished_at: DateTime<Utc>,

    /// Overall outcome
    pub status: RunStatus,

    /// Revision of the workspace, when checkout found one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,

    /// Per-step results in execution order
    pub steps: Vec<StepReport>,
}

impl RunReport {
    /// Whether the run succeeded.
    pub fn success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Total wall-clock duration.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    /// The step that failed the run, if any.
    pub fn failed_step(&self) -> Option<&StepReport> {
        if self.success() {
            return None;
        }
        // Later steps are skipped once the run fails, so the last failure is the one that halted it.
        self.steps.iter().rev().find(|s| matches!(s.status, StepStatus::Failure | StepStatus::TimedOut))
    }

    /// Find a step by name.
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}
