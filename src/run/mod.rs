//! Workflow execution.

mod error;
mod report;
mod runner;

pub use error::RunError;
pub use report::{RunReport, RunStatus, StepReport, StepStatus};
pub use runner::{OutputHandler, PlannedStep, RunContext, WorkflowRunner};
