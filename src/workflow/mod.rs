//! Workflow definitions.
//!
//! Workflows are YAML files (a subset of the GitHub Actions syntax) that
//! declare triggers and an ordered list of steps.

mod error;
pub mod expr;
mod parser;
mod schema;

pub use error::{WorkflowError, WorkflowResult};
pub use expr::{interpolate, ExpressionContext, Interpolated, Reference, Resolution};
pub use parser::{
    discover_workflows, parse_workflow, parse_workflow_str, select_workflow, WorkflowFile,
    WORKFLOW_DIRS,
};
pub use schema::{
    CronEntry, DispatchConfig, DispatchInput, Job, Scalar, ScalarMap, Step, Triggers, Workflow,
};

use std::collections::BTreeSet;

impl Workflow {
    /// Names of all secrets referenced anywhere in the workflow.
    pub fn referenced_secrets(&self) -> BTreeSet<String> {
        self.templates()
            .into_iter()
            .flat_map(expr::references)
            .filter(Reference::is_secret)
            .map(|r| r.key)
            .collect()
    }
}
