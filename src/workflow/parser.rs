//! Workflow parser.
//!
//! Parses YAML workflow files into `Workflow` structs and discovers them in
//! a project directory.

use std::path::{Path, PathBuf};

use super::error::{WorkflowError, WorkflowResult};
use super::expr;
use super::Workflow;
use crate::core::Shell;
use crate::provision::ActionKind;
use crate::trigger::ScheduleSpec;

/// Directories searched for workflow files, relative to the workspace.
pub const WORKFLOW_DIRS: &[&str] = &[".dailyrun/workflows", ".github/workflows"];

/// A workflow loaded from disk.
#[derive(Debug, Clone)]
pub struct WorkflowFile {
    /// File stem, used to select the workflow on the command line
    pub id: String,

    /// Path the workflow was loaded from
    pub path: PathBuf,

    /// The parsed workflow
    pub workflow: Workflow,
}

impl WorkflowFile {
    /// Name of the workflow (its `name:` or the file stem).
    pub fn name(&self) -> &str {
        self.workflow.display_name(&self.id)
    }
}

/// Parse a workflow from a file.
pub fn parse_workflow(path: &Path) -> WorkflowResult<WorkflowFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|source| WorkflowError::Io { path: path.to_path_buf(), source })?;
    let workflow = parse_workflow_str(&content)?;
    let id = path.file_stem().and_then(|n| n.to_str()).unwrap_or("workflow").to_string();
    Ok(WorkflowFile { id, path: path.to_path_buf(), workflow })
}

/// Parse a workflow from a string.
pub fn parse_workflow_str(content: &str) -> WorkflowResult<Workflow> {
    let workflow: Workflow = serde_yaml::from_str(content)?;
    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Validate a workflow for structural errors.
fn validate_workflow(workflow: &Workflow) -> WorkflowResult<()> {
    if workflow.jobs.is_empty() {
        return Err(WorkflowError::NoJobs);
    }

    for entry in &workflow.on.schedule {
        ScheduleSpec::parse(&entry.cron)
            .map_err(|source| WorkflowError::InvalidSchedule { cron: entry.cron.clone(), source })?;
    }

    for (job_id, job) in &workflow.jobs {
        if job.steps.is_empty() {
            return Err(WorkflowError::EmptyJob(job_id.clone()));
        }
        check_timeout(job.timeout_minutes, job_id)?;

        for step in &job.steps {
            let name = step.display_name();

            match (&step.uses, &step.run) {
                (Some(uses), None) => {
                    if ActionKind::from_uses(uses).is_none() {
                        return Err(WorkflowError::UnsupportedAction {
                            job: job_id.clone(),
                            step: name,
                            uses: uses.clone(),
                        });
                    }
                }
                (None, Some(_)) => {}
                _ => {
                    return Err(WorkflowError::AmbiguousStep { job: job_id.clone(), step: name });
                }
            }

            if let Some(ref shell) = step.shell {
                shell.parse::<Shell>().map_err(|reason| WorkflowError::InvalidShell {
                    job: job_id.clone(),
                    step: name.clone(),
                    reason,
                })?;
            }

            check_timeout(step.timeout_minutes, &name)?;
        }
    }

    // Soft problems are reported but do not reject the workflow.
    for event in &workflow.on.unsupported {
        tracing::warn!(event = event.as_str(), "Ignoring unsupported trigger event");
    }
    if workflow.on.schedule.is_empty() && !workflow.on.allows_manual() {
        tracing::warn!("Workflow declares neither a schedule nor workflow_dispatch");
    }
    for template in workflow.templates() {
        for expression in expr::unsupported_expressions(template) {
            tracing::warn!(expression, "Unsupported expression will evaluate to an empty string");
        }
    }

    Ok(())
}

fn check_timeout(minutes: Option<f64>, owner: &str) -> WorkflowResult<()> {
    match minutes {
        Some(m) if !(m.is_finite() && m > 0.0) => Err(WorkflowError::InvalidTimeout(owner.to_string())),
        _ => Ok(()),
    }
}

/// Discover workflows in a directory.
pub fn discover_workflows(dir: &Path) -> Vec<WorkflowFile> {
    let mut workflows = Vec::new();

    for sub in WORKFLOW_DIRS {
        let workflows_dir = dir.join(sub);
        if workflows_dir.is_dir() {
            workflows.extend(scan_workflow_dir(&workflows_dir));
        }
    }

    workflows
}

/// Scan a directory for workflow files.
fn scan_workflow_dir(dir: &Path) -> Vec<WorkflowFile> {
    let mut found = Vec::new();

    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "yaml" || e == "yml"))
        .collect();
    paths.sort();

    for path in paths {
        match parse_workflow(&path) {
            Ok(workflow) => found.push(workflow),
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Failed to parse workflow");
            }
        }
    }

    found
}

/// Pick the workflow to run.
///
/// `selector` may be a path to a file or the id (file stem) of a discovered
/// workflow. Without a selector, the workspace must contain exactly one.
pub fn select_workflow(workspace: &Path, selector: Option<&str>) -> WorkflowResult<WorkflowFile> {
    if let Some(selector) = selector {
        let as_path = PathBuf::from(selector);
        let candidate = if as_path.is_absolute() { as_path } else { workspace.join(&as_path) };
        if candidate.is_file() {
            return parse_workflow(&candidate);
        }

        return discover_workflows(workspace)
            .into_iter()
            .find(|w| w.id == selector || w.name() == selector)
            .ok_or_else(|| WorkflowError::NotFound(selector.to_string()));
    }

    let mut workflows = discover_workflows(workspace);
    match workflows.len() {
        0 => Err(WorkflowError::NoneFound),
        1 => Ok(workflows.remove(0)),
        _ => Err(WorkflowError::Ambiguous(workflows.into_iter().map(|w| w.id).collect())),
    }
}
