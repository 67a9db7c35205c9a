//! `dailyrun/install-requirements`: install dependencies from a manifest.
//!
//! A missing manifest is not an error. The step is skipped and the run
//! continues.

use async_trait::async_trait;

use super::{Action, ActionInput, ActionOutcome, LineSink, ProvisionError, ProvisionResult};
use crate::core::find_in_path;

/// Manifest used when `with.manifest` is not set.
pub const DEFAULT_MANIFEST: &str = "requirements.txt";

/// Count the requirement lines in a manifest (ignores comments, blanks and options).
pub fn count_requirements(content: &str) -> usize {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('-'))
        .count()
}

/// The install-requirements action.
pub struct InstallRequirements;

impl InstallRequirements {
    /// Interpreter for `-m pip`: the one setup-python chose, else the first candidate on `PATH`.
    fn interpreter(input: &ActionInput<'_>) -> ProvisionResult<String> {
        if let Some(python) = input.env.get("DAILYRUN_PYTHON").filter(|p| !p.is_empty()) {
            return Ok(python.clone());
        }

        let path = input.search_path();
        input
            .settings
            .python_candidates
            .iter()
            .find_map(|name| find_in_path(name, path.as_ref()))
            .map(|p| p.display().to_string())
            .ok_or_else(|| ProvisionError::NoInterpreter("any".to_string()))
    }

    async fn pip(
        input: &ActionInput<'_>,
        python: &str,
        args: Vec<String>,
        sink: &mut LineSink<'_>,
    ) -> ProvisionResult<()> {
        let command = input.command("pip", python).arg("-m").arg("pip").args(args);
        tracing::debug!(command = %command.display_line(), "Running pip");

        let result = input.executor.execute(&command, &mut **sink).await?;
        if result.timed_out {
            return Err(ProvisionError::TimedOut);
        }
        if !result.success() {
            return Err(ProvisionError::Install { code: result.code() });
        }
        Ok(())
    }
}

#[async_trait]
impl Action for InstallRequirements {
    async fn run(&self, input: ActionInput<'_>, mut sink: LineSink<'_>) -> ProvisionResult<ActionOutcome> {
        let manifest_name = input.input("manifest").unwrap_or(DEFAULT_MANIFEST).to_string();
        let manifest = input.workspace.join(&manifest_name);

        if !manifest.is_file() {
            tracing::info!(manifest = manifest_name.as_str(), "No dependency manifest found, skipping install");
            return Ok(ActionOutcome::skipped(format!("No {manifest_name} found, skipping")));
        }

        let count = std::fs::read_to_string(&manifest).map(|c| count_requirements(&c)).unwrap_or(0);
        let python = Self::interpreter(&input)?;
        tracing::info!(manifest = manifest_name.as_str(), requirements = count, python = python.as_str(), "Installing dependencies");

        if input.flag("upgrade-pip") {
            let args = vec!["install".to_string(), "--upgrade".to_string(), "pip".to_string()];
            Self::pip(&input, &python, args, &mut sink).await?;
        }

        let mut args = vec!["install".to_string(), "-r".to_string(), manifest_name.clone()];
        args.extend(input.settings.pip_args.iter().cloned());
        Self::pip(&input, &python, args, &mut sink).await?;

        Ok(ActionOutcome {
            summary: Some(format!("Installed {count} requirement(s) from {manifest_name}")),
            ..ActionOutcome::default()
        })
    }
}
