//! Configuration management for dailyrun.
//!
//! Handles loading configuration from TOML files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::Shell;
use crate::provision::ProvisionSettings;

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Scheduler settings
    pub scheduler: SchedulerConfig,

    /// Runtime provisioning settings
    pub runtime: RuntimeConfig,

    /// Run history settings
    pub history: HistoryConfig,
}

/// General application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Workspace the workflow runs in (defaults to the current directory)
    pub workspace: Option<String>,

    /// Workflow to run when several exist (id, name or path)
    pub workflow: Option<String>,

    /// Dotenv file with secrets, relative to the workspace
    pub secrets_file: Option<String>,

    /// Default shell for `run:` steps
    pub shell: Option<String>,
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time zone cron expressions are evaluated in (only UTC)
    pub timezone: String,

    /// Seconds to wait for in-flight runs on shutdown
    pub shutdown_grace_secs: u64,
}

/// Runtime provisioning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter names tried when locating Python
    pub python_candidates: Vec<String>,

    /// Extra arguments appended to `pip install`
    pub pip_args: Vec<String>,
}

/// Run history settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Whether runs are recorded
    pub enabled: bool,

    /// History file (defaults to the data directory)
    pub path: Option<String>,

    /// Maximum number of runs to keep
    pub max_runs: usize,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.dailyrun.toml` in current directory
    /// 2. `~/.config/dailyrun/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self::locate().map(|p| Self::load_from_file(&p)).transpose()?.unwrap_or_default())
    }

    /// The config file `load` would read, if one exists.
    pub fn locate() -> Option<PathBuf> {
        // Try local config first
        let local_config = PathBuf::from(".dailyrun.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        // Try global config
        Self::config_dir().map(|d| d.join("config.toml")).filter(|p| p.exists())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings dailyrun cannot honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        let tz = self.scheduler.timezone.trim();
        if !(tz.eq_ignore_ascii_case("utc") || tz == "Etc/UTC") {
            anyhow::bail!("Unsupported scheduler.timezone '{tz}': cron schedules are evaluated in UTC");
        }
        self.shell()?;
        Ok(())
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("dailyrun"))
    }

    /// Get the data directory path (for run history).
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("dailyrun"))
    }

    /// The workspace, with `~` and `$VARS` expanded.
    pub fn workspace(&self) -> anyhow::Result<PathBuf> {
        match self.general.workspace.as_deref() {
            Some(path) => expand_path(path),
            None => Ok(std::env::current_dir()?),
        }
    }

    /// The default shell for `run:` steps.
    pub fn shell(&self) -> anyhow::Result<Option<Shell>> {
        self.general
            .shell
            .as_deref()
            .map(|s| s.parse::<Shell>().map_err(|e| anyhow::anyhow!("Invalid general.shell: {e}")))
            .transpose()
    }

    /// Where run history is stored.
    pub fn history_path(&self) -> anyhow::Result<PathBuf> {
        match self.history.path.as_deref() {
            Some(path) => expand_path(path),
            None => Self::data_dir()
                .map(|d| d.join("runs.json"))
                .ok_or_else(|| anyhow::anyhow!("Could not determine data directory")),
        }
    }

    /// Settings for the built-in actions.
    pub fn provision_settings(&self) -> ProvisionSettings {
        ProvisionSettings {
            python_candidates: self.runtime.python_candidates.clone(),
            pip_args: self.runtime.pip_args.clone(),
        }
    }
}

/// Expand `~` and environment variables in a path.
pub fn expand_path(path: &str) -> anyhow::Result<PathBuf> {
    let expanded = shellexpand::full(path).map_err(|e| anyhow::anyhow!("Cannot expand '{path}': {e}"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { timezone: "UTC".to_string(), shutdown_grace_secs: 30 }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let defaults = ProvisionSettings::default();
        Self { python_candidates: defaults.python_candidates, pip_args: defaults.pip_args }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { enabled: true, path: None, max_runs: super::history::DEFAULT_MAX_RUNS }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.scheduler.timezone, "UTC");
        assert_eq!(config.runtime.python_candidates, vec!["python3", "python"]);
        assert!(config.history.enabled);
        assert_eq!(config.history.max_runs, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[scheduler]"));
        assert!(toml_str.contains("[runtime]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [general]
            workflow = "daily"
            shell = "sh"

            [runtime]
            python_candidates = ["python3.12"]
            pip_args = ["--quiet"]

            [history]
            max_runs = 10
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.workflow.as_deref(), Some("daily"));
        assert_eq!(config.shell().unwrap(), Some(Shell::Sh));
        assert_eq!(config.provision_settings().pip_args, vec!["--quiet"]);
        assert_eq!(config.history.max_runs, 10);
        assert_eq!(config.scheduler.shutdown_grace_secs, 30);
    }

    #[test]
    fn test_non_utc_timezone_rejected() {
        let config: Config = toml::from_str("[scheduler]\ntimezone = \"Europe/Berlin\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_shell_rejected() {
        let config: Config = toml::from_str("[general]\nshell = \"fish\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_paths_expand_env_vars() {
        std::env::set_var("DAILYRUN_TEST_ROOT", "/srv/news");
        let config: Config = toml::from_str(
            "[general]\nworkspace = \"$DAILYRUN_TEST_ROOT/site\"\n[history]\npath = \"${DAILYRUN_TEST_ROOT}/runs.json\"\n",
        )
        .unwrap();

        assert_eq!(config.workspace().unwrap(), PathBuf::from("/srv/news/site"));
        assert_eq!(config.history_path().unwrap(), PathBuf::from("/srv/news/runs.json"));
        std::env::remove_var("DAILYRUN_TEST_ROOT");
    }
}
