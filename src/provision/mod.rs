//! Built-in actions that prepare the environment for script steps.
//!
//! A `uses:` step names one of these actions. Each action receives its
//! interpolated `with:` inputs and reports what later steps should see:
//! exported variables, `PATH` additions and the checked-out revision.

mod checkout;
mod python;
mod requirements;

pub use checkout::{Checkout, Revision};
pub use python::{find_interpreter, parse_python_version, Interpreter, SetupPython, VersionSpec};
pub use requirements::{count_requirements, InstallRequirements, DEFAULT_MANIFEST};

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{Command, Executor, Stream};

/// Result type for provisioning.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Environment setup failures.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The workspace could not be checked out.
    #[error("checkout failed: {0}")]
    Checkout(String),

    /// A `python-version` value could not be understood.
    #[error("invalid python-version '{0}'")]
    InvalidVersion(String),

    /// No installed interpreter satisfies the requested version.
    #[error("no Python interpreter matching '{0}' found on PATH")]
    NoInterpreter(String),

    /// The dependency install command exited non-zero.
    #[error("dependency installation failed{}", .code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    Install { code: Option<i32> },

    /// A provisioning command exceeded the step timeout.
    #[error("timed out")]
    TimedOut,

    /// A process could not be spawned or a file could not be written.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Settings shared by every action, taken from the `[runtime]` config section.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    /// Interpreter names tried when locating Python
    pub python_candidates: Vec<String>,

    /// Extra arguments appended to `pip install`
    pub pip_args: Vec<String>,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            python_candidates: vec!["python3".to_string(), "python".to_string()],
            pip_args: Vec::new(),
        }
    }
}

/// Everything an action needs from the run.
pub struct ActionInput<'a> {
    /// Root of the checked-out source tree
    pub workspace: &'a Path,

    /// Interpolated `with:` values
    pub with: &'a BTreeMap<String, String>,

    /// Environment the step would pass to a child process
    pub env: &'a BTreeMap<String, String>,

    /// Directories earlier actions added to `PATH`
    pub path_prefix: &'a [PathBuf],

    /// Scratch directory for this run (shims, clones)
    pub tool_dir: &'a Path,

    /// Executor carrying the step timeout
    pub executor: &'a Executor,

    /// Runtime settings
    pub settings: &'a ProvisionSettings,
}

impl ActionInput<'_> {
    /// A `with:` value, treating empty strings as unset.
    pub fn input(&self, key: &str) -> Option<&str> {
        self.with.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    /// A boolean `with:` value.
    pub fn flag(&self, key: &str) -> bool {
        self.input(key).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// The `PATH` a step would see, including earlier additions.
    pub fn search_path(&self) -> Option<OsString> {
        let inherited = self
            .env
            .get("PATH")
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_default();

        let mut parts = self.path_prefix.to_vec();
        parts.extend(std::env::split_paths(&inherited));
        std::env::join_paths(parts).ok()
    }

    /// A command running in the workspace with the step's environment.
    pub fn command(&self, name: &str, program: impl Into<String>) -> Command {
        Command::new(name, program)
            .with_working_dir(self.workspace)
            .with_envs(self.env.iter())
            .with_path_prefix(self.path_prefix)
    }
}

/// What an action produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    /// The action had nothing to do
    pub skipped: bool,

    /// One-line description for logs and reports
    pub summary: Option<String>,

    /// Variables exported to later steps
    pub exports: BTreeMap<String, String>,

    /// Directories prepended to `PATH` for later steps
    pub path: Vec<PathBuf>,

    /// Revision of the workspace, set by checkout
    pub revision: Option<Revision>,
}

impl ActionOutcome {
    /// An outcome for an action that did nothing.
    pub fn skipped(summary: impl Into<String>) -> Self {
        Self { skipped: true, summary: Some(summary.into()), ..Self::default() }
    }
}

/// Receives output lines from commands an action runs.
pub type LineSink<'a> = &'a mut (dyn FnMut(&str, Stream) + Send);

/// A built-in action.
#[async_trait]
pub trait Action: Send + Sync {
    /// Run the action.
    async fn run(&self, input: ActionInput<'_>, sink: LineSink<'_>) -> ProvisionResult<ActionOutcome>;
}

/// The built-in actions a step may `use`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// `actions/checkout@*`
    Checkout,
    /// `actions/setup-python@*`
    SetupPython,
    /// `dailyrun/install-requirements`
    InstallRequirements,
}

impl ActionKind {
    /// Identify the action named by a `uses:` value. The version after `@` is ignored.
    pub fn from_uses(uses: &str) -> Option<Self> {
        let name = uses.split_once('@').map_or(uses, |(name, _)| name).trim();
        match name.to_ascii_lowercase().as_str() {
            "actions/checkout" => Some(Self::Checkout),
            "actions/setup-python" => Some(Self::SetupPython),
            "dailyrun/install-requirements" => Some(Self::InstallRequirements),
            _ => None,
        }
    }

    /// The implementation of this action.
    pub fn action(self) -> &'static dyn Action {
        match self {
            Self::Checkout => &Checkout,
            Self::SetupPython => &SetupPython,
            Self::InstallRequirements => &InstallRequirements,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checkout => write!(f, "checkout"),
            Self::SetupPython => write!(f, "setup-python"),
            Self::InstallRequirements => write!(f, "install-requirements"),
        }
    }
}
