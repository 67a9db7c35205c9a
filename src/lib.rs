#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unnecessary_lazy_evaluations)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::cast_lossless)]

//! # Dailyrun
//!
//! Run a scheduled workflow on your own machine.
//!
//! Dailyrun reads a workflow file written in a subset of the GitHub Actions
//! syntax and runs it when a cron schedule fires or when you dispatch it by
//! hand. Steps can check out the repository, pick a Python interpreter,
//! install `requirements.txt` and run shell scripts with secrets injected
//! as environment variables.
//!
//! ## Features
//!
//! - **Triggers**: `on.schedule` cron expressions (UTC) and `workflow_dispatch`
//! - **Built-in actions**: checkout, setup-python, install-requirements
//! - **Secrets**: environment, dotenv file, or OS keychain; masked in output
//! - **Run history**: every run is recorded as JSON metadata
//!
//! ## Quick Start
//!
//! ```bash
//! # Check the workflow and show its schedule
//! dailyrun validate
//!
//! # Run it once, now
//! dailyrun dispatch
//!
//! # Keep running it on schedule
//! dailyrun daemon
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::redundant_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::future_not_send)]

pub mod core;
pub mod provision;
pub mod run;
pub mod secrets;
pub mod trigger;
pub mod workflow;

#[cfg(feature = "git")]
pub mod git;

#[cfg(feature = "git")]
pub use git::GitRepository;

pub use provision::{ActionKind, ProvisionError, ProvisionSettings};
pub use run::{RunContext, RunError, RunReport, RunStatus, StepReport, StepStatus, WorkflowRunner};
pub use secrets::{Masker, SecretStore, SecretValue, SecretsError};
pub use trigger::{DispatchError, Dispatcher, DispatcherOptions, ScheduleSpec, Trigger};
pub use workflow::{parse_workflow, select_workflow, Workflow, WorkflowError, WorkflowFile};

// Re-export commonly used types
pub use crate::core::{Config, Shell};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "dailyrun";
