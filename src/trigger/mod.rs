//! Triggers: when a workflow run starts.
//!
//! A run starts either because a cron schedule fired or because someone
//! asked for it (`dailyrun dispatch`).

mod dispatcher;
mod schedule;

pub use dispatcher::{next_fire, DaemonStats, DispatchError, Dispatcher, DispatcherOptions, OutputMode};
pub use schedule::{Cadence, ScheduleError, ScheduleSpec};

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The event that started a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// A cron schedule fired.
    Schedule {
        /// The expression that fired
        cron: String,
    },
    /// A manual dispatch.
    Manual {
        /// Resolved dispatch inputs
        #[serde(default)]
        inputs: BTreeMap<String, String>,
    },
}

impl Trigger {
    /// A manual trigger with no inputs.
    pub fn manual() -> Self {
        Self::Manual { inputs: BTreeMap::new() }
    }

    /// Event name exposed to steps (`github.event_name`).
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Schedule { .. } => "schedule",
            Self::Manual { .. } => "workflow_dispatch",
        }
    }

    /// Dispatch inputs (empty for scheduled runs).
    pub fn inputs(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Manual { inputs } => Some(inputs),
            Self::Schedule { .. } => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schedule { cron } => write!(f, "schedule ({cron})"),
            Self::Manual { .. } => write!(f, "manual"),
        }
    }
}
