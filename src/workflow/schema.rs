//! Workflow schema definitions.
//!
//! Defines the YAML structure for workflow files. The layout is a subset of
//! the GitHub Actions workflow syntax so existing files run unchanged.

use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

/// A YAML scalar (string, number or boolean) kept as its string form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Scalar(pub String);

impl Scalar {
    /// Borrow the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScalarVisitor;

        impl<'de> Visitor<'de> for ScalarVisitor {
            type Value = Scalar;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string, number or boolean")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Scalar, E> {
                Ok(Scalar(v))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Scalar, E> {
                Ok(Scalar(String::new()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}

/// Ordered map of scalar values (`env:`, `with:`).
pub type ScalarMap = IndexMap<String, Scalar>;

/// A workflow definition.
#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    /// Name of the workflow
    #[serde(default)]
    pub name: Option<String>,

    /// Events that start a run
    #[serde(rename = "on")]
    pub on: Triggers,

    /// Environment shared by every job
    #[serde(default)]
    pub env: ScalarMap,

    /// Jobs, run in declaration order
    pub jobs: IndexMap<String, Job>,
}

/// Trigger configuration (`on:`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Triggers {
    /// Cron schedules
    pub schedule: Vec<CronEntry>,

    /// Manual dispatch configuration (present if manual runs are allowed)
    pub workflow_dispatch: Option<DispatchConfig>,

    /// Event names dailyrun does not act on (`push`, `pull_request`, ...)
    pub unsupported: Vec<String>,
}

impl Triggers {
    /// Whether the workflow can be dispatched manually.
    pub fn allows_manual(&self) -> bool {
        self.workflow_dispatch.is_some()
    }
}

/// A single `schedule:` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CronEntry {
    /// Cron expression (5-field POSIX, UTC)
    pub cron: String,
}

/// Manual dispatch configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DispatchConfig {
    /// Declared inputs
    #[serde(default)]
    pub inputs: IndexMap<String, DispatchInput>,
}

impl DispatchConfig {
    /// Names of inputs that must be supplied (required and without a default).
    pub fn required_inputs(&self) -> Vec<&str> {
        self.inputs
            .iter()
            .filter(|(_, input)| input.required && input.default.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// A manual dispatch input.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DispatchInput {
    /// Description shown to the user
    #[serde(default)]
    pub description: Option<String>,

    /// Whether the input is required
    #[serde(default)]
    pub required: bool,

    /// Default value
    #[serde(default)]
    pub default: Option<Scalar>,

    /// Input type (string, boolean, choice, number, environment)
    #[serde(default, rename = "type")]
    pub input_type: Option<String>,

    /// Allowed values for `choice` inputs
    #[serde(default)]
    pub options: Vec<String>,
}

/// A job: an ordered list of steps.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Job {
    /// Display name of the job
    #[serde(default)]
    pub name: Option<String>,

    /// Runner label; accepted and ignored, the local host is the runner
    #[serde(default)]
    pub runs_on: Option<serde_yaml::Value>,

    /// Environment for every step in the job
    #[serde(default)]
    pub env: ScalarMap,

    /// Timeout for each step in minutes (fractions allowed)
    #[serde(default)]
    pub timeout_minutes: Option<f64>,

    /// Steps to execute
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A step in a job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    /// Step identifier
    #[serde(default)]
    pub id: Option<String>,

    /// Name of the step
    #[serde(default)]
    pub name: Option<String>,

    /// Built-in action to run (`actions/checkout@v4`, ...)
    #[serde(default)]
    pub uses: Option<String>,

    /// Action inputs
    #[serde(default)]
    pub with: ScalarMap,

    /// Script to run
    #[serde(default)]
    pub run: Option<String>,

    /// Shell for `run`
    #[serde(default)]
    pub shell: Option<String>,

    /// Environment variables for this step
    #[serde(default)]
    pub env: ScalarMap,

    /// Working directory relative to the workspace
    #[serde(default)]
    pub working_directory: Option<String>,

    /// Keep going when this step fails
    #[serde(default)]
    pub continue_on_error: bool,

    /// Timeout in minutes (fractions allowed)
    #[serde(default)]
    pub timeout_minutes: Option<f64>,
}

impl Step {
    /// Name used in logs and reports.
    pub fn display_name(&self) -> String {
        if let Some(ref name) = self.name {
            return name.clone();
        }
        if let Some(ref uses) = self.uses {
            return format!("Run {uses}");
        }
        if let Some(ref run) = self.run {
            let first = run.lines().next().unwrap_or_default().trim();
            return format!("Run {first}");
        }
        self.id.clone().unwrap_or_else(|| "step".to_string())
    }
}

impl Workflow {
    /// Name of the workflow, falling back to `fallback` (usually the file stem).
    pub fn display_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(fallback)
    }

    /// Total number of steps across all jobs.
    pub fn step_count(&self) -> usize {
        self.jobs.values().map(|j| j.steps.len()).sum()
    }

    /// Iterate over every step with its job id.
    pub fn steps(&self) -> impl Iterator<Item = (&str, &Step)> {
        self.jobs.iter().flat_map(|(id, job)| job.steps.iter().map(move |s| (id.as_str(), s)))
    }

    /// Every template string in the workflow that may contain expressions.
    pub fn templates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.env.values().map(Scalar::as_str).collect();
        for job in self.jobs.values() {
            out.extend(job.env.values().map(Scalar::as_str));
            for step in &job.steps {
                out.extend(step.env.values().map(Scalar::as_str));
                out.extend(step.with.values().map(Scalar::as_str));
                if let Some(ref run) = step.run {
                    out.push(run);
                }
            }
        }
        out
    }
}

// `on:` may be a single event name, a list of names, or a map.

#[derive(Deserialize)]
#[serde(untagged)]
enum OnSpec {
    Single(String),
    List(Vec<String>),
    Map(OnMap),
}

#[derive(Deserialize)]
struct OnMap {
    #[serde(default)]
    schedule: Vec<CronEntry>,

    #[serde(default, deserialize_with = "present")]
    workflow_dispatch: Option<Option<DispatchConfig>>,

    #[serde(flatten)]
    other: IndexMap<String, serde_yaml::Value>,
}

/// Distinguish `key:` (present, null) from an absent key.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl<'de> Deserialize<'de> for Triggers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names_to_triggers = |names: Vec<String>| {
            let mut triggers = Self::default();
            for name in names {
                match name.as_str() {
                    "workflow_dispatch" => triggers.workflow_dispatch = Some(DispatchConfig::default()),
                    // A bare `schedule` has no cron entries to act on.
                    _ => triggers.unsupported.push(name),
                }
            }
            triggers
        };

        Ok(match OnSpec::deserialize(deserializer)? {
            OnSpec::Single(name) => names_to_triggers(vec![name]),
            OnSpec::List(names) => names_to_triggers(names),
            OnSpec::Map(map) => Self {
                schedule: map.schedule,
                workflow_dispatch: map.workflow_dispatch.map(Option::unwrap_or_default),
                unsupported: map.other.into_keys().collect(),
            },
        })
    }
}
