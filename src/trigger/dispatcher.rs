//! Trigger dispatcher.
//!
//! Starts exactly one run per trigger event: once per manual dispatch, and
//! once per cron fire while the daemon is running. Runs are independent
//! tasks. Nothing prevents a scheduled run from overlapping a manual one,
//! and fires missed while the host was down are not replayed.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinSet;

use super::{ScheduleError, ScheduleSpec, Trigger};
use crate::core::{RunHistory, Shell, Stream};
use crate::provision::ProvisionSettings;
use crate::run::{RunContext, RunReport, WorkflowRunner};
use crate::secrets::SecretStore;
use crate::workflow::WorkflowFile;

/// Longest single sleep; the wall clock is re-checked after each one.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// A fire noticed later than this is treated as missed.
const MISSED_AFTER_SECS: i64 = 120;

/// Errors raised before a run starts.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The workflow does not accept manual runs.
    #[error("Workflow '{0}' does not declare workflow_dispatch (use --force to run it anyway)")]
    ManualNotAllowed(String),

    /// A required input was not provided and has no default.
    #[error("Missing required input '{0}'")]
    MissingInput(String),

    /// An input was provided that the workflow does not declare.
    #[error("Unknown input '{0}'")]
    UnknownInput(String),

    /// A choice input got a value outside its options.
    #[error("Input '{input}' must be one of: {}", .options.join(", "))]
    InvalidChoice { input: String, value: String, options: Vec<String> },

    /// A boolean input got something other than true/false.
    #[error("Input '{input}' must be true or false, got '{value}'")]
    InvalidBoolean { input: String, value: String },

    /// The daemon was started for a workflow without schedules.
    #[error("Workflow '{0}' has no schedule")]
    NoSchedules(String),

    /// A cron expression did not parse.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Where step output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Stdout lines to stdout, stderr lines to stderr
    #[default]
    Inherit,
    /// Everything to stderr (keeps stdout clean for `--json`)
    Stderr,
    /// Dropped
    Discard,
}

/// Settings applied to every run the dispatcher starts.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Directory the workflow runs in
    pub workspace: PathBuf,

    /// Secret sources
    pub secrets: SecretStore,

    /// Runtime settings for built-in actions
    pub settings: ProvisionSettings,

    /// Default shell for `run:` steps
    pub shell: Option<Shell>,

    /// Where finished runs are recorded
    pub history: Option<Arc<RunHistory>>,

    /// How long the daemon waits for in-flight runs on shutdown
    pub shutdown_grace: Duration,

    /// Where step output goes
    pub output: OutputMode,
}

impl DispatcherOptions {
    /// Options with default settings for `workspace`.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            secrets: SecretStore::new(),
            settings: ProvisionSettings::default(),
            shell: None,
            history: None,
            shutdown_grace: Duration::from_secs(30),
            output: OutputMode::Inherit,
        }
    }
}

/// Counters reported when the daemon stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonStats {
    /// Runs started
    pub fired: usize,
    /// Runs that finished successfully
    pub succeeded: usize,
    /// Runs that failed or were aborted
    pub failed: usize,
    /// Fires skipped because they were noticed too late
    pub missed: usize,
}

struct Inner {
    workflow: WorkflowFile,
    options: DispatcherOptions,
}

/// Starts runs of one workflow.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher for a loaded workflow.
    pub fn new(workflow: WorkflowFile, options: DispatcherOptions) -> Self {
        Self { inner: Arc::new(Inner { workflow, options }) }
    }

    /// The workflow this dispatcher runs.
    pub fn workflow(&self) -> &WorkflowFile {
        &self.inner.workflow
    }

    /// Parsed cron schedules of the workflow.
    pub fn schedules(&self) -> Result<Vec<ScheduleSpec>, DispatchError> {
        self.inner
            .workflow
            .workflow
            .on
            .schedule
            .iter()
            .map(|entry| ScheduleSpec::parse(&entry.cron).map_err(DispatchError::from))
            .collect()
    }

    /// Check manual inputs against the workflow's `workflow_dispatch.inputs`.
    ///
    /// Defaults fill in missing values. With `force`, a workflow that does not
    /// declare `workflow_dispatch` is accepted and inputs pass through as given.
    pub fn resolve_inputs(
        &self,
        mut provided: BTreeMap<String, String>,
        force: bool,
    ) -> Result<BTreeMap<String, String>, DispatchError> {
        let workflow = &self.inner.workflow;
        let Some(ref dispatch) = workflow.workflow.on.workflow_dispatch else {
            if force {
                tracing::warn!("Workflow does not declare workflow_dispatch, running anyway");
                return Ok(provided);
            }
            return Err(DispatchError::ManualNotAllowed(workflow.name().to_string()));
        };

        let mut resolved = BTreeMap::new();
        for (name, input) in &dispatch.inputs {
            let value = provided
                .remove(name)
                .or_else(|| input.default.as_ref().map(|d| d.as_str().to_string()));

            let Some(value) = value else {
                if input.required {
                    return Err(DispatchError::MissingInput(name.clone()));
                }
                continue;
            };

            match input.input_type.as_deref() {
                Some("choice") if !input.options.is_empty() && !input.options.contains(&value) => {
                    return Err(DispatchError::InvalidChoice {
                        input: name.clone(),
                        value,
                        options: input.options.clone(),
                    });
                }
                Some("boolean") if value != "true" && value != "false" => {
                    return Err(DispatchError::InvalidBoolean { input: name.clone(), value });
                }
                _ => {}
            }
            resolved.insert(name.clone(), value);
        }

        if let Some(unknown) = provided.into_keys().next() {
            return Err(DispatchError::UnknownInput(unknown));
        }

        Ok(resolved)
    }

    /// Build the runner for one run.
    pub fn runner(&self, trigger: Trigger) -> WorkflowRunner {
        let options = &self.inner.options;
        let ctx = RunContext::new(trigger, options.workspace.clone())
            .with_secrets(options.secrets.clone())
            .with_settings(options.settings.clone())
            .with_shell(options.shell);

        let runner = WorkflowRunner::new(self.inner.workflow.workflow.clone(), ctx)
            .with_name(self.inner.workflow.name());

        match options.output {
            OutputMode::Inherit => runner,
            OutputMode::Stderr => runner.with_output(|line, _: Stream| eprintln!("{line}")),
            OutputMode::Discard => runner.with_output(|_, _: Stream| {}),
        }
    }

    /// Start one run for `trigger` and record it.
    pub async fn run_trigger(&self, trigger: Trigger) -> RunReport {
        let report = self.runner(trigger).run().await;

        if let Some(ref history) = self.inner.options.history {
            let history = Arc::clone(history);
            let entry = report.clone();
            match tokio::task::spawn_blocking(move || history.record(&entry)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to record run history"),
                Err(e) => tracing::warn!(error = %e, "History writer task failed"),
            }
        }

        report
    }

    /// Start one manual run.
    pub async fn dispatch_manual(
        &self,
        inputs: BTreeMap<String, String>,
        force: bool,
    ) -> Result<RunReport, DispatchError> {
        let inputs = self.resolve_inputs(inputs, force)?;
        tracing::info!(workflow = self.inner.workflow.name(), inputs = inputs.len(), "Manual dispatch");
        Ok(self.run_trigger(Trigger::Manual { inputs }).await)
    }

    /// Fire the workflow on its schedules until `shutdown` completes.
    pub async fn run_daemon<F>(&self, shutdown: F) -> Result<DaemonStats, DispatchError>
    where
        F: Future<Output = ()>,
    {
        let schedules = self.schedules()?;
        if schedules.is_empty() {
            return Err(DispatchError::NoSchedules(self.inner.workflow.name().to_string()));
        }

        for spec in &schedules {
            tracing::info!(cron = spec.expression(), cadence = %spec.cadence(), "Schedule registered");
        }

        tokio::pin!(shutdown);
        let mut tasks: JoinSet<RunReport> = JoinSet::new();
        let mut stats = DaemonStats::default();
        let mut last_fired: Option<DateTime<Utc>> = None;
        let mut pending: Option<(DateTime<Utc>, Vec<usize>)> = None;

        loop {
            if pending.is_none() {
                let now = Utc::now();
                let after = last_fired.map_or(now, |t| t.max(now));
                pending = next_fire(&schedules, &after);
                if let Some((at, _)) = pending {
                    tracing::info!(next = %at, "Waiting for next scheduled run");
                }
            }
            let Some(at) = pending.as_ref().map(|(at, _)| *at) else {
                tracing::warn!("No future fire times, stopping");
                break;
            };

            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP);

            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record_outcome(&mut stats, joined);
                }
                () = tokio::time::sleep(wait) => {
                    let now = Utc::now();
                    if now < at {
                        continue;
                    }
                    let Some((at, fired)) = pending.take() else {
                        continue;
                    };
                    last_fired = Some(at);

                    if skip_missed(&mut stats, &now, &at, fired.len()) {
                        continue;
                    }

                    for index in fired {
                        let trigger = Trigger::Schedule { cron: schedules[index].expression().to_string() };
                        tracing::info!(cron = schedules[index].expression(), "Schedule fired");
                        let dispatcher = self.clone();
                        tasks.spawn(async move { dispatcher.run_trigger(trigger).await });
                        stats.fired += 1;
                    }
                }
            }
        }

        if !tasks.is_empty() {
            let grace = self.inner.options.shutdown_grace;
            tracing::info!(running = tasks.len(), grace_secs = grace.as_secs(), "Waiting for in-flight runs");

            let drain = async {
                while let Some(joined) = tasks.join_next().await {
                    record_outcome(&mut stats, joined);
                }
            };
            if tokio::time::timeout(grace, drain).await.is_err() {
                tracing::warn!(running = tasks.len(), "Grace period elapsed, aborting in-flight runs");
                stats.failed += tasks.len();
                tasks.abort_all();
            }
        }

        Ok(stats)
    }
}

/// Count a fire noticed too late as missed. Returns whether it was.
fn skip_missed(stats: &mut DaemonStats, now: &DateTime<Utc>, at: &DateTime<Utc>, fires: usize) -> bool {
    if (*now - *at).num_seconds() <= MISSED_AFTER_SECS {
        return false;
    }
    tracing::warn!(scheduled = %at, "Missed scheduled run, not replaying it");
    stats.missed += fires;
    true
}

fn record_outcome(stats: &mut DaemonStats, joined: Result<RunReport, tokio::task::JoinError>) {
    match joined {
        Ok(report) if report.success() => stats.succeeded += 1,
        Ok(report) => {
            tracing::warn!(run_id = report.run_id.as_str(), "Scheduled run failed");
            stats.failed += 1;
        }
        Err(e) => {
            tracing::error!(error = %e, "Run task panicked or was cancelled");
            stats.failed += 1;
        }
    }
}

/// The earliest fire time strictly after `after`, with every schedule that fires then.
pub fn next_fire(schedules: &[ScheduleSpec], after: &DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<usize>)> {
    let times: Vec<(usize, DateTime<Utc>)> =
        schedules.iter().enumerate().filter_map(|(i, s)| s.next_after(after).map(|t| (i, t))).collect();

    let earliest = times.iter().map(|(_, t)| *t).min()?;
    let fired = times.iter().filter(|(_, t)| *t == earliest).map(|(i, _)| *i).collect();
    Some((earliest, fired))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::workflow::parse_workflow_str;

    fn dispatcher(yaml: &str, workspace: &std::path::Path) -> Dispatcher {
        let workflow = parse_workflow_str(yaml).unwrap();
        let file = WorkflowFile { id: "daily".into(), path: workspace.join("daily.yml"), workflow };
        let mut options = DispatcherOptions::new(workspace);
        options.secrets = SecretStore::empty();
        options.shell = Some(Shell::Sh);
        options.output = OutputMode::Discard;
        Dispatcher::new(file, options)
    }

    fn inputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    const WITH_INPUTS: &str = r#"
on:
  workflow_dispatch:
    inputs:
      topic:
        required: true
      language:
        default: en
      mode:
        type: choice
        options: [draft, publish]
      dry:
        type: boolean
jobs:
  build:
    steps:
      - run: echo "$TOPIC"
"#;

    #[test]
    fn test_zero_inputs_need_no_arguments() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher("on:\n  workflow_dispatch:\njobs:\n  a:\n    steps:\n      - run: 'true'\n", temp.path());
        assert!(d.resolve_inputs(BTreeMap::new(), false).unwrap().is_empty());
    }

    #[test]
    fn test_inputs_defaults_and_required() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher(WITH_INPUTS, temp.path());

        let resolved = d.resolve_inputs(inputs(&[("topic", "ai")]), false).unwrap();
        assert_eq!(resolved, inputs(&[("topic", "ai"), ("language", "en")]));

        assert!(matches!(
            d.resolve_inputs(BTreeMap::new(), false),
            Err(DispatchError::MissingInput(name)) if name == "topic"
        ));
    }

    #[test]
    fn test_input_validation() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher(WITH_INPUTS, temp.path());

        assert!(matches!(
            d.resolve_inputs(inputs(&[("topic", "ai"), ("mode", "shout")]), false),
            Err(DispatchError::InvalidChoice { .. })
        ));
        assert!(matches!(
            d.resolve_inputs(inputs(&[("topic", "ai"), ("dry", "yes")]), false),
            Err(DispatchError::InvalidBoolean { .. })
        ));
        assert!(matches!(
            d.resolve_inputs(inputs(&[("topic", "ai"), ("extra", "1")]), false),
            Err(DispatchError::UnknownInput(name)) if name == "extra"
        ));
    }

    #[test]
    fn test_manual_requires_workflow_dispatch_unless_forced() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher(
            "on:\n  schedule:\n    - cron: '0 0 * * *'\njobs:\n  a:\n    steps:\n      - run: 'true'\n",
            temp.path(),
        );
        assert!(matches!(d.resolve_inputs(BTreeMap::new(), false), Err(DispatchError::ManualNotAllowed(_))));
        assert!(d.resolve_inputs(BTreeMap::new(), true).is_ok());
    }

    #[test]
    fn test_next_fire_picks_earliest() {
        let schedules = vec![
            ScheduleSpec::parse("0 0 * * *").unwrap(),
            ScheduleSpec::parse("30 6 * * *").unwrap(),
            ScheduleSpec::parse("0 0 * * *").unwrap(),
        ];
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 5, 0, 0).unwrap();

        let (at, fired) = next_fire(&schedules, &after).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 3, 10, 6, 30, 0).unwrap());
        assert_eq!(fired, vec![1]);

        let after = Utc.with_ymd_and_hms(2024, 3, 10, 7, 0, 0).unwrap();
        let (at, fired) = next_fire(&schedules, &after).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
        assert_eq!(fired, vec![0, 2]);

        assert!(next_fire(&[], &after).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dispatch_manual_records_history() {
        let temp = TempDir::new().unwrap();
        let workflow = parse_workflow_str(WITH_INPUTS).unwrap();
        let file = WorkflowFile { id: "daily".into(), path: temp.path().join("daily.yml"), workflow };
        let history = Arc::new(RunHistory::new(temp.path().join("runs.json"), 10));
        let mut options = DispatcherOptions::new(temp.path());
        options.secrets = SecretStore::empty();
        options.shell = Some(Shell::Sh);
        options.output = OutputMode::Discard;
        options.history = Some(Arc::clone(&history));

        let report = Dispatcher::new(file, options).dispatch_manual(inputs(&[("topic", "ai")]), false).await.unwrap();
        assert!(report.success());
        assert_eq!(report.trigger, Trigger::Manual { inputs: inputs(&[("topic", "ai"), ("language", "en")]) });

        let stored = history.load().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].run_id, report.run_id);
    }

    #[tokio::test]
    async fn test_daemon_requires_schedule() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher("on: workflow_dispatch\njobs:\n  a:\n    steps:\n      - run: 'true'\n", temp.path());
        let result = d.run_daemon(std::future::ready(())).await;
        assert!(matches!(result, Err(DispatchError::NoSchedules(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_daemon_fires_and_stops() {
        let temp = TempDir::new().unwrap();
        // Six fields: every second.
        let d = dispatcher(
            "on:\n  schedule:\n    - cron: '* * * * * *'\njobs:\n  a:\n    steps:\n      - run: 'true'\n",
            temp.path(),
        );

        let stats = d.run_daemon(tokio::time::sleep(Duration::from_millis(2500))).await.unwrap();
        assert!(stats.fired >= 1, "{stats:?}");
        assert_eq!(stats.succeeded, stats.fired);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn test_late_fire_is_counted_as_missed() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let mut stats = DaemonStats::default();

        // Host woke from sleep well after midnight.
        let late = at + chrono::Duration::minutes(45);
        assert!(skip_missed(&mut stats, &late, &at, 2));
        assert_eq!(stats.missed, 2);

        let on_time = at + chrono::Duration::seconds(MISSED_AFTER_SECS);
        assert!(!skip_missed(&mut stats, &on_time, &at, 1));
        assert!(!skip_missed(&mut stats, &at, &at, 1));
        assert_eq!(stats.missed, 2);
        assert_eq!(stats.fired, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_long_run_does_not_delay_next_fire() {
        let temp = TempDir::new().unwrap();
        let d = dispatcher(
            "on:\n  schedule:\n    - cron: '* * * * * *'\njobs:\n  a:\n    steps:\n      - run: sleep 3\n",
            temp.path(),
        );

        let stats = d.run_daemon(tokio::time::sleep(Duration::from_millis(3500))).await.unwrap();
        assert!(stats.fired >= 3, "{stats:?}");
        assert_eq!(stats.succeeded, stats.fired, "{stats:?}");
        assert_eq!(stats.missed, 0);
    }
}
