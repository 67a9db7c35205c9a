//! Workflow runner.
//!
//! Executes the steps of a workflow strictly in order. Action steps prepare
//! the environment (checkout, Python, dependencies) and script steps run a
//! shell command. The first failing step halts the run unless it sets
//! `continue-on-error`; the remaining steps are recorded as skipped.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::Instrument;

use super::{RunError, RunReport, RunStatus, StepReport, StepStatus};
use crate::core::{Command, Executor, Shell, Stream};
use crate::provision::{ActionInput, ActionKind, ProvisionError, ProvisionSettings, Revision};
use crate::secrets::{Masker, SecretStore, SecretValue};
use crate::trigger::Trigger;
use crate::workflow::{interpolate, ExpressionContext, Job, Reference, Resolution, ScalarMap, Step, Workflow};

/// Receives every output line of a run after masking.
pub type OutputHandler = Box<dyn FnMut(&str, Stream) + Send>;

/// Everything a run needs besides the workflow itself.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Unique id of this run
    pub run_id: String,

    /// What started the run
    pub trigger: Trigger,

    /// Directory the steps run in
    pub workspace: PathBuf,

    /// Where `${{ secrets.* }}` come from
    pub secrets: SecretStore,

    /// Runtime settings for built-in actions
    pub settings: ProvisionSettings,

    /// Shell for `run:` steps that do not set one
    pub shell: Option<Shell>,
}

impl RunContext {
    /// Create a context with a fresh run id and default secret sources.
    pub fn new(trigger: Trigger, workspace: impl Into<PathBuf>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            trigger,
            workspace: workspace.into(),
            secrets: SecretStore::new(),
            settings: ProvisionSettings::default(),
            shell: None,
        }
    }

    /// Use a specific secret store.
    #[must_use]
    pub fn with_secrets(mut self, secrets: SecretStore) -> Self {
        self.secrets = secrets;
        self
    }

    /// Use specific runtime settings.
    #[must_use]
    pub fn with_settings(mut self, settings: ProvisionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the default shell.
    #[must_use]
    pub fn with_shell(mut self, shell: Option<Shell>) -> Self {
        self.shell = shell;
        self
    }

    /// Scratch directory for this run.
    pub fn tool_dir(&self) -> PathBuf {
        std::env::temp_dir().join(format!("dailyrun-{}", self.run_id))
    }
}

/// A step as it would run, for `--dry-run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    /// Job id
    pub job: String,

    /// Step display name
    pub name: String,

    /// Built-in action, or `None` for a script
    pub action: Option<ActionKind>,

    /// The `uses:` value or the script, with expressions unresolved
    pub detail: String,

    /// Whether a failure would be tolerated
    pub continue_on_error: bool,
}

/// Runs one workflow once.
pub struct WorkflowRunner {
    workflow: Workflow,
    name: String,
    ctx: RunContext,
    output: OutputHandler,
}

impl WorkflowRunner {
    /// Create a runner that echoes step output to this process's stdout and stderr.
    pub fn new(workflow: Workflow, ctx: RunContext) -> Self {
        let name = workflow.display_name("workflow").to_string();
        Self { workflow, name, ctx, output: Box::new(echo) }
    }

    /// Override the workflow name used in logs and the report.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Send step output somewhere other than the terminal.
    #[must_use]
    pub fn with_output(mut self, handler: impl FnMut(&str, Stream) + Send + 'static) -> Self {
        self.output = Box::new(handler);
        self
    }

    /// Id of the run this runner will perform.
    pub fn run_id(&self) -> &str {
        &self.ctx.run_id
    }

    /// The steps in execution order, without running anything.
    pub fn plan(&self) -> Vec<PlannedStep> {
        self.workflow
            .steps()
            .map(|(job, step)| PlannedStep {
                job: job.to_string(),
                name: step.display_name(),
                action: step.uses.as_deref().and_then(ActionKind::from_uses),
                detail: step.uses.clone().or_else(|| step.run.clone()).unwrap_or_default(),
                continue_on_error: step.continue_on_error,
            })
            .collect()
    }

    /// Execute the workflow.
    pub async fn run(self) -> RunReport {
        let span = tracing::info_span!("run", run_id = %self.ctx.run_id, workflow = %self.name);
        self.execute().instrument(span).await
    }

    async fn execute(self) -> RunReport {
        let Self { workflow, name, ctx, mut output } = self;
        let started_at = Utc::now();
        tracing::info!(trigger = %ctx.trigger, steps = workflow.step_count(), "Starting run");

        let mut session = Session::new(&ctx, &workflow, &name, &mut output);
        let mut steps = Vec::with_capacity(workflow.step_count());
        let mut failed = false;

        for (job_id, job) in &workflow.jobs {
            for step in &job.steps {
                let step_name = step.display_name();

                if failed {
                    tracing::debug!(step = %step_name, "Skipping step after failure");
                    steps.push(StepReport::skipped(job_id, step_name, "skipped after an earlier failure"));
                    continue;
                }

                let span = tracing::info_span!("step", job = %job_id, step = %step_name);
                let started = Instant::now();
                let result = session.step(job, step, &step_name).instrument(span).await;
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

                let report = match result {
                    Ok(done) => StepReport {
                        job: job_id.clone(),
                        name: step_name,
                        status: if done.skipped { StepStatus::Skipped } else { StepStatus::Success },
                        exit_code: done.exit_code,
                        duration_ms,
                        summary: done.summary,
                        error: None,
                    },
                    Err(err) => {
                        if step.continue_on_error {
                            tracing::warn!(error = %err, "Step failed, continuing because continue-on-error is set");
                        } else {
                            tracing::error!(error = %err, "Step failed");
                            failed = true;
                        }
                        StepReport {
                            job: job_id.clone(),
                            name: step_name,
                            status: err.step_status(),
                            exit_code: err.exit_code(),
                            duration_ms,
                            summary: None,
                            error: Some(err.to_string()),
                        }
                    }
                };
                steps.push(report);
            }
        }

        let revision = session.revision.take();
        drop(session);

        let tool_dir = ctx.tool_dir();
        if tool_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&tool_dir).await {
                tracing::debug!(path = ?tool_dir, error = %e, "Failed to remove tool directory");
            }
        }

        let status = if failed { RunStatus::Failure } else { RunStatus::Success };
        let report = RunReport {
            run_id: ctx.run_id.clone(),
            workflow: name,
            trigger: ctx.trigger.clone(),
            started_at,
            finished_at: Utc::now(),
            status,
            revision,
            steps,
        };
        tracing::info!(status = %report.status, duration_ms = report.duration().as_millis() as u64, "Run finished");
        report
    }
}

fn echo(line: &str, stream: Stream) {
    match stream {
        Stream::Stdout => println!("{line}"),
        Stream::Stderr => eprintln!("{line}"),
    }
}

fn runner_os() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        other => other,
    }
}

struct StepDone {
    skipped: bool,
    exit_code: Option<i32>,
    summary: Option<String>,
}

/// Lookups for `${{ }}` expressions inside one step.
struct Scope<'a> {
    secrets: &'a HashMap<String, SecretValue>,
    env: &'a BTreeMap<String, String>,
    inputs: &'a BTreeMap<String, String>,
    github: &'a BTreeMap<String, String>,
    runner: &'a BTreeMap<String, String>,
}

impl ExpressionContext for Scope<'_> {
    fn resolve(&self, reference: &Reference) -> Resolution {
        let lookup = |map: &BTreeMap<String, String>| {
            map.get(&reference.key).cloned().map_or(Resolution::Missing, Resolution::Value)
        };

        match reference.namespace.as_str() {
            "secrets" => self
                .secrets
                .get(&reference.key)
                .map_or(Resolution::Missing, |v| Resolution::Value(v.expose().to_string())),
            "env" => lookup(self.env),
            "inputs" => lookup(self.inputs),
            "github" => lookup(self.github),
            "runner" => lookup(self.runner),
            _ => Resolution::Unknown,
        }
    }
}

/// Mutable state carried from step to step.
struct Session<'a> {
    ctx: &'a RunContext,
    workflow_env: &'a ScalarMap,
    workflow_name: &'a str,
    output: &'a mut OutputHandler,
    secrets: HashMap<String, SecretValue>,
    masker: Masker,
    inputs: BTreeMap<String, String>,
    exports: BTreeMap<String, String>,
    path_prefix: Vec<PathBuf>,
    revision: Option<Revision>,
    tool_dir: PathBuf,
}

impl<'a> Session<'a> {
    fn new(
        ctx: &'a RunContext,
        workflow: &'a Workflow,
        workflow_name: &'a str,
        output: &'a mut OutputHandler,
    ) -> Self {
        let mut secrets = HashMap::new();
        let mut masker = Masker::new();

        for name in workflow.referenced_secrets() {
            match ctx.secrets.resolve(&name) {
                Some(resolved) => {
                    tracing::debug!(secret = %name, source = %resolved.source, "Resolved secret");
                    masker.add(&resolved.value);
                    secrets.insert(name, resolved.value);
                }
                None => tracing::debug!(secret = %name, "Secret is not configured"),
            }
        }

        Self {
            ctx,
            workflow_env: &workflow.env,
            workflow_name,
            output,
            secrets,
            masker,
            inputs: ctx.trigger.inputs().cloned().unwrap_or_default(),
            exports: BTreeMap::new(),
            path_prefix: Vec::new(),
            revision: None,
            tool_dir: ctx.tool_dir(),
        }
    }

    /// Variables every step sees, mirroring the CI host's defaults.
    fn context_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let workspace = self.ctx.workspace.display().to_string();
        let event = self.ctx.trigger.event_name().to_string();

        env.insert("CI".to_string(), "true".to_string());
        env.insert("DAILYRUN".to_string(), "true".to_string());
        env.insert("DAILYRUN_WORKSPACE".to_string(), workspace.clone());
        env.insert("GITHUB_WORKSPACE".to_string(), workspace);
        env.insert("DAILYRUN_RUN_ID".to_string(), self.ctx.run_id.clone());
        env.insert("GITHUB_RUN_ID".to_string(), self.ctx.run_id.clone());
        env.insert("DAILYRUN_EVENT_NAME".to_string(), event.clone());
        env.insert("GITHUB_EVENT_NAME".to_string(), event);
        env.insert("GITHUB_WORKFLOW".to_string(), self.workflow_name.to_string());
        env.insert("RUNNER_OS".to_string(), runner_os().to_string());
        env.insert("RUNNER_TEMP".to_string(), self.tool_dir.display().to_string());

        if let Some(ref revision) = self.revision {
            env.insert("DAILYRUN_SHA".to_string(), revision.sha.clone());
            env.insert("GITHUB_SHA".to_string(), revision.sha.clone());
            if let Some(ref branch) = revision.branch {
                env.insert("GITHUB_REF_NAME".to_string(), branch.clone());
            }
        }

        env
    }

    fn github_context(&self) -> BTreeMap<String, String> {
        let mut github = BTreeMap::new();
        github.insert("event_name".to_string(), self.ctx.trigger.event_name().to_string());
        github.insert("workspace".to_string(), self.ctx.workspace.display().to_string());
        github.insert("run_id".to_string(), self.ctx.run_id.clone());
        github.insert("workflow".to_string(), self.workflow_name.to_string());
        if let Some(ref revision) = self.revision {
            github.insert("sha".to_string(), revision.sha.clone());
            if let Some(ref branch) = revision.branch {
                github.insert("ref_name".to_string(), branch.clone());
            }
        }
        github
    }

    fn runner_context(&self) -> BTreeMap<String, String> {
        let mut runner = BTreeMap::new();
        runner.insert("os".to_string(), runner_os().to_string());
        runner.insert("temp".to_string(), self.tool_dir.display().to_string());
        runner
    }

    /// Interpolate one template against `env`, logging anything that came out empty.
    fn interpolate(&self, template: &str, env: &BTreeMap<String, String>) -> String {
        let github = self.github_context();
        let runner = self.runner_context();
        let scope = Scope {
            secrets: &self.secrets,
            env,
            inputs: &self.inputs,
            github: &github,
            runner: &runner,
        };

        let result = interpolate(template, &scope);
        for unresolved in &result.unresolved {
            match Reference::parse(&unresolved.expression) {
                Some(reference) if reference.is_secret() => {
                    tracing::warn!(secret = %reference.key, "Secret is not configured, using an empty value");
                }
                Some(_) if unresolved.missing => {
                    tracing::debug!(expression = %unresolved.expression, "Expression has no value");
                }
                _ => {
                    tracing::warn!(expression = %unresolved.expression, "Unsupported expression evaluated to an empty string");
                }
            }
        }
        result.text
    }

    /// Layer `values` over `env`; each value may reference the outer layers.
    fn layer(&self, env: &mut BTreeMap<String, String>, values: &ScalarMap) {
        let resolved: Vec<(String, String)> =
            values.iter().map(|(k, v)| (k.clone(), self.interpolate(v.as_str(), env))).collect();
        env.extend(resolved);
    }

    /// The environment of a step: context, workflow, job, exports, then step.
    fn step_env(&self, job: &Job, step: &Step) -> BTreeMap<String, String> {
        let mut env = self.context_env();
        self.layer(&mut env, self.workflow_env);
        self.layer(&mut env, &job.env);
        env.extend(self.exports.clone());
        self.layer(&mut env, &step.env);
        env
    }

    async fn step(&mut self, job: &Job, step: &Step, name: &str) -> Result<StepDone, RunError> {
        let timeout = step
            .timeout_minutes
            .or(job.timeout_minutes)
            .and_then(|m| Duration::try_from_secs_f64(m * 60.0).ok());
        let executor = Executor::new().maybe_timeout(timeout);
        let env = self.step_env(job, step);

        match (&step.uses, &step.run) {
            (Some(uses), _) => self.action(uses, step, name, env, &executor).await,
            (None, Some(script)) => self.script(script, step, name, env, &executor).await,
            (None, None) => Err(RunError::UnsupportedAction { step: name.to_string(), uses: String::new() }),
        }
    }

    async fn script(
        &mut self,
        script: &str,
        step: &Step,
        name: &str,
        env: BTreeMap<String, String>,
        executor: &Executor,
    ) -> Result<StepDone, RunError> {
        let shell = match step.shell.as_deref() {
            Some(shell) => shell.parse::<Shell>().map_err(|reason| RunError::Spawn {
                step: name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, reason),
            })?,
            None => self.ctx.shell.unwrap_or_else(Shell::platform_default),
        };

        let text = self.interpolate(script, &env);
        let dir = match step.working_directory.as_deref() {
            Some(sub) => self.ctx.workspace.join(sub),
            None => self.ctx.workspace.clone(),
        };

        let command = Command::shell(name, shell, text)
            .with_working_dir(dir)
            .with_envs(env.iter())
            .with_path_prefix(&self.path_prefix);
        tracing::info!(shell = %shell, "Running script");

        let masker = &self.masker;
        let output = &mut *self.output;
        let result = executor
            .execute(&command, |line, stream| forward(masker, output, line, stream))
            .await
            .map_err(|source| RunError::Spawn { step: name.to_string(), source })?;

        if result.timed_out {
            return Err(RunError::Timeout { step: name.to_string(), limit: executor.timeout.unwrap_or_default() });
        }
        if !result.success() {
            return Err(RunError::StepFailed { step: name.to_string(), code: result.code() });
        }

        Ok(StepDone { skipped: false, exit_code: result.code(), summary: None })
    }

    async fn action(
        &mut self,
        uses: &str,
        step: &Step,
        name: &str,
        env: BTreeMap<String, String>,
        executor: &Executor,
    ) -> Result<StepDone, RunError> {
        let kind = ActionKind::from_uses(uses).ok_or_else(|| RunError::UnsupportedAction {
            step: name.to_string(),
            uses: uses.to_string(),
        })?;

        let with: BTreeMap<String, String> =
            step.with.iter().map(|(k, v)| (k.clone(), self.interpolate(v.as_str(), &env))).collect();
        tracing::info!(action = %kind, "Running action");

        let masker = &self.masker;
        let output = &mut *self.output;
        let mut sink = |line: &str, stream: Stream| forward(masker, output, line, stream);
        let input = ActionInput {
            workspace: &self.ctx.workspace,
            with: &with,
            env: &env,
            path_prefix: &self.path_prefix,
            tool_dir: &self.tool_dir,
            executor,
            settings: &self.ctx.settings,
        };

        let outcome = kind.action().run(input, &mut sink).await.map_err(|e| match e {
            ProvisionError::TimedOut => {
                RunError::Timeout { step: name.to_string(), limit: executor.timeout.unwrap_or_default() }
            }
            source => RunError::Setup { step: name.to_string(), source },
        })?;

        if let Some(ref summary) = outcome.summary {
            tracing::info!("{summary}");
        }
        self.exports.extend(outcome.exports);
        self.path_prefix.splice(0..0, outcome.path);
        if outcome.revision.is_some() {
            self.revision = outcome.revision;
        }

        Ok(StepDone { skipped: outcome.skipped, exit_code: None, summary: outcome.summary })
    }
}

fn forward(masker: &Masker, output: &mut OutputHandler, line: &str, stream: Stream) {
    let masked = masker.mask(line);
    tracing::trace!(target: "dailyrun::output", ?stream, "{masked}");
    output(&masked, stream);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::workflow::parse_workflow_str;

    fn context(workspace: &std::path::Path) -> RunContext {
        RunContext::new(Trigger::manual(), workspace)
            .with_secrets(SecretStore::empty().with_secret("OPENAI_API_KEY", "sk-test-value"))
            .with_shell(Some(Shell::Sh))
    }

    fn capture(runner: WorkflowRunner) -> (WorkflowRunner, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        (runner.with_output(move |line, _| sink.lock().push(line.to_string())), lines)
    }

    #[test]
    fn test_plan_lists_steps_in_order() {
        let workflow = parse_workflow_str(
            r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - uses: actions/checkout@v3
      - name: Run script
        run: python auto_gen_news.py ${{ secrets.OPENAI_API_KEY }}
        continue-on-error: true
"#,
        )
        .unwrap();
        let runner = WorkflowRunner::new(workflow, RunContext::new(Trigger::manual(), "."));
        let plan = runner.plan();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].action, Some(ActionKind::Checkout));
        assert_eq!(plan[1].name, "Run script");
        assert!(plan[1].detail.contains("${{ secrets.OPENAI_API_KEY }}"));
        assert!(plan[1].continue_on_error);
    }

    #[test]
    fn test_scope_resolution() {
        let secrets: HashMap<String, SecretValue> =
            [("WP_BLOG_ID".to_string(), SecretValue::new("241913052"))].into_iter().collect();
        let env: BTreeMap<String, String> = [("LANG".to_string(), "en".to_string())].into();
        let empty = BTreeMap::new();
        let scope = Scope { secrets: &secrets, env: &env, inputs: &empty, github: &empty, runner: &empty };

        let text = interpolate("${{ secrets.WP_BLOG_ID }}/${{ env.LANG }}/${{ secrets.NONE }}", &scope);
        assert_eq!(text.text, "241913052/en/");
        assert_eq!(text.unresolved.len(), 1);
        assert!(text.unresolved[0].missing);

        let unknown = interpolate("${{ matrix.os }}", &scope);
        assert!(!unknown.unresolved[0].missing);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_layers_and_context_variables() {
        let temp = tempfile::TempDir::new().unwrap();
        let workflow = parse_workflow_str(
            r#"
on: workflow_dispatch
env:
  LEVEL: workflow
  GREETING: hello
jobs:
  build:
    env:
      LEVEL: job
    steps:
      - env:
          MESSAGE: ${{ env.GREETING }}-${{ env.LEVEL }}
        run: echo "$MESSAGE $DAILYRUN_EVENT_NAME $CI $GITHUB_EVENT_NAME"
"#,
        )
        .unwrap();

        let (runner, lines) = capture(WorkflowRunner::new(workflow, context(temp.path())));
        let report = runner.run().await;

        assert!(report.success());
        assert_eq!(*lines.lock(), vec!["hello-job workflow_dispatch true workflow_dispatch"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_secret_output_is_masked() {
        let temp = tempfile::TempDir::new().unwrap();
        let workflow = parse_workflow_str(
            r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - env:
          OPENAI_API_KEY: ${{ secrets.OPENAI_API_KEY }}
        run: echo "key=$OPENAI_API_KEY"
"#,
        )
        .unwrap();

        let (runner, lines) = capture(WorkflowRunner::new(workflow, context(temp.path())));
        let report = runner.run().await;

        assert!(report.success());
        assert_eq!(*lines.lock(), vec!["key=***"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_working_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("scripts")).unwrap();
        let workflow = parse_workflow_str(
            r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - working-directory: scripts
        run: basename "$(pwd)"
"#,
        )
        .unwrap();

        let (runner, lines) = capture(WorkflowRunner::new(workflow, context(temp.path())));
        assert!(runner.run().await.success());
        assert_eq!(*lines.lock(), vec!["scripts"]);
    }
}
