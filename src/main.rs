//! Dailyrun - run a scheduled workflow locally.
//!
//! Dailyrun runs a GitHub Actions style workflow on this machine, either on
//! its cron schedule (`dailyrun daemon`) or once on demand (`dailyrun dispatch`).

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dailyrun::core::{Config, RunHistory};
use dailyrun::run::RunReport;
use dailyrun::secrets::{self, SecretStore, SecretValue};
use dailyrun::trigger::{Dispatcher, DispatcherOptions, OutputMode, Trigger};
use dailyrun::workflow::{select_workflow, WorkflowFile};

/// Run a scheduled workflow locally
#[derive(Parser)]
#[command(name = "dailyrun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace directory (defaults to the configured workspace or the current directory)
    #[arg(short = 'C', long, global = true)]
    workspace: Option<PathBuf>,

    /// Workflow to run: a file path, or the id or name of a discovered workflow
    #[arg(short = 'w', long, global = true)]
    workflow: Option<String>,

    /// Config file (defaults to .dailyrun.toml or ~/.config/dailyrun/config.toml)
    #[arg(short, long, global = true, env = "DAILYRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Dotenv file with secrets, relative to the workspace
    #[arg(long, global = true)]
    secrets_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow once, now
    #[command(visible_alias = "run")]
    Dispatch {
        /// Dispatch input (KEY=VALUE, repeatable)
        #[arg(short, long = "input", value_name = "KEY=VALUE", value_parser = parse_input)]
        inputs: Vec<(String, String)>,

        /// Run even if the workflow does not declare workflow_dispatch
        #[arg(short, long)]
        force: bool,

        /// Show the steps that would run without running them
        #[arg(long)]
        dry_run: bool,

        /// Print the run report as JSON (step output goes to stderr)
        #[arg(long)]
        json: bool,
    },

    /// Run the workflow on its cron schedule until interrupted
    Daemon,

    /// Check the workflow and show its triggers
    Validate,

    /// Show upcoming scheduled runs
    Next {
        /// Number of fire times per schedule
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },

    /// Manage secrets
    Secrets {
        /// Secrets operation
        #[command(subcommand)]
        operation: SecretsOperation,
    },

    /// Show past runs
    History {
        /// Number of runs to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Secrets operations.
#[derive(Subcommand)]
enum SecretsOperation {
    /// Show which secrets the workflow references and whether they are configured
    Status,

    /// Store a secret in the OS keychain (value read from stdin)
    Set {
        /// Secret name
        name: String,
    },

    /// Remove a secret from the OS keychain
    Delete {
        /// Secret name
        name: String,
    },
}

fn parse_input(s: &str) -> Result<(String, String), String> {
    let (key, value) = s.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("input name is empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose {
        "debug"
    } else {
        match cli.command {
            Commands::Dispatch { .. } | Commands::Daemon => "info",
            _ => "warn",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    // Handle commands
    match cli.command {
        Commands::Dispatch { ref inputs, force, dry_run, json } => {
            let inputs: BTreeMap<String, String> = inputs.iter().cloned().collect();
            let success = cmd_dispatch(&cli, inputs, force, dry_run, json)?;
            if !success {
                std::process::exit(1);
            }
        }
        Commands::Daemon => {
            cmd_daemon(&cli)?;
        }
        Commands::Validate => {
            cmd_validate(&cli)?;
        }
        Commands::Next { count } => {
            cmd_next(&cli, count)?;
        }
        Commands::Secrets { ref operation } => {
            cmd_secrets(&cli, operation)?;
        }
        Commands::History { limit, ref format } => {
            cmd_history(&cli, limit, format)?;
        }
        Commands::Config { path } => {
            cmd_config(&cli, path)?;
        }
        Commands::Completions { shell } => {
            cmd_completions(shell);
        }
    }

    Ok(())
}

/// Load the configuration named on the command line, or the default one.
fn load_config(cli: &Cli) -> Result<Config> {
    match cli.config {
        Some(ref path) => Config::load_from_file(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

fn resolve_workspace(cli: &Cli, config: &Config) -> Result<PathBuf> {
    let workspace = match cli.workspace {
        Some(ref path) => path.clone(),
        None => config.workspace()?,
    };
    if !workspace.is_dir() {
        anyhow::bail!("Workspace {} is not a directory", workspace.display());
    }
    Ok(workspace)
}

fn load_workflow(cli: &Cli, config: &Config, workspace: &Path) -> Result<WorkflowFile> {
    let selector = cli.workflow.as_deref().or(config.general.workflow.as_deref());
    select_workflow(workspace, selector)
        .with_context(|| format!("Failed to load workflow in {}", workspace.display()))
}

fn secret_store(cli: &Cli, config: &Config, workspace: &Path) -> Result<SecretStore> {
    let explicit = match (&cli.secrets_file, &config.general.secrets_file) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(path)) => Some(dailyrun::core::expand_path(path)?),
        (None, None) => None,
    };
    SecretStore::new()
        .with_workspace_file(workspace, explicit.as_deref())
        .context("Failed to load secrets file")
}

fn open_history(config: &Config) -> Option<Arc<RunHistory>> {
    if !config.history.enabled {
        return None;
    }
    match config.history_path() {
        Ok(path) => Some(Arc::new(RunHistory::new(path, config.history.max_runs))),
        Err(e) => {
            tracing::warn!(error = %e, "Run history disabled");
            None
        }
    }
}

fn build_dispatcher(cli: &Cli, output: OutputMode) -> Result<Dispatcher> {
    let config = load_config(cli)?;
    let workspace = resolve_workspace(cli, &config)?;
    let workflow = load_workflow(cli, &config, &workspace)?;

    let mut options = DispatcherOptions::new(&workspace);
    options.secrets = secret_store(cli, &config, &workspace)?;
    options.settings = config.provision_settings();
    options.shell = config.shell()?;
    options.history = open_history(&config);
    options.shutdown_grace = Duration::from_secs(config.scheduler.shutdown_grace_secs);
    options.output = output;

    Ok(Dispatcher::new(workflow, options))
}

/// Dispatch a manual run. Returns whether it succeeded.
fn cmd_dispatch(
    cli: &Cli,
    inputs: BTreeMap<String, String>,
    force: bool,
    dry_run: bool,
    json: bool,
) -> Result<bool> {
    let output = if json { OutputMode::Stderr } else { OutputMode::Inherit };
    let dispatcher = build_dispatcher(cli, output)?;
    let inputs = dispatcher.resolve_inputs(inputs, force)?;

    if dry_run {
        print_plan(&dispatcher, inputs, json)?;
        return Ok(true);
    }

    // Create tokio runtime for async operations
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(dispatcher.run_trigger(Trigger::Manual { inputs }));

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(report.success())
}

fn print_plan(dispatcher: &Dispatcher, inputs: BTreeMap<String, String>, json: bool) -> Result<()> {
    let runner = dispatcher.runner(Trigger::Manual { inputs: inputs.clone() });
    let plan = runner.plan();

    if json {
        let steps: Vec<_> = plan
            .iter()
            .map(|step| {
                serde_json::json!({
                    "job": step.job,
                    "name": step.name,
                    "action": step.action.map(|a| a.to_string()),
                    "detail": step.detail,
                    "continue_on_error": step.continue_on_error,
                })
            })
            .collect();
        let doc = serde_json::json!({
            "workflow": dispatcher.workflow().name(),
            "inputs": inputs,
            "steps": steps,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let workflow = dispatcher.workflow();
    println!("Workflow: {} ({})", workflow.name(), workflow.path.display());
    for (name, value) in &inputs {
        println!("  input {name} = {value}");
    }
    println!("\nPlanned steps:");
    for (i, step) in plan.iter().enumerate() {
        let tolerated = if step.continue_on_error { "  (continue-on-error)" } else { "" };
        println!("  {}. [{}] {}{}", i + 1, step.job, step.name, tolerated);
        for line in step.detail.lines() {
            println!("       {line}");
        }
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    for step in &report.steps {
        let timing = format!("{:.1}s", step.duration().as_secs_f64());
        match (&step.summary, &step.error) {
            (_, Some(error)) => println!("  {} {} ({timing}): {error}", step.status.icon(), step.name),
            (Some(summary), None) => {
                println!("  {} {} ({timing}): {summary}", step.status.icon(), step.name);
            }
            (None, None) => println!("  {} {} ({timing})", step.status.icon(), step.name),
        }
    }

    let elapsed = report.duration().as_secs_f64();
    if report.success() {
        println!("\n✓ Run {} succeeded in {elapsed:.1}s", report.run_id);
    } else {
        let failed = report.failed_step().map_or("unknown step", |s| s.name.as_str());
        println!("\n✗ Run {} failed at '{failed}' after {elapsed:.1}s", report.run_id);
    }
}

/// Run on schedule until Ctrl-C or SIGTERM.
fn cmd_daemon(cli: &Cli) -> Result<()> {
    let dispatcher = build_dispatcher(cli, OutputMode::Inherit)?;

    let rt = tokio::runtime::Runtime::new()?;
    let stats = rt.block_on(dispatcher.run_daemon(shutdown_signal()))?;

    tracing::info!(
        fired = stats.fired,
        succeeded = stats.succeeded,
        failed = stats.failed,
        missed = stats.missed,
        "Daemon stopped"
    );
    Ok(())
}

/// Wait for Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl-C, shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}

/// Check the workflow and describe its triggers.
fn cmd_validate(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let workspace = resolve_workspace(cli, &config)?;
    let file = load_workflow(cli, &config, &workspace)?;
    let dispatcher = Dispatcher::new(file, DispatcherOptions::new(&workspace));
    let workflow = &dispatcher.workflow().workflow;

    println!("Workflow: {}", dispatcher.workflow().name());
    println!("File:     {}", dispatcher.workflow().path.display());
    println!("Jobs:     {} ({} steps)", workflow.jobs.len(), workflow.step_count());

    println!("\nTriggers:");
    for spec in dispatcher.schedules()? {
        println!("  schedule  {:<16} {}", spec.expression(), spec.cadence());
    }
    if let Some(ref dispatch) = workflow.on.workflow_dispatch {
        if dispatch.inputs.is_empty() {
            println!("  manual    workflow_dispatch");
        } else {
            let names: Vec<&str> = dispatch.inputs.keys().map(String::as_str).collect();
            println!("  manual    workflow_dispatch (inputs: {})", names.join(", "));
        }
    }
    for event in &workflow.on.unsupported {
        println!("  ignored   {event}");
    }

    let secrets = workflow.referenced_secrets();
    if !secrets.is_empty() {
        let names: Vec<&str> = secrets.iter().map(String::as_str).collect();
        println!("\nSecrets:  {}", names.join(", "));
    }

    println!("\n✓ Workflow is valid");
    Ok(())
}

/// Show upcoming fire times.
fn cmd_next(cli: &Cli, count: usize) -> Result<()> {
    let config = load_config(cli)?;
    let workspace = resolve_workspace(cli, &config)?;
    let file = load_workflow(cli, &config, &workspace)?;
    let dispatcher = Dispatcher::new(file, DispatcherOptions::new(&workspace));

    let schedules = dispatcher.schedules()?;
    if schedules.is_empty() {
        println!("Workflow '{}' has no schedule.", dispatcher.workflow().name());
        return Ok(());
    }

    let now = Utc::now();
    for spec in &schedules {
        println!("{} ({})", spec.expression(), spec.cadence());
        for at in spec.upcoming(&now, count) {
            let wait = at - now;
            println!(
                "  {}  in {}h {:02}m",
                at.format("%Y-%m-%d %H:%M:%S UTC"),
                wait.num_hours(),
                wait.num_minutes() % 60
            );
        }
    }
    Ok(())
}

/// Handle secrets commands.
fn cmd_secrets(cli: &Cli, operation: &SecretsOperation) -> Result<()> {
    match operation {
        SecretsOperation::Status => {
            let config = load_config(cli)?;
            let workspace = resolve_workspace(cli, &config)?;
            let file = load_workflow(cli, &config, &workspace)?;
            let store = secret_store(cli, &config, &workspace)?;

            let names = file.workflow.referenced_secrets();
            if names.is_empty() {
                println!("Workflow '{}' references no secrets.", file.name());
                return Ok(());
            }

            println!("Secrets referenced by '{}':\n", file.name());
            let mut missing = 0;
            for status in store.status(names.iter().map(String::as_str)) {
                match status.source {
                    Some(ref source) => println!("  ✓ {} ({source})", status.name),
                    None => {
                        missing += 1;
                        println!("  ✗ {} - not configured", status.name);
                    }
                }
            }

            if missing > 0 {
                println!("\nMissing secrets expand to empty strings. Set them with:");
                println!("  dailyrun secrets set NAME");
                println!("or export them, or add them to .dailyrun/secrets.env");
            }
        }

        SecretsOperation::Set { name } => {
            secrets::validate_name(name)?;

            let mut value = String::new();
            if atty_stdin() {
                eprint!("Value for {name}: ");
                io::stderr().flush()?;
                io::stdin().read_line(&mut value)?;
            } else {
                io::stdin().read_to_string(&mut value)?;
            }
            let value = SecretValue::new(value.trim_end_matches(['\r', '\n']));
            if value.is_empty() {
                anyhow::bail!("Refusing to store an empty secret");
            }

            secrets::keychain_set(name, &value)
                .with_context(|| format!("Failed to store secret '{name}'"))?;
            println!("✓ Stored {name} in the OS keychain");
        }

        SecretsOperation::Delete { name } => {
            secrets::validate_name(name)?;
            secrets::keychain_delete(name)
                .with_context(|| format!("Failed to delete secret '{name}'"))?;
            println!("✓ Deleted {name} from the OS keychain");
        }
    }

    Ok(())
}

fn atty_stdin() -> bool {
    use std::io::IsTerminal;
    io::stdin().is_terminal()
}

/// Show recorded runs.
fn cmd_history(cli: &Cli, limit: usize, format: &str) -> Result<()> {
    let config = load_config(cli)?;
    let Some(history) = open_history(&config) else {
        println!("Run history is disabled.");
        return Ok(());
    };

    let runs = history
        .recent(limit)
        .with_context(|| format!("Failed to read {}", history.path().display()))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
        "text" => {
            if runs.is_empty() {
                println!("No runs recorded yet.");
                return Ok(());
            }
            for run in &runs {
                let icon = if run.success() { "✓" } else { "✗" };
                let elapsed = run.duration().as_secs_f64();
                println!(
                    "  {icon} {}  {:<24} {:<20} {elapsed:>7.1}s  {}",
                    run.started_at.format("%Y-%m-%d %H:%M"),
                    run.trigger.to_string(),
                    run.workflow,
                    run.run_id
                );
                if let Some(step) = run.failed_step() {
                    println!("      failed at '{}'", step.name);
                }
            }
        }
        other => anyhow::bail!("Unknown format '{other}' (expected text or json)"),
    }

    Ok(())
}

/// Show configuration.
fn cmd_config(cli: &Cli, show_path: bool) -> Result<()> {
    if show_path {
        let path = cli
            .config
            .clone()
            .or_else(Config::locate)
            .or_else(|| Config::config_dir().map(|d| d.join("config.toml")));
        if let Some(path) = path {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let config = load_config(cli)?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{toml}");

    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "dailyrun", &mut io::stdout());
}
