//! Runner Integration Tests
//!
//! Runs whole workflows through the library API and checks the reports.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use dailyrun::core::Shell;
use dailyrun::run::{RunContext, RunReport, RunStatus, StepStatus, WorkflowRunner};
use dailyrun::secrets::SecretStore;
use dailyrun::trigger::Trigger;
use dailyrun::workflow::parse_workflow_str;

/// Run `yaml` in `workspace`, returning the report and every output line.
async fn run_workflow(
    yaml: &str,
    workspace: &Path,
    trigger: Trigger,
    secrets: SecretStore,
) -> (RunReport, Vec<String>) {
    let workflow = parse_workflow_str(yaml).unwrap();
    let ctx = RunContext::new(trigger, workspace).with_secrets(secrets).with_shell(Some(Shell::Sh));

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let report = WorkflowRunner::new(workflow, ctx)
        .with_output(move |line, _| sink.lock().push(line.to_string()))
        .run()
        .await;

    let lines = lines.lock().clone();
    (report, lines)
}

async fn run_manual(yaml: &str, workspace: &Path) -> (RunReport, Vec<String>) {
    run_workflow(yaml, workspace, Trigger::manual(), SecretStore::empty()).await
}

// ============================================================================
// Failure Handling
// ============================================================================

#[tokio::test]
async fn test_first_failure_halts_run() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - name: First
        run: echo first
      - name: Broken
        run: exit 3
      - name: Never
        run: echo never
"#;

    let (report, lines) = run_manual(yaml, temp.path()).await;

    assert_eq!(report.status, RunStatus::Failure);
    assert_eq!(report.steps.len(), 3);
    assert_eq!(report.steps[0].status, StepStatus::Success);
    assert_eq!(report.steps[1].status, StepStatus::Failure);
    assert_eq!(report.steps[1].exit_code, Some(3));
    assert_eq!(report.steps[2].status, StepStatus::Skipped);
    assert_eq!(report.failed_step().unwrap().name, "Broken");
    assert!(lines.contains(&"first".to_string()));
    assert!(!lines.contains(&"never".to_string()));
}

#[tokio::test]
async fn test_continue_on_error() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - name: Flaky
        run: exit 1
        continue-on-error: true
      - name: After
        run: echo after
"#;

    let (report, lines) = run_manual(yaml, temp.path()).await;

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.steps[0].status, StepStatus::Failure);
    assert_eq!(report.steps[1].status, StepStatus::Success);
    assert!(report.failed_step().is_none());
    assert!(lines.contains(&"after".to_string()));
}

#[tokio::test]
async fn test_step_timeout() {
    let temp = TempDir::new().unwrap();
    // 0.01 minutes is 600ms.
    let yaml = r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - name: Slow
        run: sleep 5
        timeout-minutes: 0.01
      - name: Never
        run: echo never
"#;

    let started = std::time::Instant::now();
    let (report, _) = run_manual(yaml, temp.path()).await;

    assert!(started.elapsed() < std::time::Duration::from_secs(4));
    assert_eq!(report.status, RunStatus::Failure);
    assert_eq!(report.steps[0].status, StepStatus::TimedOut);
    assert_eq!(report.steps[1].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_jobs_run_in_declaration_order() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
on: workflow_dispatch
jobs:
  zeta:
    steps:
      - run: echo zeta
  alpha:
    steps:
      - run: echo alpha
"#;

    let (report, lines) = run_manual(yaml, temp.path()).await;

    assert!(report.success());
    assert_eq!(lines, vec!["zeta", "alpha"]);
    assert_eq!(report.steps[0].job, "zeta");
    assert_eq!(report.steps[1].job, "alpha");
}

#[tokio::test]
async fn test_non_utf8_output_does_not_fail_step() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - name: Latin-1 headline
        run: |
          printf 'caf\351\n'
          echo after
          exit 0
"#;

    let (report, lines) = run_manual(yaml, temp.path()).await;

    assert_eq!(report.status, RunStatus::Success, "{report:?}");
    assert_eq!(report.steps[0].status, StepStatus::Success);
    assert_eq!(report.steps[0].exit_code, Some(0));
    assert_eq!(lines, vec!["caf\u{FFFD}", "after"]);
}

// ============================================================================
// Secrets & Inputs
// ============================================================================

#[tokio::test]
async fn test_secret_injected_and_masked() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - name: Use key
        env:
          OPENAI_API_KEY: ${{ secrets.OPENAI_API_KEY }}
        run: |
          test "$OPENAI_API_KEY" = "sk-live-abcdef"
          echo "using $OPENAI_API_KEY"
          echo "inline ${{ secrets.OPENAI_API_KEY }}"
"#;
    let secrets = SecretStore::empty().with_secret("OPENAI_API_KEY", "sk-live-abcdef");

    let (report, lines) = run_workflow(yaml, temp.path(), Trigger::manual(), secrets).await;

    assert!(report.success(), "{report:?}");
    assert_eq!(lines, vec!["using ***", "inline ***"]);

    let json = serde_json::to_string(&report).unwrap();
    assert!(!json.contains("sk-live-abcdef"));
}

#[tokio::test]
async fn test_missing_secret_is_empty() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - env:
          NEWS_API_KEY: ${{ secrets.NEWS_API_KEY }}
        run: test -z "$NEWS_API_KEY" && echo empty
"#;

    let (report, lines) = run_manual(yaml, temp.path()).await;

    assert!(report.success());
    assert_eq!(lines, vec!["empty"]);
}

#[tokio::test]
async fn test_inputs_and_event_name() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
on:
  workflow_dispatch:
    inputs:
      topic:
        default: tech
jobs:
  build:
    steps:
      - env:
          TOPIC: ${{ inputs.topic }}
        run: echo "$TOPIC via ${{ github.event_name }}"
"#;
    let inputs: BTreeMap<String, String> = [("topic".to_string(), "science".to_string())].into();

    let (report, lines) =
        run_workflow(yaml, temp.path(), Trigger::Manual { inputs }, SecretStore::empty()).await;

    assert!(report.success());
    assert_eq!(lines, vec!["science via workflow_dispatch"]);
}

#[tokio::test]
async fn test_scheduled_trigger_event_name() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
on:
  schedule:
    - cron: '0 0 * * *'
jobs:
  build:
    steps:
      - run: echo "$GITHUB_EVENT_NAME"
"#;
    let trigger = Trigger::Schedule { cron: "0 0 * * *".to_string() };

    let (report, lines) = run_workflow(yaml, temp.path(), trigger.clone(), SecretStore::empty()).await;

    assert!(report.success());
    assert_eq!(report.trigger, trigger);
    assert_eq!(lines, vec!["schedule"]);
}

// ============================================================================
// Actions
// ============================================================================

#[tokio::test]
async fn test_missing_manifest_skips_install() {
    let temp = TempDir::new().unwrap();
    let yaml = r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - uses: actions/checkout@v4
      - uses: dailyrun/install-requirements
      - run: echo done
"#;

    let (report, lines) = run_manual(yaml, temp.path()).await;

    assert!(report.success());
    assert_eq!(report.steps[1].status, StepStatus::Skipped);
    assert!(report.steps[1].summary.as_deref().unwrap().contains("requirements.txt"));
    assert_eq!(report.steps[2].status, StepStatus::Success);
    assert!(lines.contains(&"done".to_string()));
}

#[cfg(feature = "git")]
#[tokio::test]
async fn test_checkout_records_revision() {
    let temp = TempDir::new().unwrap();
    let repo = git2::Repository::init(temp.path()).unwrap();
    std::fs::write(temp.path().join("main.py"), "print('news')\n").unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(Path::new("main.py")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = git2::Signature::now("Test", "test@example.com").unwrap();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[]).unwrap();

    let yaml = r#"
on: workflow_dispatch
jobs:
  build:
    steps:
      - uses: actions/checkout@v4
      - run: echo "$GITHUB_SHA"
"#;

    let (report, lines) = run_manual(yaml, temp.path()).await;

    assert!(report.success(), "{report:?}");
    assert_eq!(report.revision.as_ref().unwrap().sha, oid.to_string());
    assert_eq!(lines.last().unwrap(), &oid.to_string());
}
