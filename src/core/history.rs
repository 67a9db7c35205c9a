//! Run history.
//!
//! Every finished run is appended to a JSON file so `dailyrun history` can
//! show what happened overnight. The file keeps the newest `max_runs`
//! records. Records carry metadata only.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::run::RunReport;

/// Default number of runs kept.
pub const DEFAULT_MAX_RUNS: usize = 100;

/// On-disk layout of the history file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HistoryFile {
    /// Version for future migrations
    #[serde(default)]
    version: u32,

    /// Runs, oldest first
    #[serde(default)]
    runs: Vec<RunReport>,
}

/// Persistent record of finished runs.
///
/// Writes are serialized through a mutex so concurrent runs in the daemon
/// do not clobber each other's records.
#[derive(Debug)]
pub struct RunHistory {
    /// Path to the history file
    path: PathBuf,
    /// Maximum number of runs to keep
    max_runs: usize,
    lock: Mutex<()>,
}

impl RunHistory {
    /// Create a history stored at `path`.
    pub fn new(path: impl Into<PathBuf>, max_runs: usize) -> Self {
        Self { path: path.into(), max_runs: max_runs.max(1), lock: Mutex::new(()) }
    }

    /// Path of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_file(&self) -> anyhow::Result<HistoryFile> {
        if !self.path.exists() {
            return Ok(HistoryFile::default());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HistoryFile::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save_file(&self, file: &HistoryFile) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(file)?;

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write then rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Append a finished run, pruning the oldest records past the limit.
    pub fn record(&self, report: &RunReport) -> anyhow::Result<()> {
        let _guard = self.lock.lock();

        let mut file = self.load_file()?;
        file.runs.push(report.clone());
        if file.runs.len() > self.max_runs {
            let excess = file.runs.len() - self.max_runs;
            file.runs.drain(..excess);
        }

        self.save_file(&file)?;
        tracing::debug!(path = ?self.path, runs = file.runs.len(), "Recorded run");
        Ok(())
    }

    /// All stored runs, oldest first.
    pub fn load(&self) -> anyhow::Result<Vec<RunReport>> {
        let _guard = self.lock.lock();
        Ok(self.load_file()?.runs)
    }

    /// The most recent runs, newest first.
    pub fn recent(&self, limit: usize) -> anyhow::Result<Vec<RunReport>> {
        let mut runs = self.load()?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::run::RunStatus;
    use crate::trigger::Trigger;

    fn report(n: i64, status: RunStatus) -> RunReport {
        let started_at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n);
        RunReport {
            run_id: format!("run-{n}"),
            workflow: "Daily News".into(),
            trigger: Trigger::Schedule { cron: "0 0 * * *".into() },
            started_at,
            finished_at: started_at + Duration::seconds(42),
            status,
            revision: None,
            steps: Vec::new(),
        }
    }

    #[test]
    fn test_empty_history() {
        let temp = TempDir::new().unwrap();
        let history = RunHistory::new(temp.path().join("runs.json"), 10);
        assert!(history.load().unwrap().is_empty());
        assert!(history.recent(5).unwrap().is_empty());
    }

    #[test]
    fn test_record_and_recent() {
        let temp = TempDir::new().unwrap();
        let history = RunHistory::new(temp.path().join("nested").join("runs.json"), 10);

        history.record(&report(1, RunStatus::Success)).unwrap();
        history.record(&report(2, RunStatus::Failure)).unwrap();
        history.record(&report(3, RunStatus::Success)).unwrap();

        let recent = history.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "run-3");
        assert_eq!(recent[1].run_id, "run-2");
        assert_eq!(recent[1].status, RunStatus::Failure);
    }

    #[test]
    fn test_prunes_oldest() {
        let temp = TempDir::new().unwrap();
        let history = RunHistory::new(temp.path().join("runs.json"), 3);

        for n in 0..5 {
            history.record(&report(n, RunStatus::Success)).unwrap();
        }

        let ids: Vec<String> = history.load().unwrap().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec!["run-2", "run-3", "run-4"]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("runs.json");
        fs::write(&path, "{ not json").unwrap();

        let history = RunHistory::new(&path, 10);
        assert!(history.load().is_err());
        assert!(history.record(&report(1, RunStatus::Success)).is_err());
    }
}
