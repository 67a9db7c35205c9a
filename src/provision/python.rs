//! `actions/setup-python`: locate an installed interpreter.
//!
//! Nothing is downloaded. The interpreters on `PATH` are probed and the
//! newest one satisfying `python-version` is exposed to later steps through
//! a per-run shim directory.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{Action, ActionInput, ActionOutcome, LineSink, ProvisionError, ProvisionResult};
use crate::core::{find_in_path, Command, Executor};

/// Executable names that look like a Python interpreter.
static INTERPRETER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^python(\d+(\.\d+)?)?(\.exe)?$").expect("interpreter pattern is valid")
});

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Constraint {
    /// Leading components must match (`3`, `3.11`, `3.x`); empty matches anything.
    Prefix(Vec<u32>),
    /// Comparison against a version padded with zeros.
    Compare(Op, Vec<u32>),
}

/// A `python-version` requirement such as `3.x`, `3.11` or `>=3.9,<3.13`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpec {
    raw: String,
    constraints: Vec<Constraint>,
}

impl VersionSpec {
    /// A spec that accepts any version.
    pub fn any() -> Self {
        Self { raw: "*".to_string(), constraints: Vec::new() }
    }

    /// Parse a version requirement.
    pub fn parse(raw: &str) -> ProvisionResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::any());
        }

        let invalid = || ProvisionError::InvalidVersion(raw.to_string());
        let mut constraints = Vec::new();

        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let operators = [(">=", Op::Ge), ("<=", Op::Le), ("==", Op::Eq), ("!=", Op::Ne), (">", Op::Gt), ("<", Op::Lt)];

            let constraint = match operators.iter().find(|(prefix, _)| part.starts_with(prefix)) {
                Some((prefix, op)) => {
                    let version = numbers(part[prefix.len()..].trim()).ok_or_else(invalid)?;
                    if version.is_empty() {
                        return Err(invalid());
                    }
                    Constraint::Compare(*op, version)
                }
                None => Constraint::Prefix(prefix_numbers(part).ok_or_else(invalid)?),
            };
            constraints.push(constraint);
        }

        Ok(Self { raw: raw.to_string(), constraints })
    }

    /// Check whether `version` satisfies every constraint.
    pub fn matches(&self, version: &[u32]) -> bool {
        self.constraints.iter().all(|c| match c {
            Constraint::Prefix(prefix) => version.starts_with(prefix),
            Constraint::Compare(op, target) => {
                let ord = compare_versions(version, target);
                match op {
                    Op::Ge => ord != Ordering::Less,
                    Op::Gt => ord == Ordering::Greater,
                    Op::Le => ord != Ordering::Greater,
                    Op::Lt => ord == Ordering::Less,
                    Op::Eq => ord == Ordering::Equal,
                    Op::Ne => ord != Ordering::Equal,
                }
            }
        })
    }

    /// A `major.minor` this spec pins, if any (for trying `python3.11` first).
    fn pinned_minor(&self) -> Option<(u32, u32)> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::Prefix(p) if p.len() >= 2 => Some((p[0], p[1])),
            _ => None,
        })
    }
}

impl FromStr for VersionSpec {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Dotted numbers, e.g. `3.11.4`.
fn numbers(text: &str) -> Option<Vec<u32>> {
    text.split('.').map(|n| n.parse().ok()).collect()
}

/// Dotted numbers optionally ending in a wildcard, e.g. `3.x` or `*`.
fn prefix_numbers(text: &str) -> Option<Vec<u32>> {
    let mut out = Vec::new();
    let mut parts = text.split('.').peekable();
    while let Some(part) = parts.next() {
        if matches!(part, "x" | "X" | "*") {
            // A wildcard must be last.
            return parts.peek().is_none().then_some(out);
        }
        out.push(part.parse().ok()?);
    }
    Some(out)
}

/// Compare two versions component-wise, padding the shorter with zeros.
fn compare_versions(a: &[u32], b: &[u32]) -> Ordering {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| a.get(i).copied().unwrap_or(0).cmp(&b.get(i).copied().unwrap_or(0)))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Parse `python --version` output ("Python 3.12.0") into components.
pub fn parse_python_version(output: &str) -> Option<Vec<u32>> {
    let line = output.lines().find(|l| l.trim_start().starts_with("Python "))?;
    let version = line.trim().strip_prefix("Python ")?.split_whitespace().next()?;

    // "3.13.0rc1" -> [3, 13, 0]
    let components: Vec<u32> = version
        .split('.')
        .map_while(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect();

    (!components.is_empty()).then_some(components)
}

/// A probed Python interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    /// Path to the executable
    pub path: PathBuf,

    /// Version components
    pub version: Vec<u32>,
}

impl Interpreter {
    /// Dotted version string.
    pub fn version_string(&self) -> String {
        self.version.iter().map(u32::to_string).collect::<Vec<_>>().join(".")
    }

    /// Installation prefix (`/usr` for `/usr/bin/python3`).
    pub fn prefix(&self) -> PathBuf {
        let dir = self.path.parent().unwrap_or(Path::new(""));
        let is_bin = dir.file_name().is_some_and(|n| n == "bin" || n == "Scripts");
        match dir.parent() {
            Some(parent) if is_bin => parent.to_path_buf(),
            _ => dir.to_path_buf(),
        }
    }

    async fn probe(path: PathBuf) -> Option<Self> {
        let mut output = String::new();
        let command = Command::new("python --version", path.to_string_lossy()).arg("--version");
        let result = Executor::new()
            .timeout(PROBE_TIMEOUT)
            .execute(&command, |line, _| {
                output.push_str(line);
                output.push('\n');
            })
            .await
            .ok()?;

        if !result.success() {
            return None;
        }
        let version = parse_python_version(&output)?;
        Some(Self { path, version })
    }
}

/// Candidate executables, in the order they should be preferred on ties.
fn candidates(spec: &VersionSpec, names: &[String], path: Option<&OsString>) -> Vec<PathBuf> {
    let mut ordered: Vec<String> = Vec::new();
    if let Some((major, minor)) = spec.pinned_minor() {
        ordered.push(format!("python{major}.{minor}"));
    }
    ordered.extend(names.iter().cloned());

    let mut found: Vec<PathBuf> = ordered.iter().filter_map(|name| find_in_path(name, path)).collect();

    // Versioned interpreters anywhere on PATH (python3.11, python3.12, ...).
    if let Some(path) = path {
        for dir in std::env::split_paths(path) {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut names: Vec<String> = entries
                .filter_map(Result::ok)
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|n| INTERPRETER_NAME.is_match(n))
                .collect();
            names.sort();
            let dir_path = std::env::join_paths([&dir]).ok();
            found.extend(names.iter().filter_map(|n| find_in_path(n, dir_path.as_ref())));
        }
    }

    let mut seen = HashSet::new();
    found.retain(|p| seen.insert(p.canonicalize().unwrap_or_else(|_| p.clone())));
    found
}

/// Find the newest interpreter on `path` satisfying `spec`.
pub async fn find_interpreter(
    spec: &VersionSpec,
    names: &[String],
    path: Option<&OsString>,
) -> Option<Interpreter> {
    let mut best: Option<Interpreter> = None;

    for candidate in candidates(spec, names, path) {
        let Some(interpreter) = Interpreter::probe(candidate.clone()).await else {
            tracing::debug!(path = ?candidate, "Not a usable Python interpreter");
            continue;
        };
        tracing::debug!(path = ?interpreter.path, version = %interpreter.version_string(), "Found interpreter");

        if !spec.matches(&interpreter.version) {
            continue;
        }
        let newer = best.as_ref().map_or(true, |b| {
            compare_versions(&interpreter.version, &b.version) == Ordering::Greater
        });
        if newer {
            best = Some(interpreter);
        }
    }

    best
}

/// Read the requested version from `python-version`, `python-version-file` or `.python-version`.
fn requested_version(input: &ActionInput<'_>) -> ProvisionResult<VersionSpec> {
    if let Some(version) = input.input("python-version") {
        return VersionSpec::parse(version);
    }

    let file = input.input("python-version-file").map(|f| input.workspace.join(f));
    let file = file.or_else(|| Some(input.workspace.join(".python-version")).filter(|p| p.is_file()));

    match file {
        Some(file) => {
            let content = std::fs::read_to_string(&file)?;
            let first = content.lines().map(str::trim).find(|l| !l.is_empty() && !l.starts_with('#'));
            VersionSpec::parse(first.unwrap_or_default())
        }
        None => Ok(VersionSpec::any()),
    }
}

/// Create `python`, `python3` and `pip` shims pointing at the interpreter.
#[cfg(unix)]
fn install_shims(interpreter: &Interpreter, bin: &Path) -> ProvisionResult<Vec<PathBuf>> {
    use std::os::unix::fs::{symlink, PermissionsExt};

    std::fs::create_dir_all(bin)?;

    let mut names = vec!["python".to_string(), "python3".to_string()];
    if let [major, minor, ..] = interpreter.version[..] {
        names.push(format!("python{major}.{minor}"));
    }
    for name in &names {
        let link = bin.join(name);
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)?;
        }
        symlink(&interpreter.path, &link)?;
    }

    let script = format!("#!/bin/sh\nexec \"{}\" -m pip \"$@\"\n", interpreter.path.display());
    for name in ["pip", "pip3"] {
        let shim = bin.join(name);
        std::fs::write(&shim, &script)?;
        std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(vec![bin.to_path_buf()])
}

#[cfg(not(unix))]
fn install_shims(interpreter: &Interpreter, _bin: &Path) -> ProvisionResult<Vec<PathBuf>> {
    let dir = interpreter.path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok(vec![dir.clone(), dir.join("Scripts")])
}

/// The setup-python action.
pub struct SetupPython;

#[async_trait]
impl Action for SetupPython {
    async fn run(&self, input: ActionInput<'_>, _sink: LineSink<'_>) -> ProvisionResult<ActionOutcome> {
        let spec = requested_version(&input)?;
        let search_path = input.search_path();

        let interpreter = find_interpreter(&spec, &input.settings.python_candidates, search_path.as_ref())
            .await
            .ok_or_else(|| ProvisionError::NoInterpreter(spec.to_string()))?;

        tracing::info!(
            version = %interpreter.version_string(),
            path = ?interpreter.path,
            requested = %spec,
            "Using Python"
        );

        let path = install_shims(&interpreter, &input.tool_dir.join("bin"))?;

        let mut outcome = ActionOutcome {
            summary: Some(format!("Python {} at {}", interpreter.version_string(), interpreter.path.display())),
            path,
            ..ActionOutcome::default()
        };
        outcome
            .exports
            .insert("pythonLocation".to_string(), interpreter.prefix().display().to_string());
        outcome
            .exports
            .insert("DAILYRUN_PYTHON".to_string(), interpreter.path.display().to_string());

        Ok(outcome)
    }
}
