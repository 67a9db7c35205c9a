//! Process command data structures.
//!
//! Defines the `Command` struct handed to the executor, and the shells a
//! `run:` step can be interpreted by.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Shell used to interpret a `run:` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    /// `bash --noprofile --norc -eo pipefail -c`
    Bash,
    /// `sh -e -c`
    Sh,
    /// `python -c`
    Python,
    /// `pwsh -command`
    Pwsh,
    /// `cmd /D /E:ON /V:OFF /S /C`
    Cmd,
}

impl Shell {
    /// Default shell for the current platform.
    ///
    /// Prefers bash when it is on `PATH`, otherwise falls back to `sh`.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            Self::Cmd
        } else if find_in_path("bash", std::env::var_os("PATH").as_ref()).is_some() {
            Self::Bash
        } else {
            Self::Sh
        }
    }

    /// Program and leading arguments; the script is appended last.
    pub fn invocation(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::Bash => ("bash", &["--noprofile", "--norc", "-eo", "pipefail", "-c"]),
            Self::Sh => ("sh", &["-e", "-c"]),
            Self::Python => ("python", &["-c"]),
            Self::Pwsh => ("pwsh", &["-command"]),
            Self::Cmd => ("cmd", &["/D", "/E:ON", "/V:OFF", "/S", "/C"]),
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bash => "bash",
            Self::Sh => "sh",
            Self::Python => "python",
            Self::Pwsh => "pwsh",
            Self::Cmd => "cmd",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Shell {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bash" => Ok(Self::Bash),
            "sh" => Ok(Self::Sh),
            "python" | "python3" => Ok(Self::Python),
            "pwsh" | "powershell" => Ok(Self::Pwsh),
            "cmd" => Ok(Self::Cmd),
            other => Err(format!("unsupported shell '{other}' (expected bash, sh, python, pwsh or cmd)")),
        }
    }
}

/// A process to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Display name used in logs
    pub name: String,

    /// Program to execute (looked up on `PATH` if not absolute)
    pub program: String,

    /// Arguments passed to the program
    pub args: Vec<String>,

    /// Working directory for execution
    pub working_dir: Option<PathBuf>,

    /// Environment variables layered over the inherited environment
    pub env: BTreeMap<String, String>,

    /// Directories prepended to the inherited `PATH`
    pub path_prefix: Vec<PathBuf>,
}

impl Command {
    /// Create a command that runs `program` with no arguments.
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            path_prefix: Vec::new(),
        }
    }

    /// Create a command that interprets `script` with the given shell.
    pub fn shell(name: impl Into<String>, shell: Shell, script: impl Into<String>) -> Self {
        let (program, leading) = shell.invocation();
        let mut cmd = Self::new(name, program);
        cmd.args = leading.iter().map(|a| (*a).to_string()).collect();
        cmd.args.push(script.into());
        cmd
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add several environment variables.
    #[must_use]
    pub fn with_envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (k, v) in vars {
            self.env.insert(k.clone(), v.clone());
        }
        self
    }

    /// Prepend directories to `PATH`.
    #[must_use]
    pub fn with_path_prefix(mut self, dirs: &[PathBuf]) -> Self {
        self.path_prefix.extend(dirs.iter().cloned());
        self
    }

    /// Compute the `PATH` value the child should see, if it differs from ours.
    pub fn effective_path(&self) -> Option<OsString> {
        if self.path_prefix.is_empty() {
            return None;
        }
        let inherited = self
            .env
            .get("PATH")
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_default();

        let mut parts: Vec<PathBuf> = self.path_prefix.clone();
        parts.extend(std::env::split_paths(&inherited));
        std::env::join_paths(parts).ok()
    }

    /// Render the command line for display (dry runs, logs).
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push_str(&format!("{arg:?}"));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Locate an executable by name in a `PATH`-style list of directories.
pub fn find_in_path(program: &str, path: Option<&OsString>) -> Option<PathBuf> {
    let path = path?;
    std::env::split_paths(path).map(|dir| dir.join(program)).find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata().map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_invocation_appends_script() {
        let cmd = Command::shell("greet", Shell::Sh, "echo hi");
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.args, vec!["-e", "-c", "echo hi"]);
    }

    #[test]
    fn test_bash_uses_pipefail() {
        let cmd = Command::shell("x", Shell::Bash, "true");
        assert!(cmd.args.contains(&"pipefail".to_string()));
        assert_eq!(cmd.args.last().map(String::as_str), Some("true"));
    }

    #[test]
    fn test_shell_from_str() {
        assert_eq!("bash".parse::<Shell>().unwrap(), Shell::Bash);
        assert_eq!("SH".parse::<Shell>().unwrap(), Shell::Sh);
        assert_eq!("powershell".parse::<Shell>().unwrap(), Shell::Pwsh);
        assert!("fish".parse::<Shell>().is_err());
    }

    #[test]
    fn test_effective_path_prepends_prefix() {
        let cmd = Command::new("x", "python")
            .with_env("PATH", "/usr/bin")
            .with_path_prefix(&[PathBuf::from("/opt/tool/bin")]);

        let path = cmd.effective_path().unwrap();
        let parts: Vec<PathBuf> = std::env::split_paths(&path).collect();
        assert_eq!(parts[0], PathBuf::from("/opt/tool/bin"));
        assert_eq!(parts[1], PathBuf::from("/usr/bin"));
    }

    #[test]
    fn test_effective_path_none_without_prefix() {
        let cmd = Command::new("x", "python");
        assert!(cmd.effective_path().is_none());
    }

    #[test]
    fn test_display_line_quotes_whitespace() {
        let cmd = Command::new("x", "python").args(["-m", "pip"]).arg("a b");
        assert_eq!(cmd.display_line(), "python -m pip \"a b\"");
    }

    #[cfg(unix)]
    #[test]
    fn test_find_in_path_locates_sh() {
        let path = OsString::from("/nonexistent:/bin:/usr/bin");
        assert!(find_in_path("sh", Some(&path)).is_some());
        assert!(find_in_path("definitely-not-a-real-binary", Some(&path)).is_none());
    }
}
