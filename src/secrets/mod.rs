//! Secret resolution.
//!
//! Secrets referenced as `${{ secrets.NAME }}` are looked up, in order, in:
//! - values inserted programmatically
//! - the process environment
//! - a dotenv file (`.dailyrun/secrets.env` or `.env` in the workspace)
//! - the OS keychain (macOS Keychain, Windows Credential Manager, Secret Service)
//!
//! Values are never logged and are zeroed on drop.

mod mask;

pub use mask::Masker;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[cfg(feature = "secrets")]
use keyring::Entry;
use thiserror::Error;
#[cfg(feature = "secrets")]
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The service name used for keychain entries.
pub const SERVICE_NAME: &str = "dailyrun";

/// Secret files checked in the workspace when none is configured.
pub const DEFAULT_SECRET_FILES: &[&str] = &[".dailyrun/secrets.env", ".env"];

/// Result type for secrets operations.
pub type SecretsResult<T> = Result<T, SecretsError>;

/// Errors that can occur during secrets operations.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// The secrets file could not be read or parsed.
    #[error("Failed to load secrets file {path}: {message}")]
    File { path: PathBuf, message: String },

    /// Failed to access the system keychain.
    #[error("Failed to access system keychain: {0}")]
    Keychain(String),

    /// Secret not found.
    #[error("Secret not found: {0}")]
    NotFound(String),

    /// Names must be valid environment variable names.
    #[error("Invalid secret name '{0}': use letters, digits and underscores")]
    InvalidName(String),

    /// Feature not available.
    #[error("Keychain support not available - compile with 'secrets' feature")]
    FeatureNotAvailable,
}

/// A secret value that is zeroed on drop.
#[cfg(feature = "secrets")]
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretValue {
    value: String,
}

#[cfg(not(feature = "secrets"))]
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue {
    value: String,
}

impl SecretValue {
    /// Create a new secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    /// Get the secret value.
    ///
    /// Note: Use sparingly and ensure the value is not logged.
    pub fn expose(&self) -> &str {
        &self.value
    }

    /// Get the length of the secret.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Check if the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

// Prevent accidental logging of secrets
impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue([REDACTED])")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Where a secret was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Inserted programmatically
    Provided,
    /// Process environment
    Environment,
    /// Dotenv file
    File(PathBuf),
    /// OS keychain
    Keychain,
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provided => write!(f, "provided"),
            Self::Environment => write!(f, "environment"),
            Self::File(path) => write!(f, "file {}", path.display()),
            Self::Keychain => write!(f, "keychain"),
        }
    }
}

/// A resolved secret.
#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    /// The secret name
    pub name: String,

    /// The resolved value
    pub value: SecretValue,

    /// Where it came from
    pub source: SecretSource,
}

/// Whether a secret is configured, without its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretStatus {
    /// The secret name
    pub name: String,

    /// Source if configured
    pub source: Option<SecretSource>,
}

impl SecretStatus {
    /// Whether the secret has a non-empty value.
    pub fn is_configured(&self) -> bool {
        self.source.is_some()
    }
}

/// Read-only view over the configured secret sources.
#[derive(Debug, Clone)]
pub struct SecretStore {
    provided: HashMap<String, SecretValue>,
    read_env: bool,
    file: Option<PathBuf>,
    file_values: HashMap<String, SecretValue>,
    keychain: bool,
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore {
    /// Create a store that reads the environment and the keychain.
    pub fn new() -> Self {
        Self {
            provided: HashMap::new(),
            read_env: true,
            file: None,
            file_values: HashMap::new(),
            keychain: cfg!(feature = "secrets"),
        }
    }

    /// Create a store with no sources at all.
    pub fn empty() -> Self {
        Self { read_env: false, keychain: false, ..Self::new() }
    }

    /// Stop reading the process environment.
    #[must_use]
    pub fn without_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    /// Stop reading the OS keychain.
    #[must_use]
    pub fn without_keychain(mut self) -> Self {
        self.keychain = false;
        self
    }

    /// Insert a value directly.
    #[must_use]
    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.provided.insert(name.into(), SecretValue::new(value));
        self
    }

    /// Load a dotenv file as a secret source.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> SecretsResult<Self> {
        let path = path.as_ref();
        let file_error =
            |e: dotenvy::Error| SecretsError::File { path: path.to_path_buf(), message: e.to_string() };

        let mut values = HashMap::new();
        for item in dotenvy::from_path_iter(path).map_err(file_error)? {
            let (key, value) = item.map_err(file_error)?;
            values.insert(key, SecretValue::new(value));
        }

        tracing::debug!(path = ?path, count = values.len(), "Loaded secrets file");
        self.file = Some(path.to_path_buf());
        self.file_values = values;
        Ok(self)
    }

    /// Load the secrets file for a workspace.
    ///
    /// Uses `explicit` when given (it must exist), otherwise the first of
    /// [`DEFAULT_SECRET_FILES`] that exists. No file is not an error.
    pub fn with_workspace_file(self, workspace: &Path, explicit: Option<&Path>) -> SecretsResult<Self> {
        if let Some(path) = explicit {
            let path = if path.is_absolute() { path.to_path_buf() } else { workspace.join(path) };
            return self.with_file(path);
        }

        match DEFAULT_SECRET_FILES.iter().map(|f| workspace.join(f)).find(|p| p.is_file()) {
            Some(path) => self.with_file(path),
            None => Ok(self),
        }
    }

    /// Path of the loaded secrets file, if any.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Resolve a secret by name. Empty values count as not configured.
    pub fn resolve(&self, name: &str) -> Option<ResolvedSecret> {
        let found = |value: SecretValue, source: SecretSource| {
            (!value.is_empty()).then(|| ResolvedSecret { name: name.to_string(), value, source })
        };

        if let Some(value) = self.provided.get(name) {
            if let Some(secret) = found(value.clone(), SecretSource::Provided) {
                return Some(secret);
            }
        }

        if self.read_env {
            if let Ok(value) = std::env::var(name) {
                if let Some(secret) = found(SecretValue::new(value), SecretSource::Environment) {
                    return Some(secret);
                }
            }
        }

        if let (Some(path), Some(value)) = (&self.file, self.file_values.get(name)) {
            if let Some(secret) = found(value.clone(), SecretSource::File(path.clone())) {
                return Some(secret);
            }
        }

        if self.keychain {
            match keychain_get(name) {
                Ok(Some(value)) => return found(value, SecretSource::Keychain),
                Ok(None) => {}
                Err(e) => tracing::debug!(secret = name, error = %e, "Keychain lookup failed"),
            }
        }

        None
    }

    /// Report which of `names` are configured.
    pub fn status<'a, I>(&self, names: I) -> Vec<SecretStatus>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .map(|name| SecretStatus {
                name: name.to_string(),
                source: self.resolve(name).map(|s| s.source),
            })
            .collect()
    }
}

/// Check that a secret name is usable as an environment variable name.
pub fn validate_name(name: &str) -> SecretsResult<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SecretsError::InvalidName(name.to_string()))
    }
}

/// Read a secret from the OS keychain.
#[cfg(feature = "secrets")]
pub fn keychain_get(name: &str) -> SecretsResult<Option<SecretValue>> {
    let entry = Entry::new(SERVICE_NAME, name).map_err(|e| SecretsError::Keychain(e.to_string()))?;
    match entry.get_password() {
        Ok(value) => Ok(Some(SecretValue::new(value))),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(SecretsError::Keychain(e.to_string())),
    }
}

/// Read a secret from the OS keychain.
#[cfg(not(feature = "secrets"))]
pub fn keychain_get(_name: &str) -> SecretsResult<Option<SecretValue>> {
    Err(SecretsError::FeatureNotAvailable)
}

/// Store a secret in the OS keychain.
#[cfg(feature = "secrets")]
pub fn keychain_set(name: &str, value: &SecretValue) -> SecretsResult<()> {
    validate_name(name)?;
    let entry = Entry::new(SERVICE_NAME, name).map_err(|e| SecretsError::Keychain(e.to_string()))?;
    entry.set_password(value.expose()).map_err(|e| SecretsError::Keychain(e.to_string()))
}

/// Store a secret in the OS keychain.
#[cfg(not(feature = "secrets"))]
pub fn keychain_set(_name: &str, _value: &SecretValue) -> SecretsResult<()> {
    Err(SecretsError::FeatureNotAvailable)
}

/// Remove a secret from the OS keychain.
#[cfg(feature = "secrets")]
pub fn keychain_delete(name: &str) -> SecretsResult<()> {
    let entry = Entry::new(SERVICE_NAME, name).map_err(|e| SecretsError::Keychain(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Err(SecretsError::NotFound(name.to_string())),
        Err(e) => Err(SecretsError::Keychain(e.to_string())),
    }
}

/// Remove a secret from the OS keychain.
#[cfg(not(feature = "secrets"))]
pub fn keychain_delete(_name: &str) -> SecretsResult<()> {
    Err(SecretsError::FeatureNotAvailable)
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;

    fn store() -> SecretStore {
        SecretStore::new().without_keychain()
    }

    #[test]
    fn test_secret_value_redacted() {
        let secret = SecretValue::new("hunter2");
        assert_eq!(format!("{secret:?}"), "SecretValue([REDACTED])");
        assert_eq!(format!("{secret}"), "[REDACTED]");
        assert_eq!(secret.expose(), "hunter2");
        assert_eq!(secret.len(), 7);
    }

    #[test]
    fn test_provided_secret_resolves() {
        let store = SecretStore::empty().with_secret("WP_BLOG_ID", "241913052");
        let resolved = store.resolve("WP_BLOG_ID").unwrap();
        assert_eq!(resolved.value.expose(), "241913052");
        assert_eq!(resolved.source, SecretSource::Provided);
        assert!(store.resolve("NEWS_API_KEY").is_none());
    }

    #[test]
    fn test_empty_value_is_not_configured() {
        let store = SecretStore::empty().with_secret("EMPTY", "");
        assert!(store.resolve("EMPTY").is_none());
    }

    #[test]
    #[serial]
    fn test_env_secret_resolves() {
        std::env::set_var("DAILYRUN_TEST_SECRET_ENV", "from-env");
        let resolved = store().resolve("DAILYRUN_TEST_SECRET_ENV").unwrap();
        assert_eq!(resolved.value.expose(), "from-env");
        assert_eq!(resolved.source, SecretSource::Environment);

        let disabled = store().without_env();
        assert!(disabled.resolve("DAILYRUN_TEST_SECRET_ENV").is_none());
        std::env::remove_var("DAILYRUN_TEST_SECRET_ENV");
    }

    #[test]
    #[serial]
    fn test_env_wins_over_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("secrets.env");
        std::fs::write(&path, "DAILYRUN_TEST_SECRET_ORDER=from-file\n").unwrap();

        let store = store().with_file(&path).unwrap();
        assert_eq!(
            store.resolve("DAILYRUN_TEST_SECRET_ORDER").unwrap().source,
            SecretSource::File(path.clone())
        );

        std::env::set_var("DAILYRUN_TEST_SECRET_ORDER", "from-env");
        assert_eq!(
            store.resolve("DAILYRUN_TEST_SECRET_ORDER").unwrap().source,
            SecretSource::Environment
        );
        std::env::remove_var("DAILYRUN_TEST_SECRET_ORDER");
    }

    #[test]
    fn test_workspace_file_discovery() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".env"),
            "# credentials\nOPENAI_API_KEY=sk-test\nWP_BLOG_ID=\"241913052\"\n",
        )
        .unwrap();

        let store = SecretStore::empty().with_workspace_file(temp.path(), None).unwrap();
        assert_eq!(store.file(), Some(temp.path().join(".env").as_path()));
        assert_eq!(store.resolve("WP_BLOG_ID").unwrap().value.expose(), "241913052");

        let statuses = store.status(["OPENAI_API_KEY", "NEWS_API_KEY"]);
        assert!(statuses[0].is_configured());
        assert!(!statuses[1].is_configured());
    }

    #[test]
    fn test_dailyrun_secrets_file_preferred() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join(".dailyrun")).unwrap();
        std::fs::write(temp.path().join(".dailyrun/secrets.env"), "KEY=a\n").unwrap();
        std::fs::write(temp.path().join(".env"), "KEY=b\n").unwrap();

        let store = SecretStore::empty().with_workspace_file(temp.path(), None).unwrap();
        assert_eq!(store.resolve("KEY").unwrap().value.expose(), "a");
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let temp = TempDir::new().unwrap();
        let result =
            SecretStore::empty().with_workspace_file(temp.path(), Some(Path::new("missing.env")));
        assert!(matches!(result, Err(SecretsError::File { .. })));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("OPENAI_API_KEY").is_ok());
        assert!(validate_name("_x1").is_ok());
        assert!(validate_name("1BAD").is_err());
        assert!(validate_name("BAD-NAME").is_err());
        assert!(validate_name("").is_err());
    }
}
