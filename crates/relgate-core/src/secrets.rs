//! Secret resolution and per-job binding.
//!
//! A job receives its secrets as a [`SecretScope`]: a capability that can
//! produce environment variables for child processes and redact its values
//! from captured output. Values never appear in `Debug` output or argv.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::job::SecretRef;

/// Placeholder written in place of a secret value.
pub const REDACTED: &str = "***";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret '{name}' is not defined")]
    Undefined { name: String },

    #[error("secret store error: {0}")]
    Store(String),
}

/// An opaque credential value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value. Only pass this to process environments or
    /// authentication headers.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// A source of named secrets.
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when the secret is not defined.
    fn get(&self, name: &str) -> Result<Option<SecretValue>, SecretError>;

    /// Variables of the orchestrator's own environment that `name` is read
    /// from. Child processes must never inherit these.
    fn source_vars(&self, name: &str) -> Vec<String> {
        let _ = name;
        Vec::new()
    }
}

/// Reads secrets from the process environment, optionally under a prefix
/// (`RELGATE_SECRET_` + name).
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    prefix: Option<String>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }
}

impl EnvSecretStore {
    fn key(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_string(),
        }
    }
}

impl SecretStore for EnvSecretStore {
    fn get(&self, name: &str) -> Result<Option<SecretValue>, SecretError> {
        let key = self.key(name);
        match std::env::var(&key) {
            Ok(value) => Ok(Some(SecretValue::new(value))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::Store(format!(
                "environment variable {key} is not valid unicode"
            ))),
        }
    }

    fn source_vars(&self, name: &str) -> Vec<String> {
        vec![self.key(name)]
    }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    values: HashMap<String, SecretValue>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), SecretValue::new(value));
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Result<Option<SecretValue>, SecretError> {
        Ok(self.values.get(name).cloned())
    }
}

#[derive(Clone)]
struct Binding {
    env: String,
    value: SecretValue,
}

/// The secrets bound to one job instance.
#[derive(Clone, Default)]
pub struct SecretScope {
    bindings: BTreeMap<String, Binding>,
}

impl SecretScope {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `(env var, value)` pairs for a child process.
    pub fn env_vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings
            .values()
            .map(|b| (b.env.as_str(), b.value.expose()))
    }

    /// Look up a bound secret by store name.
    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.bindings.get(name).map(|b| &b.value)
    }

    /// Store names of the bound secrets.
    pub fn names(&self) -> Vec<&str> {
        self.bindings.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Replace every non-empty secret value in `text` with [`REDACTED`].
    pub fn redact(&self, text: &str) -> String {
        let mut values: Vec<&str> = self
            .bindings
            .values()
            .map(|b| b.value.expose())
            .filter(|v| !v.is_empty())
            .collect();
        // Longest first so a value containing another is fully masked.
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        let mut out = text.to_string();
        for value in values {
            out = out.replace(value, REDACTED);
        }
        out
    }
}

impl fmt::Debug for SecretScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretScope")
            .field("names", &self.names())
            .finish()
    }
}

/// Resolves a job's secret references against a store.
pub struct SecretInjector;

impl SecretInjector {
    /// Bind every reference of `job_id`. An undefined required secret fails
    /// with [`SecretError::Undefined`]; an undefined optional secret binds an
    /// empty value.
    pub fn bind(
        job_id: &str,
        refs: &[SecretRef],
        store: &dyn SecretStore,
    ) -> Result<SecretScope, SecretError> {
        let mut scope = SecretScope::empty();
        for secret in refs {
            let value = match store.get(&secret.name)? {
                Some(value) => value,
                None if secret.optional => {
                    warn!(
                        job = %job_id,
                        secret = %secret.name,
                        "optional secret not defined; binding empty value"
                    );
                    SecretValue::new("")
                }
                None => {
                    return Err(SecretError::Undefined {
                        name: secret.name.clone(),
                    })
                }
            };
            scope.bindings.insert(
                secret.name.clone(),
                Binding {
                    env: secret.env_name().to_string(),
                    value,
                },
            );
        }
        debug!(job = %job_id, secrets = ?scope.names(), "secrets bound");
        Ok(scope)
    }
}
