//! Package metadata contract of the distributed library.
//!
//! The version is not written in the workflow: it is read from a single
//! attribute assignment in the source tree (`__version__ = "4.0.0"`), once
//! per build.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("package metadata field '{field}' must not be empty")]
    MissingField { field: &'static str },

    #[error("invalid package name '{0}'")]
    InvalidName(String),

    #[error("invalid dependency constraint '{spec}': {reason}")]
    InvalidDependency { spec: String, reason: String },

    #[error("invalid python_requires '{0}': expected '>=<version>'")]
    InvalidRuntimeRequirement(String),

    #[error("failed to read version file {path}: {source}")]
    VersionFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("version attribute '{attribute}' not found in {path}")]
    VersionAttributeMissing { attribute: String, path: PathBuf },
}

fn default_version_attribute() -> String {
    "__version__".to_string()
}

fn default_runtime_axis() -> String {
    "python".to_string()
}

/// The `[package]` table of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub name: String,

    /// Source file holding the version attribute, relative to the workspace.
    pub version_file: PathBuf,

    #[serde(default = "default_version_attribute")]
    pub version_attribute: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub author: Option<String>,

    #[serde(default)]
    pub author_email: Option<String>,

    #[serde(default)]
    pub license: Option<String>,

    /// Documentation, source and tracker links.
    #[serde(default)]
    pub urls: BTreeMap<String, String>,

    /// Sub-packages included in the distribution.
    #[serde(default)]
    pub packages: Vec<String>,

    /// Dependency constraints, e.g. `requests>=2.28.0,<2.29.0`.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Minimum supported runtime, e.g. `>=3.7`.
    #[serde(default)]
    pub python_requires: Option<String>,

    /// Matrix axis carrying runtime versions.
    #[serde(default = "default_runtime_axis")]
    pub runtime_axis: String,
}

impl PackageMetadata {
    pub fn validate(&self) -> Result<(), PackageError> {
        if self.name.trim().is_empty() {
            return Err(PackageError::MissingField { field: "name" });
        }
        if !is_valid_name(&self.name) {
            return Err(PackageError::InvalidName(self.name.clone()));
        }
        if self.version_file.as_os_str().is_empty() {
            return Err(PackageError::MissingField {
                field: "version_file",
            });
        }
        if self.version_attribute.trim().is_empty() {
            return Err(PackageError::MissingField {
                field: "version_attribute",
            });
        }
        if self.packages.is_empty() {
            return Err(PackageError::MissingField { field: "packages" });
        }
        self.dependency_constraints()?;
        self.runtime_floor()?;
        Ok(())
    }

    pub fn dependency_constraints(&self) -> Result<Vec<DependencyConstraint>, PackageError> {
        self.dependencies.iter().map(|d| d.parse()).collect()
    }

    /// The minimum runtime version, if declared.
    pub fn runtime_floor(&self) -> Result<Option<String>, PackageError> {
        let Some(req) = &self.python_requires else {
            return Ok(None);
        };
        let floor = req
            .trim()
            .strip_prefix(">=")
            .map(str::trim)
            .filter(|v| is_release_number(v))
            .ok_or_else(|| PackageError::InvalidRuntimeRequirement(req.clone()))?;
        Ok(Some(floor.to_string()))
    }

    /// Whether `version` satisfies the runtime floor.
    pub fn supports_runtime(&self, version: &str) -> Result<bool, PackageError> {
        Ok(match self.runtime_floor()? {
            Some(floor) => compare_release(version, &floor) != Ordering::Less,
            None => true,
        })
    }

    /// Read the version attribute from `workspace/version_file`.
    pub fn resolve_version(&self, workspace: &Path) -> Result<String, PackageError> {
        let path = workspace.join(&self.version_file);
        let source = std::fs::read_to_string(&path).map_err(|source| PackageError::VersionFile {
            path: path.clone(),
            source,
        })?;
        let pattern = format!(
            r#"(?m)^\s*{}\s*=\s*["']([^"']+)["']"#,
            regex::escape(&self.version_attribute)
        );
        let missing = || PackageError::VersionAttributeMissing {
            attribute: self.version_attribute.clone(),
            path: path.clone(),
        };
        let re = Regex::new(&pattern).map_err(|_| missing())?;
        re.captures(&source)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(missing)
    }
}

fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric)
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

fn is_release_number(v: &str) -> bool {
    !v.is_empty()
        && v.split('.')
            .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Compare dotted numeric versions component-wise (`3.10` > `3.9`).
/// Missing components count as zero; non-numeric components as zero.
pub fn compare_release(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> { v.split('.').map(|p| p.parse().unwrap_or(0)).collect() };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// A dependency name with its allowed version range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConstraint {
    pub name: String,
    /// Comparison clauses, e.g. `[">=2.28.0", "<2.29.0"]`.
    pub specifiers: Vec<String>,
}

const OPERATORS: [&str; 7] = ["~=", "==", "!=", ">=", "<=", ">", "<"];

impl FromStr for DependencyConstraint {
    type Err = PackageError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| PackageError::InvalidDependency {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let spec_trim = spec.trim();
        let split = spec_trim
            .find(['<', '>', '=', '!', '~'])
            .ok_or_else(|| invalid("no version range"))?;
        let name = spec_trim[..split].trim();
        if !is_valid_name(name) {
            return Err(invalid("invalid package name"));
        }

        let mut specifiers = Vec::new();
        for clause in spec_trim[split..].split(',') {
            let clause = clause.trim();
            let op = OPERATORS
                .iter()
                .find(|op| clause.starts_with(*op))
                .ok_or_else(|| invalid("unknown comparison operator"))?;
            let version = clause[op.len()..].trim();
            if version.is_empty() || !version.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'*') {
                return Err(invalid("invalid version"));
            }
            specifiers.push(format!("{op}{version}"));
        }
        Ok(Self {
            name: name.to_string(),
            specifiers,
        })
    }
}

impl std::fmt::Display for DependencyConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.name, self.specifiers.join(","))
    }
}
