//! Job, step and builtin-action definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::condition::Condition;

/// Default runner label when a job does not declare `runs_on`.
pub const DEFAULT_RUNNER: &str = "ubuntu-latest";

/// Default artifact retention in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 5;

/// Role a job plays in the release gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobRole {
    /// Uploads distributions to the package index.
    Publish,
    /// Drafts the source-control release.
    Release,
}

/// A secret a job needs bound into its environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretRef {
    /// Name in the secret store.
    pub name: String,

    /// Environment variable to bind to; defaults to `name`.
    #[serde(default)]
    pub env: Option<String>,

    /// Bind an empty value instead of failing when the secret is undefined.
    #[serde(default)]
    pub optional: bool,
}

impl SecretRef {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env: None,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::required(name)
        }
    }

    pub fn env_name(&self) -> &str {
        self.env.as_deref().unwrap_or(&self.name)
    }
}

fn default_retention() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_download_path() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

fn default_release_token() -> String {
    "GITHUB_TOKEN".to_string()
}

/// Builtin step actions (`uses = ...`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Store files matching `path` (glob, relative to the workspace) under `name`.
    UploadArtifact {
        name: String,
        path: String,
        #[serde(default = "default_retention")]
        retention_days: u32,
    },
    /// Copy the files of artifact `name` into `path`.
    DownloadArtifact {
        name: String,
        #[serde(default = "default_download_path")]
        path: String,
    },
    /// Validate the package metadata and resolve its version attribute.
    VerifyPackage,
    /// Upload every file matching `path` to the package index.
    PublishPackage { path: String, token_secret: String },
    /// Create a release for the trigger tag, attaching files matching `path`.
    CreateRelease {
        path: String,
        #[serde(default = "default_true")]
        draft: bool,
        #[serde(default = "default_true")]
        generate_notes: bool,
        #[serde(default = "default_release_token")]
        token_secret: String,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::UploadArtifact { .. } => "upload_artifact",
            Action::DownloadArtifact { .. } => "download_artifact",
            Action::VerifyPackage => "verify_package",
            Action::PublishPackage { .. } => "publish_package",
            Action::CreateRelease { .. } => "create_release",
        }
    }

    /// Secret names this action reads from the job's secret scope.
    pub fn required_secrets(&self) -> Vec<&str> {
        match self {
            Action::PublishPackage { token_secret, .. }
            | Action::CreateRelease { token_secret, .. } => vec![token_secret.as_str()],
            _ => Vec::new(),
        }
    }

    /// Parameter strings, for placeholder validation.
    pub fn parameters(&self) -> Vec<&str> {
        match self {
            Action::UploadArtifact { name, path, .. }
            | Action::DownloadArtifact { name, path } => vec![name.as_str(), path.as_str()],
            Action::VerifyPackage => Vec::new(),
            Action::PublishPackage { path, .. } | Action::CreateRelease { path, .. } => {
                vec![path.as_str()]
            }
        }
    }

    /// Apply `f` to every parameter string.
    pub fn map_parameters<F>(&self, mut f: F) -> Result<Action, String>
    where
        F: FnMut(&str) -> Result<String, String>,
    {
        Ok(match self {
            Action::UploadArtifact {
                name,
                path,
                retention_days,
            } => Action::UploadArtifact {
                name: f(name)?,
                path: f(path)?,
                retention_days: *retention_days,
            },
            Action::DownloadArtifact { name, path } => Action::DownloadArtifact {
                name: f(name)?,
                path: f(path)?,
            },
            Action::VerifyPackage => Action::VerifyPackage,
            Action::PublishPackage { path, token_secret } => Action::PublishPackage {
                path: f(path)?,
                token_secret: token_secret.clone(),
            },
            Action::CreateRelease {
                path,
                draft,
                generate_notes,
                token_secret,
            } => Action::CreateRelease {
                path: f(path)?,
                draft: *draft,
                generate_notes: *generate_notes,
                token_secret: token_secret.clone(),
            },
        })
    }
}

/// One step of a job: either a command or a builtin action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepSpec {
    pub name: String,

    /// Command argv (first element is the executable). No shell is involved.
    #[serde(default)]
    pub run: Option<Vec<String>>,

    #[serde(default)]
    pub uses: Option<Action>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, rename = "if")]
    pub condition: Option<Condition>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StepSpec {
    /// A command step.
    pub fn run<I, S>(name: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            run: Some(argv.into_iter().map(Into::into).collect()),
            uses: None,
            env: BTreeMap::new(),
            condition: None,
            timeout_secs: None,
        }
    }

    /// A builtin-action step.
    pub fn uses(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            run: None,
            uses: Some(action),
            env: BTreeMap::new(),
            condition: None,
            timeout_secs: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Every string that may contain placeholders.
    pub fn templated_strings(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        if let Some(argv) = &self.run {
            out.extend(argv.iter().map(String::as_str));
        }
        if let Some(action) = &self.uses {
            out.extend(action.parameters());
        }
        out.extend(self.env.values().map(String::as_str));
        out
    }
}

/// A job template as written in the workflow file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSpec {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,

    /// Runner environment descriptor.
    #[serde(default = "default_runner")]
    pub runs_on: String,

    /// Job templates that must finish successfully first.
    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default, rename = "if")]
    pub condition: Option<Condition>,

    /// Matrix axes: axis name to value list.
    #[serde(default)]
    pub matrix: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub secrets: Vec<SecretRef>,

    #[serde(default)]
    pub role: Option<JobRole>,

    #[serde(default)]
    pub timeout_minutes: Option<u64>,

    pub steps: Vec<StepSpec>,
}

fn default_runner() -> String {
    DEFAULT_RUNNER.to_string()
}

impl JobSpec {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self {
            name: None,
            runs_on: default_runner(),
            needs: Vec::new(),
            condition: None,
            matrix: BTreeMap::new(),
            env: BTreeMap::new(),
            secrets: Vec::new(),
            role: None,
            timeout_minutes: None,
            steps,
        }
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_axis<I, S>(mut self, axis: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.matrix
            .insert(axis.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_secret(mut self, secret: SecretRef) -> Self {
        self.secrets.push(secret);
        self
    }

    pub fn with_role(mut self, role: JobRole) -> Self {
        self.role = Some(role);
        self
    }
}

/// A concrete job instance: a template with one matrix combination applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcreteJob {
    /// Unique instance id, e.g. `unit-tests (test, 3.10)`.
    pub id: String,

    /// Template id the instance was expanded from.
    pub template: String,

    /// Axis values of this instance (empty for non-matrix jobs).
    pub matrix: BTreeMap<String, String>,

    pub runs_on: String,
    pub needs: Vec<String>,
    pub condition: Option<Condition>,
    pub env: BTreeMap<String, String>,
    pub secrets: Vec<SecretRef>,
    pub role: Option<JobRole>,
    pub timeout_minutes: Option<u64>,
    pub steps: Vec<StepSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_ref_env_name_defaults_to_name() {
        let secret = SecretRef::required("PYPI_API_TOKEN");
        assert_eq!(secret.env_name(), "PYPI_API_TOKEN");
        let secret = SecretRef {
            env: Some("TWINE_PASSWORD".to_string()),
            ..secret
        };
        assert_eq!(secret.env_name(), "TWINE_PASSWORD");
    }

    #[test]
    fn test_step_parses_run_and_uses() {
        #[derive(Deserialize)]
        struct Holder {
            steps: Vec<StepSpec>,
        }
        let holder: Holder = toml::from_str(
            r#"
            steps = [
              { name = "pytest", run = ["pytest", "test"] },
              { name = "upload", uses = { upload_artifact = { name = "dist", path = "dist/*" } } },
              { name = "verify", uses = "verify_package" },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(holder.steps[0].run.as_ref().unwrap()[0], "pytest");
        assert_eq!(
            holder.steps[1].uses,
            Some(Action::UploadArtifact {
                name: "dist".to_string(),
                path: "dist/*".to_string(),
                retention_days: DEFAULT_RETENTION_DAYS,
            })
        );
        assert_eq!(holder.steps[2].uses, Some(Action::VerifyPackage));
    }

    #[test]
    fn test_action_required_secrets() {
        let action = Action::PublishPackage {
            path: "dist/*".to_string(),
            token_secret: "PYPI_API_TOKEN".to_string(),
        };
        assert_eq!(action.required_secrets(), vec!["PYPI_API_TOKEN"]);
        assert!(Action::VerifyPackage.required_secrets().is_empty());
    }

    #[test]
    fn test_map_parameters_substitutes_paths() {
        let action = Action::DownloadArtifact {
            name: "dist-${{ matrix.python }}".to_string(),
            path: "out".to_string(),
        };
        let mapped = action
            .map_parameters(|s| Ok(s.replace("${{ matrix.python }}", "3.10")))
            .unwrap();
        assert_eq!(
            mapped,
            Action::DownloadArtifact {
                name: "dist-3.10".to_string(),
                path: "out".to_string(),
            }
        );
    }
}
