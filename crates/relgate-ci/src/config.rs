//! Runtime configuration for pipeline runs.

use std::path::PathBuf;

use thiserror::Error;

use crate::runner::DEFAULT_ENV_PASSTHROUGH;

/// Default job wall-clock ceiling in minutes.
pub const DEFAULT_JOB_TIMEOUT_MINUTES: u64 = 360;

pub const DEFAULT_PACKAGE_INDEX_URL: &str = "https://upload.pypi.org/legacy/";
pub const DEFAULT_RELEASE_API_URL: &str = "https://api.github.com";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings shared by every job of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Checked-out source tree the steps run in.
    pub workspace: PathBuf,

    /// Root of the artifact store.
    pub artifact_dir: PathBuf,

    /// Upper bound on concurrently running jobs; `None` is unbounded.
    pub max_parallel: Option<usize>,

    /// Job ceiling used when a job declares no `timeout_minutes`.
    pub job_timeout_minutes: u64,

    /// Legacy upload endpoint of the package index.
    pub package_index_url: String,

    /// Base URL of the release-store REST API.
    pub release_api_url: String,

    /// `owner/name` of the repository releases are created in.
    pub repository: Option<String>,

    /// Orchestrator environment variables passed on to steps. Secret
    /// variables are withheld even when listed.
    pub env_passthrough: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            artifact_dir: PathBuf::from(".relgate"),
            max_parallel: None,
            job_timeout_minutes: DEFAULT_JOB_TIMEOUT_MINUTES,
            package_index_url: DEFAULT_PACKAGE_INDEX_URL.to_string(),
            release_api_url: DEFAULT_RELEASE_API_URL.to_string(),
            repository: None,
            env_passthrough: DEFAULT_ENV_PASSTHROUGH
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `RELGATE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `RELGATE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("RELGATE_WORKSPACE") {
            config.workspace = PathBuf::from(v);
        }
        if let Some(v) = lookup("RELGATE_ARTIFACT_DIR") {
            config.artifact_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RELGATE_MAX_PARALLEL") {
            let n = parse_positive("RELGATE_MAX_PARALLEL", &v)?;
            config.max_parallel = Some(n as usize);
        }
        if let Some(v) = lookup("RELGATE_JOB_TIMEOUT_MINUTES") {
            config.job_timeout_minutes = parse_positive("RELGATE_JOB_TIMEOUT_MINUTES", &v)?;
        }
        if let Some(v) = lookup("RELGATE_PACKAGE_INDEX_URL") {
            config.package_index_url = v;
        }
        if let Some(v) = lookup("RELGATE_RELEASE_API_URL") {
            config.release_api_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("RELGATE_REPOSITORY") {
            if !v.contains('/') {
                return Err(ConfigError::Invalid {
                    var: "RELGATE_REPOSITORY",
                    value: v,
                    reason: "expected owner/name".to_string(),
                });
            }
            config.repository = Some(v);
        }
        if let Some(v) = lookup("RELGATE_ENV_PASSTHROUGH") {
            config.env_passthrough = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(config)
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel.max(1));
        self
    }

    pub fn with_env_passthrough<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_passthrough = names.into_iter().map(Into::into).collect();
        self
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be positive".to_string(),
        }),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        }),
    }
}
