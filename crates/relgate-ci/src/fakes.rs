//! In-memory package index, release store and job executor for tests and
//! dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use relgate_core::{ConcreteJob, JobStatus, SecretValue};

use crate::executor::{JobContext, JobExecution, JobExecutor};
use crate::publish::{
    CreatedRelease, DistributionFile, PackageIndex, PublishError, ReleaseRequest, ReleaseStore,
};
use crate::runner::{StepResult, StepStatus};

/// One accepted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub package: String,
    pub version: String,
    pub filename: String,
    pub sha256: String,
}

/// Package index that rejects re-uploads of a file name or of a version
/// already marked as existing.
#[derive(Debug, Default)]
pub struct MemoryPackageIndex {
    uploads: Mutex<Vec<RecordedUpload>>,
    existing: Mutex<BTreeSet<(String, String)>>,
}

impl MemoryPackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `package` `version` was published by an earlier run.
    pub fn with_existing(self, package: impl Into<String>, version: impl Into<String>) -> Self {
        if let Ok(mut existing) = self.existing.lock() {
            existing.insert((package.into(), version.into()));
        }
        self
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PackageIndex for MemoryPackageIndex {
    async fn upload(&self, file: &DistributionFile, token: &SecretValue) -> Result<(), PublishError> {
        if token.is_empty() {
            return Err(PublishError::Unauthorized {
                service: "package index",
            });
        }
        let duplicate = || PublishError::DuplicateVersion {
            package: file.package.clone(),
            version: file.version.clone(),
        };
        let existing = self
            .existing
            .lock()
            .map_err(|_| PublishError::NotConfigured("index state poisoned".to_string()))?;
        if existing.contains(&(file.package.clone(), file.version.clone())) {
            return Err(duplicate());
        }
        let mut uploads = self
            .uploads
            .lock()
            .map_err(|_| PublishError::NotConfigured("index state poisoned".to_string()))?;
        if uploads.iter().any(|u| u.filename == file.filename) {
            return Err(duplicate());
        }
        uploads.push(RecordedUpload {
            package: file.package.clone(),
            version: file.version.clone(),
            filename: file.filename.clone(),
            sha256: file.sha256.clone(),
        });
        Ok(())
    }
}

/// A release held by [`MemoryReleaseStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRelease {
    pub id: u64,
    pub request: ReleaseRequest,
    /// Attached asset file names, in upload order.
    pub assets: Vec<String>,
}

/// Release store that rejects a second release for the same tag.
#[derive(Debug, Default)]
pub struct MemoryReleaseStore {
    releases: Mutex<Vec<RecordedRelease>>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn releases(&self) -> Vec<RecordedRelease> {
        self.releases.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

fn poisoned() -> PublishError {
    PublishError::NotConfigured("release store state poisoned".to_string())
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn create_release(
        &self,
        request: &ReleaseRequest,
        token: &SecretValue,
    ) -> Result<CreatedRelease, PublishError> {
        if token.is_empty() {
            return Err(PublishError::Unauthorized {
                service: "release store",
            });
        }
        let mut releases = self.releases.lock().map_err(|_| poisoned())?;
        if releases.iter().any(|r| r.request.tag == request.tag) {
            return Err(PublishError::DuplicateRelease {
                tag: request.tag.clone(),
            });
        }
        let id = releases.len() as u64 + 1;
        releases.push(RecordedRelease {
            id,
            request: request.clone(),
            assets: Vec::new(),
        });
        Ok(CreatedRelease {
            id,
            tag: request.tag.clone(),
            upload_url: Some(format!("memory://releases/{id}/assets")),
            html_url: Some(format!("memory://releases/{id}")),
        })
    }

    async fn upload_asset(
        &self,
        release: &CreatedRelease,
        file: &Path,
        _token: &SecretValue,
    ) -> Result<(), PublishError> {
        if !file.is_file() {
            return Err(PublishError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", file.display()),
            )));
        }
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut releases = self.releases.lock().map_err(|_| poisoned())?;
        let entry = releases
            .iter_mut()
            .find(|r| r.id == release.id)
            .ok_or_else(|| PublishError::Http {
                service: "release store",
                status: 404,
                body: format!("release {} not found", release.id),
            })?;
        entry.assets.push(name);
        Ok(())
    }
}

/// Executor that reports preset outcomes per job template without running
/// any step. Unlisted templates succeed.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    outcomes: BTreeMap<String, JobStatus>,
    delay: Option<Duration>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every instance of `template` finishes with `status`.
    pub fn with_outcome(mut self, template: impl Into<String>, status: JobStatus) -> Self {
        self.outcomes.insert(template.into(), status);
        self
    }

    /// Sleep this long inside every job.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Instance ids in the order they were started.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(&self, job: &ConcreteJob, _ctx: JobContext) -> JobExecution {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(job.id.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let status = self
            .outcomes
            .get(&job.template)
            .cloned()
            .unwrap_or(JobStatus::Succeeded);
        let step_status = if status.is_success() {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };
        let steps = job
            .steps
            .iter()
            .map(|s| StepResult {
                step_name: s.name.clone(),
                status: step_status,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
            })
            .collect();
        JobExecution { status, steps }
    }
}
