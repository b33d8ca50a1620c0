//! Builtin step actions (`uses = ...`).
//!
//! Each action returns a short human-readable summary that becomes the
//! step's stdout. Errors fail the step; nothing is retried.

use std::path::PathBuf;

use chrono::Utc;
use relgate_core::{
    collect_files, Action, ArtifactError, PackageError, SecretValue, UploadRequest,
};
use thiserror::Error;
use tracing::info;

use crate::executor::JobContext;
use crate::publish::{DistributionFile, PublishError, ReleaseRequest};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("no files match '{pattern}'")]
    NoFiles { pattern: String },

    #[error("secret '{name}' is not bound or empty")]
    MissingSecret { name: String },

    #[error("workflow declares no [package] table")]
    NoPackage,

    #[error("create_release needs a tag trigger, got {trigger}")]
    NotATag { trigger: String },
}

pub type Result<T> = std::result::Result<T, ActionError>;

/// Run `action` for `job_id` inside `ctx`.
pub async fn run_action(action: &Action, job_id: &str, ctx: &JobContext) -> Result<String> {
    match action {
        Action::UploadArtifact {
            name,
            path,
            retention_days,
        } => upload_artifact(ctx, job_id, name, path, *retention_days),
        Action::DownloadArtifact { name, path } => download_artifact(ctx, name, path),
        Action::VerifyPackage => verify_package(ctx),
        Action::PublishPackage { path, token_secret } => {
            publish_package(ctx, path, token_secret).await
        }
        Action::CreateRelease {
            path,
            draft,
            generate_notes,
            token_secret,
        } => create_release(ctx, path, *draft, *generate_notes, token_secret).await,
    }
}

fn matching_files(ctx: &JobContext, pattern: &str) -> Result<Vec<PathBuf>> {
    let files = collect_files(&ctx.workspace, pattern)?;
    if files.is_empty() {
        return Err(ActionError::NoFiles {
            pattern: pattern.to_string(),
        });
    }
    Ok(files)
}

fn token<'a>(ctx: &'a JobContext, name: &str) -> Result<&'a SecretValue> {
    ctx.secrets
        .get(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ActionError::MissingSecret {
            name: name.to_string(),
        })
}

fn upload_artifact(
    ctx: &JobContext,
    job_id: &str,
    name: &str,
    pattern: &str,
    retention_days: u32,
) -> Result<String> {
    let files = matching_files(ctx, pattern)?;
    let manifest = ctx.artifacts.upload(UploadRequest {
        name: name.to_string(),
        producer: job_id.to_string(),
        root: ctx.workspace.clone(),
        files,
        retention_days,
        now: Utc::now(),
    })?;
    Ok(format!(
        "stored {} file(s), {} bytes, as '{}' until {}",
        manifest.files.len(),
        manifest.total_size(),
        manifest.name,
        manifest.expires_at.to_rfc3339()
    ))
}

fn download_artifact(ctx: &JobContext, name: &str, path: &str) -> Result<String> {
    let dest = ctx.workspace.join(path);
    let written = ctx.artifacts.download(name, &dest, Utc::now())?;
    Ok(format!(
        "downloaded {} file(s) of '{}' into {}",
        written.len(),
        name,
        path
    ))
}

fn verify_package(ctx: &JobContext) -> Result<String> {
    let package = ctx.package.as_ref().ok_or(ActionError::NoPackage)?;
    package.validate()?;
    let constraints = package.dependency_constraints()?;
    let version = package.resolve_version(&ctx.workspace)?;
    let floor = package.runtime_floor()?;
    Ok(format!(
        "{} {} ({} dependencies, runtime >= {})",
        package.name,
        version,
        constraints.len(),
        floor.as_deref().unwrap_or("any")
    ))
}

async fn publish_package(ctx: &JobContext, pattern: &str, token_secret: &str) -> Result<String> {
    let token = token(ctx, token_secret)?;
    let mut uploaded = Vec::new();
    for file in matching_files(ctx, pattern)? {
        let dist = DistributionFile::from_path(&ctx.workspace.join(&file))?;
        ctx.package_index.upload(&dist, token).await?;
        info!(file = %dist.filename, version = %dist.version, "published");
        uploaded.push(dist.filename);
    }
    Ok(format!("uploaded {}", uploaded.join(", ")))
}

async fn create_release(
    ctx: &JobContext,
    pattern: &str,
    draft: bool,
    generate_notes: bool,
    token_secret: &str,
) -> Result<String> {
    let tag = ctx
        .trigger
        .tag_name()
        .ok_or_else(|| ActionError::NotATag {
            trigger: ctx.trigger.to_string(),
        })?
        .to_string();
    let token = token(ctx, token_secret)?;
    let files = matching_files(ctx, pattern)?;

    let request = ReleaseRequest {
        name: tag.clone(),
        tag,
        draft,
        generate_notes,
        target_sha: ctx.trigger.sha.clone(),
    };
    let release = ctx.release_store.create_release(&request, token).await?;
    for file in &files {
        ctx.release_store
            .upload_asset(&release, &ctx.workspace.join(file), token)
            .await?;
    }
    info!(tag = %release.tag, assets = files.len(), draft, "release created");
    Ok(format!(
        "{} release {} with {} asset(s){}",
        if draft { "drafted" } else { "created" },
        release.tag,
        files.len(),
        release
            .html_url
            .as_deref()
            .map(|u| format!(": {u}"))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryPackageIndex, MemoryReleaseStore};
    use relgate_core::{
        FsArtifactStore, MemorySecretStore, SecretInjector, SecretRef, SecretScope, TriggerEvent,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        index: Arc<MemoryPackageIndex>,
        releases: Arc<MemoryReleaseStore>,
        ctx: JobContext,
    }

    fn fixture(trigger: TriggerEvent, secrets: SecretScope) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("src");
        std::fs::create_dir_all(workspace.join("dist")).unwrap();
        std::fs::write(
            workspace.join("dist/weaviate_client-3.10.0-py3-none-any.whl"),
            b"wheel",
        )
        .unwrap();
        std::fs::write(workspace.join("dist/weaviate-client-3.10.0.tar.gz"), b"sdist").unwrap();
        let index = Arc::new(MemoryPackageIndex::new());
        let releases = Arc::new(MemoryReleaseStore::new());
        let ctx = JobContext {
            run_id: "run".to_string(),
            trigger,
            secrets,
            workspace,
            state_dir: dir.path().join("store"),
            base_env: Arc::new(BTreeMap::new()),
            default_timeout_minutes: 360,
            artifacts: Arc::new(FsArtifactStore::new(dir.path().join("store")).unwrap()),
            package_index: index.clone(),
            release_store: releases.clone(),
            package: None,
        };
        Fixture {
            _dir: dir,
            index,
            releases,
            ctx,
        }
    }

    fn tokens() -> SecretScope {
        let store = MemorySecretStore::new()
            .with("PYPI_API_TOKEN", "pypi-abc")
            .with("GITHUB_TOKEN", "ghs-abc");
        SecretInjector::bind(
            "publish",
            &[
                SecretRef::required("PYPI_API_TOKEN"),
                SecretRef::required("GITHUB_TOKEN"),
            ],
            &store,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_download_artifact() {
        let f = fixture(TriggerEvent::push("main"), SecretScope::empty());
        let upload = Action::UploadArtifact {
            name: "dist".to_string(),
            path: "dist/*".to_string(),
            retention_days: 5,
        };
        let out = run_action(&upload, "build", &f.ctx).await.unwrap();
        assert!(out.contains("2 file(s)"));

        std::fs::remove_dir_all(f.ctx.workspace.join("dist")).unwrap();
        let download = Action::DownloadArtifact {
            name: "dist".to_string(),
            path: ".".to_string(),
        };
        run_action(&download, "publish", &f.ctx).await.unwrap();
        assert!(f
            .ctx
            .workspace
            .join("dist/weaviate_client-3.10.0-py3-none-any.whl")
            .is_file());
    }

    #[tokio::test]
    async fn test_upload_without_matches_fails() {
        let f = fixture(TriggerEvent::push("main"), SecretScope::empty());
        let upload = Action::UploadArtifact {
            name: "wheels".to_string(),
            path: "build/*.whl".to_string(),
            retention_days: 5,
        };
        let err = run_action(&upload, "build", &f.ctx).await.unwrap_err();
        assert!(matches!(err, ActionError::NoFiles { .. }));
    }

    #[tokio::test]
    async fn test_publish_requires_token() {
        let f = fixture(TriggerEvent::tag("v3.10.0"), SecretScope::empty());
        let publish = Action::PublishPackage {
            path: "dist/*".to_string(),
            token_secret: "PYPI_API_TOKEN".to_string(),
        };
        let err = run_action(&publish, "publish", &f.ctx).await.unwrap_err();
        assert!(matches!(err, ActionError::MissingSecret { .. }));
        assert!(f.index.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_publish_uploads_every_distribution() {
        let f = fixture(TriggerEvent::tag("v3.10.0"), tokens());
        let publish = Action::PublishPackage {
            path: "dist/*".to_string(),
            token_secret: "PYPI_API_TOKEN".to_string(),
        };
        run_action(&publish, "publish", &f.ctx).await.unwrap();
        assert_eq!(f.index.uploads().len(), 2);

        // Same version again is rejected by the index.
        let err = run_action(&publish, "publish", &f.ctx).await.unwrap_err();
        assert!(matches!(
            err,
            ActionError::Publish(PublishError::DuplicateVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_release_attaches_wheel() {
        let f = fixture(TriggerEvent::tag("v3.10.0"), tokens());
        let release = Action::CreateRelease {
            path: "dist/*.whl".to_string(),
            draft: true,
            generate_notes: true,
            token_secret: "GITHUB_TOKEN".to_string(),
        };
        run_action(&release, "gh-release", &f.ctx).await.unwrap();
        let releases = f.releases.releases();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].request.tag, "v3.10.0");
        assert!(releases[0].request.draft);
        assert_eq!(
            releases[0].assets,
            vec!["weaviate_client-3.10.0-py3-none-any.whl".to_string()]
        );
    }

    #[tokio::test]
    async fn test_create_release_rejects_branch_trigger() {
        let f = fixture(TriggerEvent::push("main"), tokens());
        let release = Action::CreateRelease {
            path: "dist/*.whl".to_string(),
            draft: true,
            generate_notes: true,
            token_secret: "GITHUB_TOKEN".to_string(),
        };
        let err = run_action(&release, "gh-release", &f.ctx).await.unwrap_err();
        assert!(matches!(err, ActionError::NotATag { .. }));
        assert!(f.releases.releases().is_empty());
    }

    #[tokio::test]
    async fn test_verify_package_without_metadata() {
        let f = fixture(TriggerEvent::push("main"), SecretScope::empty());
        let err = run_action(&Action::VerifyPackage, "build", &f.ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::NoPackage));
    }
}
