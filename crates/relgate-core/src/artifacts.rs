//! Named build outputs handed from one job to later jobs.
//!
//! An artifact is written once by its producer and read any number of times.
//! Uploads are staged in a temporary directory and renamed into place, so a
//! reader never sees a partial artifact.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use globset::Glob;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("artifact '{name}' not found")]
    NotFound { name: String },

    #[error("artifact '{name}' expired at {expired_at}")]
    Expired {
        name: String,
        expired_at: DateTime<Utc>,
    },

    #[error("artifact '{name}' is unusable: producer job '{producer}' failed")]
    Unusable { name: String, producer: String },

    #[error("invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("no files match '{pattern}'")]
    NoFiles { pattern: String },

    #[error("invalid path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("artifact '{name}' file '{file}' failed digest verification")]
    Corrupt { name: String, file: String },

    #[error("artifact manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// One stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the upload root, `/`-separated.
    pub relative_path: String,
    pub sha256: String,
    pub size: u64,
}

/// Metadata written next to an artifact's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub name: String,
    /// Job instance that uploaded the artifact.
    pub producer: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// False once the producer job failed.
    pub usable: bool,
    pub files: Vec<ArtifactFile>,
}

impl ArtifactManifest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Files to store under a name.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub producer: String,
    /// Directory `files` are relative to.
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
    pub retention_days: u32,
    pub now: DateTime<Utc>,
}

/// Storage for artifacts shared between the jobs of a run.
pub trait ArtifactStore: Send + Sync {
    fn upload(&self, request: UploadRequest) -> Result<ArtifactManifest>;

    /// Copy the artifact's files into `dest`, preserving relative paths.
    /// Returns the written paths.
    fn download(&self, name: &str, dest: &Path, now: DateTime<Utc>) -> Result<Vec<PathBuf>>;

    fn manifest(&self, name: &str) -> Result<ArtifactManifest>;

    /// Mark every artifact uploaded by `producer` unusable. Returns the
    /// affected names.
    fn mark_unusable(&self, producer: &str) -> Result<Vec<String>>;

    /// Delete expired artifacts. Returns the removed names.
    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    fn list(&self) -> Result<Vec<ArtifactManifest>>;
}

/// Filesystem-backed artifact store.
///
/// Layout: `<root>/artifacts/<name>/{manifest.json, files/...}`
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    artifacts_dir: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`. Creates `root/artifacts/` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let artifacts_dir = root.as_ref().join("artifacts");
        fs::create_dir_all(&artifacts_dir)?;
        Ok(Self { artifacts_dir })
    }

    fn artifact_dir(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.artifacts_dir.join(name))
    }

    fn write_manifest(dir: &Path, manifest: &ArtifactManifest) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(manifest)?)?;
        tmp.persist(dir.join(MANIFEST_FILE)).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_manifest(dir: &Path, name: &str) -> Result<ArtifactManifest> {
        let bytes = fs::read(dir.join(MANIFEST_FILE)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound {
                    name: name.to_string(),
                }
            } else {
                ArtifactError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.artifacts_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn upload(&self, request: UploadRequest) -> Result<ArtifactManifest> {
        let final_dir = self.artifact_dir(&request.name)?;
        if final_dir.exists() {
            return Err(ArtifactError::AlreadyExists { name: request.name });
        }

        let staging = tempfile::Builder::new()
            .prefix(".upload-")
            .tempdir_in(&self.artifacts_dir)?;
        let files_dir = staging.path().join(FILES_DIR);
        fs::create_dir_all(&files_dir)?;

        let mut files = Vec::with_capacity(request.files.len());
        for file in &request.files {
            let source = request.root.join(file);
            let relative = to_slash_path(file);
            let bytes = fs::read(&source)?;
            let target = files_dir.join(file);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &bytes)?;
            files.push(ArtifactFile {
                relative_path: relative,
                sha256: hex::encode(Sha256::digest(&bytes)),
                size: bytes.len() as u64,
            });
        }

        let manifest = ArtifactManifest {
            name: request.name.clone(),
            producer: request.producer.clone(),
            created_at: request.now,
            expires_at: request.now + Duration::days(i64::from(request.retention_days)),
            usable: true,
            files,
        };
        Self::write_manifest(staging.path(), &manifest)?;

        // Rename fails if another upload won the race for the name.
        fs::rename(staging.path(), &final_dir).map_err(|e| {
            if final_dir.exists() {
                ArtifactError::AlreadyExists {
                    name: request.name.clone(),
                }
            } else {
                ArtifactError::Io(e)
            }
        })?;

        info!(
            artifact = %manifest.name,
            producer = %manifest.producer,
            files = manifest.files.len(),
            bytes = manifest.total_size(),
            "artifact uploaded"
        );
        Ok(manifest)
    }

    fn download(&self, name: &str, dest: &Path, now: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        let dir = self.artifact_dir(name)?;
        let manifest = Self::read_manifest(&dir, name)?;
        if !manifest.usable {
            return Err(ArtifactError::Unusable {
                name: name.to_string(),
                producer: manifest.producer,
            });
        }
        if manifest.is_expired(now) {
            return Err(ArtifactError::Expired {
                name: name.to_string(),
                expired_at: manifest.expires_at,
            });
        }

        let mut written = Vec::with_capacity(manifest.files.len());
        for file in &manifest.files {
            let bytes = fs::read(dir.join(FILES_DIR).join(&file.relative_path))?;
            if hex::encode(Sha256::digest(&bytes)) != file.sha256 {
                return Err(ArtifactError::Corrupt {
                    name: name.to_string(),
                    file: file.relative_path.clone(),
                });
            }
            let target = dest.join(&file.relative_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &bytes)?;
            written.push(target);
        }
        debug!(artifact = %name, dest = %dest.display(), files = written.len(), "artifact downloaded");
        Ok(written)
    }

    fn manifest(&self, name: &str) -> Result<ArtifactManifest> {
        let dir = self.artifact_dir(name)?;
        Self::read_manifest(&dir, name)
    }

    fn mark_unusable(&self, producer: &str) -> Result<Vec<String>> {
        let mut marked = Vec::new();
        for name in self.names()? {
            let dir = self.artifacts_dir.join(&name);
            let mut manifest = Self::read_manifest(&dir, &name)?;
            if manifest.producer == producer && manifest.usable {
                manifest.usable = false;
                Self::write_manifest(&dir, &manifest)?;
                marked.push(name);
            }
        }
        if !marked.is_empty() {
            info!(producer = %producer, artifacts = ?marked, "artifacts marked unusable");
        }
        Ok(marked)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for name in self.names()? {
            let dir = self.artifacts_dir.join(&name);
            let manifest = Self::read_manifest(&dir, &name)?;
            if manifest.is_expired(now) {
                fs::remove_dir_all(&dir)?;
                removed.push(name);
            }
        }
        if !removed.is_empty() {
            info!(artifacts = ?removed, "expired artifacts removed");
        }
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<ArtifactManifest>> {
        self.names()?
            .into_iter()
            .map(|name| Self::read_manifest(&self.artifacts_dir.join(&name), &name))
            .collect()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(ArtifactError::InvalidName(name.to_string()))
    }
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Files under `root` whose relative path matches the glob `pattern`.
///
/// The walk starts at the pattern's literal directory prefix. Returned paths
/// are relative to `root` and sorted.
pub fn collect_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher = Glob::new(pattern)
        .map_err(|e| ArtifactError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?
        .compile_matcher();

    let prefix: PathBuf = pattern
        .split('/')
        .take_while(|part| !part.contains(['*', '?', '[', '{']))
        .collect();
    // A fully literal pattern names a file, not a directory.
    let start = if prefix.as_os_str().is_empty() || root.join(&prefix).is_file() {
        prefix.parent().map(Path::to_path_buf).unwrap_or_default()
    } else {
        prefix
    };

    let mut found = Vec::new();
    let mut stack = vec![start];
    while let Some(relative_dir) = stack.pop() {
        let dir = root.join(&relative_dir);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let relative = relative_dir.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                stack.push(relative);
            } else if matcher.is_match(to_slash_path(&relative)) {
                found.push(relative);
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn workspace_with_dist(dir: &Path) -> PathBuf {
        let ws = dir.join("ws");
        fs::create_dir_all(ws.join("dist")).unwrap();
        fs::write(ws.join("dist/pkg-1.0.0-py3-none-any.whl"), b"wheel").unwrap();
        fs::write(ws.join("dist/pkg-1.0.0.tar.gz"), b"sdist").unwrap();
        fs::write(ws.join("setup.py"), b"setup()").unwrap();
        ws
    }

    fn request(ws: &Path, name: &str, now: DateTime<Utc>) -> UploadRequest {
        UploadRequest {
            name: name.to_string(),
            producer: "build".to_string(),
            root: ws.to_path_buf(),
            files: collect_files(ws, "dist/*").unwrap(),
            retention_days: 5,
            now,
        }
    }

    #[test]
    fn test_collect_files_matches_glob() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_with_dist(dir.path());
        let files = collect_files(&ws, "dist/*").unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("dist/pkg-1.0.0-py3-none-any.whl"),
                PathBuf::from("dist/pkg-1.0.0.tar.gz"),
            ]
        );
        let wheels = collect_files(&ws, "dist/*.whl").unwrap();
        assert_eq!(wheels.len(), 1);
        assert_eq!(collect_files(&ws, "setup.py").unwrap().len(), 1);
        assert!(collect_files(&ws, "missing/*").unwrap().is_empty());
    }

    #[test]
    fn test_upload_then_download() {
        let (dir, store) = make_store();
        let ws = workspace_with_dist(dir.path());
        let now = Utc::now();
        let manifest = store.upload(request(&ws, "dist", now)).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.expires_at, now + Duration::days(5));

        let dest = dir.path().join("out");
        let written = store.download("dist", &dest, now).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(
            fs::read(dest.join("dist/pkg-1.0.0.tar.gz")).unwrap(),
            b"sdist"
        );
    }

    #[test]
    fn test_second_upload_rejected() {
        let (dir, store) = make_store();
        let ws = workspace_with_dist(dir.path());
        let now = Utc::now();
        store.upload(request(&ws, "dist", now)).unwrap();
        assert!(matches!(
            store.upload(request(&ws, "dist", now)),
            Err(ArtifactError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_failed_producer_outputs_unusable() {
        let (dir, store) = make_store();
        let ws = workspace_with_dist(dir.path());
        let now = Utc::now();
        store.upload(request(&ws, "dist", now)).unwrap();
        assert_eq!(store.mark_unusable("build").unwrap(), vec!["dist"]);
        assert!(matches!(
            store.download("dist", dir.path(), now),
            Err(ArtifactError::Unusable { .. })
        ));
    }

    #[test]
    fn test_expired_artifact_rejected_and_swept() {
        let (dir, store) = make_store();
        let ws = workspace_with_dist(dir.path());
        let now = Utc::now();
        store.upload(request(&ws, "dist", now)).unwrap();

        let later = now + Duration::days(6);
        assert!(matches!(
            store.download("dist", dir.path(), later),
            Err(ArtifactError::Expired { .. })
        ));
        assert!(store.sweep_expired(now).unwrap().is_empty());
        assert_eq!(store.sweep_expired(later).unwrap(), vec!["dist"]);
        assert!(matches!(
            store.manifest("dist"),
            Err(ArtifactError::NotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (_dir, store) = make_store();
        for bad in ["", "..", "a/b", ".hidden"] {
            assert!(matches!(
                store.manifest(bad),
                Err(ArtifactError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_list_skips_staging_dirs() {
        let (dir, store) = make_store();
        let ws = workspace_with_dist(dir.path());
        store.upload(request(&ws, "dist", Utc::now())).unwrap();
        fs::create_dir_all(dir.path().join("store/artifacts/.upload-stale")).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "dist");
    }
}
