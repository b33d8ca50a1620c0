//! Per-job workspaces.
//!
//! Every job instance runs in its own copy of the source checkout, so
//! nothing one job writes is visible to another. Outputs leave a job only
//! through the artifact store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

/// A provisioned job workspace.
#[derive(Debug)]
pub struct JobWorkspace {
    path: PathBuf,
}

impl JobWorkspace {
    /// Copy `source` into a fresh `<state_dir>/<run_id>/jobs/<job dir>`.
    ///
    /// `state_dir` is left out of the copy when it lies inside `source`.
    pub fn provision(
        source: &Path,
        state_dir: &Path,
        run_id: &str,
        job_id: &str,
    ) -> io::Result<Self> {
        if !source.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("workspace {} is not a directory", source.display()),
            ));
        }
        let path = state_dir.join(run_id).join("jobs").join(dir_name(job_id));
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;

        let source = source.canonicalize()?;
        let excluded = state_dir.canonicalize()?;
        copy_tree(&source, &path, &excluded)?;
        debug!(job = %job_id, path = %path.display(), "job workspace provisioned");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Filesystem-safe directory name for a job instance id. The digest suffix
/// keeps ids that differ only in punctuation apart.
fn dir_name(job_id: &str) -> String {
    let slug: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = hex::encode(Sha256::digest(job_id.as_bytes()));
    format!("{}-{}", slug.trim_matches(|c| c == '_' || c == '.'), &digest[..8])
}

fn copy_tree(source: &Path, dest: &Path, excluded: &Path) -> io::Result<()> {
    let walker = WalkDir::new(source)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !e.path().starts_with(excluded));
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path) -> io::Result<()> {
    fs::copy(src, target).map(|_| ())
}
