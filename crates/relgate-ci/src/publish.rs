//! Package-index and release-store clients.
//!
//! Both services are traits so that runs can target the real HTTP APIs or
//! the in-memory fakes in [`crate::fakes`]. Neither client retries: a
//! rejected upload surfaces as a step failure.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relgate_core::SecretValue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{package} {version} already exists on the package index")]
    DuplicateVersion { package: String, version: String },

    #[error("a release for tag '{tag}' already exists")]
    DuplicateRelease { tag: String },

    #[error("unrecognised distribution file name '{0}'")]
    UnknownDistribution(String),

    #[error("{service} rejected the credentials")]
    Unauthorized { service: &'static str },

    #[error("{service} returned HTTP {status}: {body}")]
    Http {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("release store is not configured: {0}")]
    NotConfigured(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of built distribution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    BdistWheel,
    Sdist,
}

impl DistributionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionKind::BdistWheel => "bdist_wheel",
            DistributionKind::Sdist => "sdist",
        }
    }
}

/// A built distribution file ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionFile {
    pub path: PathBuf,
    pub filename: String,
    pub package: String,
    pub version: String,
    pub kind: DistributionKind,
    /// Python tag for wheels, `source` for sdists.
    pub pyversion: String,
    pub sha256: String,
    pub content: Vec<u8>,
}

impl DistributionFile {
    /// Read a wheel (`name-version-py-abi-platform.whl`) or sdist
    /// (`name-version.tar.gz` / `.zip`).
    pub fn from_path(path: &Path) -> Result<Self, PublishError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PublishError::UnknownDistribution(path.display().to_string()))?;
        let unknown = || PublishError::UnknownDistribution(filename.clone());

        let (package, version, kind, pyversion) = if let Some(stem) = filename.strip_suffix(".whl")
        {
            let parts: Vec<&str> = stem.split('-').collect();
            if parts.len() < 5 {
                return Err(unknown());
            }
            (
                parts[0].to_string(),
                parts[1].to_string(),
                DistributionKind::BdistWheel,
                parts[parts.len() - 3].to_string(),
            )
        } else {
            let stem = filename
                .strip_suffix(".tar.gz")
                .or_else(|| filename.strip_suffix(".zip"))
                .ok_or_else(unknown)?;
            let (package, version) = stem.rsplit_once('-').ok_or_else(unknown)?;
            (
                package.to_string(),
                version.to_string(),
                DistributionKind::Sdist,
                "source".to_string(),
            )
        };
        if package.is_empty() || version.is_empty() {
            return Err(unknown());
        }

        let content = std::fs::read(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            sha256: hex::encode(Sha256::digest(&content)),
            filename,
            package,
            version,
            kind,
            pyversion,
            content,
        })
    }
}

/// A package index accepting distribution uploads.
#[async_trait]
pub trait PackageIndex: Send + Sync {
    /// Upload one file. A version that already exists must be rejected with
    /// [`PublishError::DuplicateVersion`].
    async fn upload(&self, file: &DistributionFile, token: &SecretValue) -> Result<(), PublishError>;
}

fn user_agent() -> String {
    format!("relgate/{}", relgate_core::VERSION)
}

/// Client for the legacy multipart upload API.
#[derive(Debug, Clone)]
pub struct HttpPackageIndex {
    client: reqwest::Client,
    url: String,
}

impl HttpPackageIndex {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PackageIndex for HttpPackageIndex {
    async fn upload(&self, file: &DistributionFile, token: &SecretValue) -> Result<(), PublishError> {
        let content = reqwest::multipart::Part::bytes(file.content.clone())
            .file_name(file.filename.clone())
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new()
            .text(":action", "file_upload")
            .text("protocol_version", "1")
            .text("metadata_version", "2.1")
            .text("name", file.package.clone())
            .text("version", file.version.clone())
            .text("filetype", file.kind.as_str())
            .text("pyversion", file.pyversion.clone())
            .text("sha256_digest", file.sha256.clone())
            .part("content", content);

        debug!(file = %file.filename, url = %self.url, "uploading distribution");
        let response = self
            .client
            .post(&self.url)
            .basic_auth("__token__", Some(token.expose()))
            .header(reqwest::header::USER_AGENT, user_agent())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(file = %file.filename, version = %file.version, "distribution uploaded");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            409 => PublishError::DuplicateVersion {
                package: file.package.clone(),
                version: file.version.clone(),
            },
            400 if body.contains("already exists") => PublishError::DuplicateVersion {
                package: file.package.clone(),
                version: file.version.clone(),
            },
            401 | 403 => PublishError::Unauthorized {
                service: "package index",
            },
            code => PublishError::Http {
                service: "package index",
                status: code,
                body,
            },
        })
    }
}

/// Parameters of a release to create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub tag: String,
    pub name: String,
    pub draft: bool,
    pub generate_notes: bool,
    pub target_sha: Option<String>,
}

/// A release as acknowledged by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedRelease {
    pub id: u64,
    pub tag: String,
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

/// A source-control release store.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn create_release(
        &self,
        request: &ReleaseRequest,
        token: &SecretValue,
    ) -> Result<CreatedRelease, PublishError>;

    async fn upload_asset(
        &self,
        release: &CreatedRelease,
        file: &Path,
        token: &SecretValue,
    ) -> Result<(), PublishError>;
}

/// Client for the GitHub-style REST releases API.
#[derive(Debug, Clone)]
pub struct GitHubReleaseStore {
    client: reqwest::Client,
    api_url: String,
    repository: Option<String>,
}

#[derive(Serialize)]
struct CreateReleaseBody<'a> {
    tag_name: &'a str,
    name: &'a str,
    draft: bool,
    generate_release_notes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_commitish: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateReleaseResponse {
    id: u64,
    #[serde(default)]
    upload_url: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

impl GitHubReleaseStore {
    pub fn new(api_url: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            repository: Some(repository.into()),
            ..Self::unconfigured(api_url)
        }
    }

    /// A store with no target repository; creating a release fails with
    /// [`PublishError::NotConfigured`].
    pub fn unconfigured(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            repository: None,
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder, token: &SecretValue) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(token.expose())
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, user_agent())
    }

    async fn error_for(response: reqwest::Response) -> PublishError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match status {
            401 | 403 => PublishError::Unauthorized {
                service: "release store",
            },
            _ => PublishError::Http {
                service: "release store",
                status,
                body,
            },
        }
    }
}

#[async_trait]
impl ReleaseStore for GitHubReleaseStore {
    async fn create_release(
        &self,
        request: &ReleaseRequest,
        token: &SecretValue,
    ) -> Result<CreatedRelease, PublishError> {
        let repository = self.repository.as_deref().ok_or_else(|| {
            PublishError::NotConfigured("no repository set (RELGATE_REPOSITORY)".to_string())
        })?;
        let url = format!("{}/repos/{}/releases", self.api_url, repository);
        let body = CreateReleaseBody {
            tag_name: &request.tag,
            name: &request.name,
            draft: request.draft,
            generate_release_notes: request.generate_notes,
            target_commitish: request.target_sha.as_deref(),
        };
        let response = self
            .authorized(self.client.post(&url), token)
            .json(&body)
            .send()
            .await?;

        if response.status().as_u16() == 422 {
            return Err(PublishError::DuplicateRelease {
                tag: request.tag.clone(),
            });
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        let created: CreateReleaseResponse = response.json().await?;
        info!(tag = %request.tag, id = created.id, draft = request.draft, "release created");
        Ok(CreatedRelease {
            id: created.id,
            tag: request.tag.clone(),
            upload_url: created.upload_url,
            html_url: created.html_url,
        })
    }

    async fn upload_asset(
        &self,
        release: &CreatedRelease,
        file: &Path,
        token: &SecretValue,
    ) -> Result<(), PublishError> {
        let upload_url = release
            .upload_url
            .as_deref()
            .map(|u| u.split('{').next().unwrap_or(u).to_string())
            .ok_or_else(|| {
                PublishError::NotConfigured(format!("release {} has no upload URL", release.id))
            })?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = tokio::fs::read(file).await?;

        let response = self
            .authorized(self.client.post(&upload_url), token)
            .query(&[("name", name.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        debug!(release = release.id, asset = %name, "release asset uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response; returns the base URL and a handle
    /// yielding the raw request text.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let head = text[..head_end].to_ascii_lowercase();
                    let length = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok());
                    let done = match length {
                        Some(len) => raw.len() >= head_end + 4 + len,
                        None => !head.contains("transfer-encoding: chunked") || text.ends_with("0\r\n\r\n"),
                    };
                    if done {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn wheel(dir: &Path) -> DistributionFile {
        let path = dir.join("weaviate_client-3.10.0-py3-none-any.whl");
        std::fs::write(&path, b"wheel-bytes").unwrap();
        DistributionFile::from_path(&path).unwrap()
    }

    #[test]
    fn test_distribution_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let file = wheel(dir.path());
        assert_eq!(file.package, "weaviate_client");
        assert_eq!(file.version, "3.10.0");
        assert_eq!(file.kind, DistributionKind::BdistWheel);
        assert_eq!(file.pyversion, "py3");

        let sdist = dir.path().join("weaviate-client-3.10.0.tar.gz");
        std::fs::write(&sdist, b"sdist").unwrap();
        let file = DistributionFile::from_path(&sdist).unwrap();
        assert_eq!(file.package, "weaviate-client");
        assert_eq!(file.version, "3.10.0");
        assert_eq!(file.kind, DistributionKind::Sdist);

        let other = dir.path().join("notes.txt");
        std::fs::write(&other, b"x").unwrap();
        assert!(matches!(
            DistributionFile::from_path(&other),
            Err(PublishError::UnknownDistribution(_))
        ));
    }

    #[tokio::test]
    async fn test_index_upload_sends_token_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (url, request) = serve_once("200 OK", "").await;
        let index = HttpPackageIndex::new(format!("{url}/legacy/"));
        index
            .upload(&wheel(dir.path()), &SecretValue::new("pypi-token"))
            .await
            .unwrap();
        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST /legacy/"));
        assert!(raw.contains("file_upload"));
        assert!(raw.contains("weaviate_client-3.10.0-py3-none-any.whl"));
        assert!(raw.to_ascii_lowercase().contains("authorization: basic"));
    }

    #[tokio::test]
    async fn test_index_duplicate_version() {
        let dir = tempfile::tempdir().unwrap();
        let (url, _request) =
            serve_once("400 Bad Request", "File already exists. See the upload docs.").await;
        let index = HttpPackageIndex::new(url);
        let err = index
            .upload(&wheel(dir.path()), &SecretValue::new("pypi-token"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::DuplicateVersion { .. }));
    }

    #[tokio::test]
    async fn test_create_draft_release() {
        let (url, request) = serve_once(
            "201 Created",
            r#"{"id": 42, "upload_url": "https://uploads.example/releases/42/assets{?name,label}", "html_url": "https://example/releases/42"}"#,
        )
        .await;
        let store = GitHubReleaseStore::new(url, "weaviate/weaviate-python-client");
        let created = store
            .create_release(
                &ReleaseRequest {
                    tag: "v3.10.0".to_string(),
                    name: "v3.10.0".to_string(),
                    draft: true,
                    generate_notes: true,
                    target_sha: None,
                },
                &SecretValue::new("gh-token"),
            )
            .await
            .unwrap();
        assert_eq!(created.id, 42);
        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST /repos/weaviate/weaviate-python-client/releases"));
        assert!(raw.contains(r#""draft":true"#));
        assert!(raw.contains(r#""generate_release_notes":true"#));
    }
}
