//! Resumable range-request download with HEAD warmup and artifact validation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RANGE};
use reqwest::{Client, StatusCode, Url};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::retry::{RetryPolicy, retry_with_policy};

/// Source of bearer tokens for retried attempts.
///
/// The first attempt may carry a caller-supplied single-use token instead;
/// every later attempt authenticates through this source, with
/// `force_refresh` set after a 401/403.
#[async_trait]
pub trait BearerTokenSource: Send + Sync {
    async fn bearer_token(&self, force_refresh: bool) -> Result<String, TransferError>;
}

/// A single download job.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub dest: PathBuf,
    /// Single-use token passed as a query parameter on the first attempt.
    pub download_token: Option<String>,
    /// Size reported by the remote listing. Mismatch is a warning only; the
    /// remote side revises sizes while it is still finalizing.
    pub expected_bytes: Option<u64>,
}

/// Result of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub content_type: Option<String>,
    pub content_length: u64,
}

/// Resumable downloader.
pub struct Downloader {
    client: Client,
    policy: RetryPolicy,
    /// Validation floor; HEAD sizes below this mean the remote placeholder
    /// has not been replaced by the real artifact yet.
    min_expected_bytes: u64,
    /// Pause before the second warmup probe when the artifact is not ready.
    warmup_retry_delay: Duration,
    token_source: Option<Arc<dyn BearerTokenSource>>,
}

impl Downloader {
    pub fn new(client: Client, policy: RetryPolicy, min_expected_bytes: u64) -> Self {
        Self {
            client,
            policy,
            min_expected_bytes,
            warmup_retry_delay: Duration::from_secs(30),
            token_source: None,
        }
    }

    pub fn with_token_source(mut self, source: Arc<dyn BearerTokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    /// Override the pause before the second warmup probe.
    pub fn with_warmup_retry_delay(mut self, delay: Duration) -> Self {
        self.warmup_retry_delay = delay;
        self
    }

    /// Download `req.url` to `req.dest`, resuming any existing partial file.
    pub async fn download(&self, req: &DownloadRequest) -> Result<DownloadOutcome, TransferError> {
        let force_refresh = Arc::new(AtomicBool::new(false));

        retry_with_policy(&self.policy, |attempt| {
            let force_refresh = Arc::clone(&force_refresh);
            async move { self.attempt(req, attempt, &force_refresh).await }
        })
        .await
    }

    async fn attempt(
        &self,
        req: &DownloadRequest,
        attempt: u32,
        force_refresh: &AtomicBool,
    ) -> Result<DownloadOutcome, TransferError> {
        let auth = self.auth_for_attempt(req, attempt, force_refresh).await?;
        let url = auth.apply_to_url(&req.url)?;

        let head = self.warmup(&url, &auth, force_refresh).await?;

        let resume_from = match fs::metadata(&req.dest).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => 0,
        };

        let mut get = self.client.get(url.clone());
        if let Some(bearer) = &auth.bearer {
            get = get.header(AUTHORIZATION, format!("Bearer {bearer}"));
        }
        if resume_from > 0 {
            get = get.header(RANGE, format!("bytes={resume_from}-"));
            debug!("download: resuming {} from byte {}", req.dest.display(), resume_from);
        }

        let mut response = get.send().await?;
        let status = response.status();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                force_refresh.store(true, Ordering::SeqCst);
                return Err(TransferError::Auth { status });
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // The server refuses our offset. If we already hold at least
                // the expected byte count, the file is complete; otherwise
                // the partial is unusable.
                if let Some(expected) = req.expected_bytes {
                    if resume_from >= expected {
                        info!(
                            "download: {} already complete at {} bytes (416)",
                            req.dest.display(),
                            resume_from
                        );
                        return self
                            .validated_outcome(req, head.content_type.clone())
                            .await;
                    }
                }
                let _ = fs::remove_file(&req.dest).await;
                return Err(TransferError::invalid_artifact(
                    "range not satisfiable for incomplete local file",
                ));
            }
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => {
                if resume_from > 0 {
                    warn!(
                        "download: server ignored range request for {}, restarting from 0",
                        req.dest.display()
                    );
                }
            }
            other => {
                return Err(TransferError::http_status(other, req.url.clone(), "download"));
            }
        }

        let mut file = if status == StatusCode::PARTIAL_CONTENT {
            OpenOptions::new().append(true).open(&req.dest).await?
        } else {
            File::create(&req.dest).await?
        };

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .or(head.content_type);

        self.validated_outcome(req, content_type).await
    }

    async fn validated_outcome(
        &self,
        req: &DownloadRequest,
        content_type: Option<String>,
    ) -> Result<DownloadOutcome, TransferError> {
        match validate_artifact(
            &req.dest,
            content_type.as_deref(),
            req.expected_bytes,
            self.min_expected_bytes,
        )
        .await
        {
            Ok(content_length) => Ok(DownloadOutcome {
                content_type,
                content_length,
            }),
            Err(err) => {
                let _ = fs::remove_file(&req.dest).await;
                Err(err)
            }
        }
    }

    async fn auth_for_attempt(
        &self,
        req: &DownloadRequest,
        attempt: u32,
        force_refresh: &AtomicBool,
    ) -> Result<AttemptAuth, TransferError> {
        if attempt == 0 {
            if let Some(token) = &req.download_token {
                return Ok(AttemptAuth {
                    query_token: Some(token.clone()),
                    bearer: None,
                });
            }
        }

        if let Some(source) = &self.token_source {
            let refresh = force_refresh.swap(false, Ordering::SeqCst);
            let token = source.bearer_token(refresh).await?;
            return Ok(AttemptAuth {
                query_token: None,
                bearer: Some(token),
            });
        }

        Ok(AttemptAuth {
            query_token: None,
            bearer: None,
        })
    }

    /// HEAD the artifact before each attempt. A {404, 409, 425} means the
    /// remote side is still assembling it; probe once more after a pause
    /// before giving the attempt up as not-ready.
    async fn warmup(
        &self,
        url: &Url,
        auth: &AttemptAuth,
        force_refresh: &AtomicBool,
    ) -> Result<HeadProbe, TransferError> {
        let mut probe = self.head_probe(url, auth).await?;

        if matches!(probe.status.as_u16(), 404 | 409 | 425) {
            tokio::time::sleep(self.warmup_retry_delay).await;
            probe = self.head_probe(url, auth).await?;
            if matches!(probe.status.as_u16(), 404 | 409 | 425) {
                return Err(TransferError::not_ready(format!(
                    "artifact HEAD returned {} twice",
                    probe.status
                )));
            }
        }

        if matches!(
            probe.status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            force_refresh.store(true, Ordering::SeqCst);
            return Err(TransferError::Auth {
                status: probe.status,
            });
        }

        if let Some(len) = probe.content_length {
            if len < self.min_expected_bytes {
                return Err(TransferError::not_ready(format!(
                    "reported size {len} below floor {}",
                    self.min_expected_bytes
                )));
            }
        }

        Ok(probe)
    }

    async fn head_probe(&self, url: &Url, auth: &AttemptAuth) -> Result<HeadProbe, TransferError> {
        let mut head = self.client.head(url.clone());
        if let Some(bearer) = &auth.bearer {
            head = head.header(AUTHORIZATION, format!("Bearer {bearer}"));
        }
        let response = head.send().await?;

        Ok(HeadProbe {
            status: response.status(),
            content_length: response.content_length(),
            content_type: response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
        })
    }
}

struct AttemptAuth {
    query_token: Option<String>,
    bearer: Option<String>,
}

impl AttemptAuth {
    fn apply_to_url(&self, raw: &str) -> Result<Url, TransferError> {
        let mut url = Url::parse(raw)
            .map_err(|e| TransferError::invalid_artifact(format!("bad download URL: {e}")))?;
        if let Some(token) = &self.query_token {
            url.query_pairs_mut().append_pair("access_token", token);
        }
        Ok(url)
    }
}

struct HeadProbe {
    status: StatusCode,
    content_length: Option<u64>,
    content_type: Option<String>,
}

/// Validate a downloaded artifact on disk.
///
/// Returns the on-disk byte count when the file looks like a real video:
/// non-empty, at or above the floor, not an HTML error page, `.mp4` suffix.
/// A disagreement with the remote-reported size is only a warning.
pub(crate) async fn validate_artifact(
    path: &Path,
    content_type: Option<&str>,
    expected_bytes: Option<u64>,
    min_expected_bytes: u64,
) -> Result<u64, TransferError> {
    let meta = fs::metadata(path)
        .await
        .map_err(|_| TransferError::invalid_artifact("downloaded file missing"))?;
    let len = meta.len();

    if len == 0 {
        return Err(TransferError::invalid_artifact("downloaded file is empty"));
    }

    if len < min_expected_bytes {
        return Err(TransferError::invalid_artifact(format!(
            "downloaded size {len} below floor {min_expected_bytes}"
        )));
    }

    if let Some(ct) = content_type {
        if ct.contains("text/html") {
            return Err(TransferError::invalid_artifact(
                "content type text/html indicates an error page",
            ));
        }
    }

    if path.extension().and_then(|e| e.to_str()) != Some("mp4") {
        return Err(TransferError::invalid_artifact("destination is not an .mp4 path"));
    }

    if let Some(expected) = expected_bytes {
        if len != expected {
            warn!(
                "download: size {} differs from reported {} for {} (remote may still be revising)",
                len,
                expected,
                path.display()
            );
        }
    }

    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_temp(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, bytes).await.unwrap();
        path
    }

    #[test]
    fn test_query_token_applied_to_url() {
        let auth = AttemptAuth {
            query_token: Some("one-shot".into()),
            bearer: None,
        };
        let url = auth.apply_to_url("https://media.example.com/rec/abc?x=1").unwrap();
        assert!(url.query().unwrap().contains("access_token=one-shot"));
        assert!(url.query().unwrap().contains("x=1"));
    }

    #[tokio::test]
    async fn test_validate_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.mp4", b"").await;
        let err = validate_artifact(&path, None, None, 1).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidArtifact { .. }));
    }

    #[tokio::test]
    async fn test_validate_rejects_below_floor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.mp4", &[0u8; 16]).await;
        let err = validate_artifact(&path, None, None, 1024).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidArtifact { .. }));
    }

    #[tokio::test]
    async fn test_validate_rejects_html_error_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.mp4", &[0u8; 64]).await;
        let err = validate_artifact(&path, Some("text/html; charset=utf-8"), None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidArtifact { .. }));
    }

    #[tokio::test]
    async fn test_validate_rejects_wrong_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.bin", &[0u8; 64]).await;
        let err = validate_artifact(&path, Some("video/mp4"), None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidArtifact { .. }));
    }

    #[tokio::test]
    async fn test_validate_size_mismatch_is_warning_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "a.mp4", &[0u8; 64]).await;
        let len = validate_artifact(&path, Some("video/mp4"), Some(9999), 1)
            .await
            .unwrap();
        assert_eq!(len, 64);
    }
}
