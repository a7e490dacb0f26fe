//! Long-term object store client.
//!
//! Owns the store-specific protocol around `porter`'s chunked uploader:
//! resumable-session initiation, tag-based idempotency probes, metadata
//! verification, folder management, permission grants, and preview probing.

use std::path::Path;
use std::time::Duration;

use porter::{ChunkedUploader, RetryPolicy, TransferError, UploadSession, retry_with_policy};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::{Error, Result};

/// Permission grants retry independently of the upload itself.
const PERMISSION_MAX_ATTEMPTS: u32 = 5;
const PERMISSION_INITIAL_DELAY_MS: u64 = 1_000;
const PERMISSION_MAX_DELAY_MS: u64 = 30_000;

/// Best-effort preview wait bounds.
const PREVIEW_WAIT_MAX: Duration = Duration::from_secs(120);
const PREVIEW_WAIT_INTERVAL: Duration = Duration::from_secs(10);

/// Post-upload size disagreement tolerated between local and remote, bytes.
const SIZE_TOLERANCE_BYTES: i64 = 1024;

/// Application-level tags attached to every stored artifact.
#[derive(Debug, Clone)]
pub struct ArtifactTags {
    pub meeting_id: String,
    pub course_id: i64,
    pub external_recording_id: String,
}

/// A stored artifact, addressed by file id and human-visible viewing URL.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub file_id: String,
    pub view_url: String,
    pub remote_md5: Option<String>,
    pub remote_size: Option<i64>,
}

/// File metadata as reported by the store.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub name: Option<String>,
    pub md5_checksum: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub size: Option<i64>,
    #[serde(default)]
    pub has_thumbnail: bool,
    pub web_view_link: Option<String>,
    pub processing_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileMetadata>,
}

/// Object store client.
pub struct StorageClient {
    client: Client,
    api_base: String,
    upload_base: String,
    token: String,
    root_folder_id: String,
    uploader: ChunkedUploader,
    session_policy: RetryPolicy,
}

impl StorageClient {
    pub fn new(client: Client, transfer_client: Client, settings: &Settings) -> Self {
        let chunk_policy = RetryPolicy::new("upload")
            .with_max_attempts(settings.max_retries_upload)
            .with_delays(settings.initial_backoff_ms, settings.max_backoff_ms);
        let session_policy = RetryPolicy::new("upload-session")
            .with_max_attempts(settings.max_retries_upload)
            .with_delays(settings.initial_backoff_ms, settings.max_backoff_ms);

        Self {
            client,
            api_base: settings.storage_api_base.trim_end_matches('/').to_string(),
            upload_base: settings.storage_upload_base.trim_end_matches('/').to_string(),
            token: settings.storage_token.clone(),
            root_folder_id: settings.storage_root_folder_id.clone(),
            uploader: ChunkedUploader::new(
                transfer_client,
                chunk_policy,
                settings.chunk_size_bytes(),
            ),
            session_policy,
        }
    }

    pub fn root_folder_id(&self) -> &str {
        &self.root_folder_id
    }

    /// Look up a previously stored artifact by its external recording tag.
    /// This probe enforces the one-artifact-per-recording invariant: callers
    /// short-circuit to the existing view URL instead of re-uploading.
    pub async fn find_by_external_recording_id(
        &self,
        external_recording_id: &str,
    ) -> Result<Option<FileMetadata>> {
        let query = format!(
            "appProperties has {{ key='externalRecordingId' and value='{}' }} and trashed=false",
            external_recording_id.replace('\'', "")
        );
        let url = format!(
            "{}/files?q={}&fields=files(id,name,md5Checksum,size,hasThumbnail,webViewLink,processingStatus)",
            self.api_base,
            urlencode(&query)
        );

        let list: FileList = self.get_json(&url).await?;
        Ok(list.files.into_iter().next())
    }

    /// Fetch metadata for a stored file.
    pub async fn file_metadata(&self, file_id: &str) -> Result<FileMetadata> {
        let url = format!(
            "{}/files/{}?fields=id,name,md5Checksum,size,hasThumbnail,webViewLink,processingStatus",
            self.api_base, file_id
        );
        self.get_json(&url).await
    }

    /// Find or create a folder named `name` under `parent_id`.
    pub async fn ensure_folder(&self, name: &str, parent_id: &str) -> Result<String> {
        let query = format!(
            "name='{}' and '{}' in parents and mimeType='application/vnd.apps.folder' and trashed=false",
            name.replace('\'', ""),
            parent_id
        );
        let url = format!("{}/files?q={}&fields=files(id,name)", self.api_base, urlencode(&query));

        let list: FileList = self.get_json(&url).await?;
        if let Some(existing) = list.files.into_iter().next() {
            return Ok(existing.id);
        }

        debug!("drive: creating folder '{}' under {}", name, parent_id);
        let response = self
            .client
            .post(format!("{}/files", self.api_base))
            .bearer_auth(&self.token)
            .json(&json!({
                "name": name,
                "parents": [parent_id],
                "mimeType": "application/vnd.apps.folder",
            }))
            .send()
            .await?;

        let response = expect_success(response, "folder creation").await?;
        let created: FileMetadata = response.json().await?;
        Ok(created.id)
    }

    /// Upload a local file into `folder_id` with verification.
    ///
    /// Probes the tag first and short-circuits to any existing artifact.
    /// Otherwise runs the session-level retry loop: each attempt opens a
    /// fresh resumable session, streams the chunks, then verifies the
    /// store's metadata against the local digest and size. Permission
    /// grants happen after verification and are non-fatal.
    pub async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        folder_id: &str,
        tags: &ArtifactTags,
    ) -> Result<StoredArtifact> {
        if let Some(existing) = self
            .find_by_external_recording_id(&tags.external_recording_id)
            .await?
        {
            if let Some(view_url) = existing.web_view_link.clone() {
                info!(
                    "drive: artifact already stored for recording {}, reusing {}",
                    tags.external_recording_id, existing.id
                );
                return Ok(StoredArtifact {
                    file_id: existing.id,
                    view_url,
                    remote_md5: existing.md5_checksum,
                    remote_size: existing.size,
                });
            }
        }

        let local_md5 = porter::file_md5(local_path).await?;
        let local_size = tokio::fs::metadata(local_path).await?.len() as i64;

        let artifact = retry_with_policy(&self.session_policy, |_attempt| {
            let local_md5 = local_md5.clone();
            async move {
                let session = self.initiate_session(name, folder_id, tags).await?;
                let complete = self.uploader.upload(&session, local_path).await?;
                let uploaded: FileMetadata =
                    serde_json::from_str(&complete.body).map_err(|e| {
                        TransferError::SessionRejected {
                            reason: format!("unparseable completion body: {e}"),
                        }
                    })?;

                let meta = self
                    .file_metadata(&uploaded.id)
                    .await
                    .map_err(|e| TransferError::not_ready(format!("metadata probe failed: {e}")))?;

                verify_integrity(&meta, &local_md5, local_size)?;

                let view_url = meta
                    .web_view_link
                    .clone()
                    .ok_or_else(|| TransferError::SessionRejected {
                        reason: "store returned no view URL".into(),
                    })?;

                Ok(StoredArtifact {
                    file_id: meta.id,
                    view_url,
                    remote_md5: meta.md5_checksum,
                    remote_size: meta.size,
                })
            }
        })
        .await?;

        self.grant_public_reader(&artifact.file_id).await;

        Ok(artifact)
    }

    async fn initiate_session(
        &self,
        name: &str,
        folder_id: &str,
        tags: &ArtifactTags,
    ) -> std::result::Result<UploadSession, TransferError> {
        let response = self
            .client
            .post(format!("{}/files?uploadType=resumable", self.upload_base))
            .bearer_auth(&self.token)
            .json(&json!({
                "name": name,
                "parents": [folder_id],
                "appProperties": {
                    "meetingId": tags.meeting_id,
                    "courseId": tags.course_id.to_string(),
                    "externalRecordingId": tags.external_recording_id,
                },
                "copyRequiresWriterPermission": true,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::http_status(
                status,
                format!("{}/files", self.upload_base),
                "upload-initiate",
            ));
        }

        let session_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| TransferError::SessionRejected {
                reason: "initiation response carried no Location header".into(),
            })?;

        Ok(UploadSession { session_url })
    }

    /// Grant anyone-with-link read access. Retries independently and never
    /// fails the pipeline: an unpublishable permission is an operator
    /// problem, not a lost artifact.
    async fn grant_public_reader(&self, file_id: &str) {
        let policy = RetryPolicy::new("drive-permission")
            .with_max_attempts(PERMISSION_MAX_ATTEMPTS)
            .with_delays(PERMISSION_INITIAL_DELAY_MS, PERMISSION_MAX_DELAY_MS);

        let result = retry_with_policy(&policy, |_attempt| async move {
            let response = self
                .client
                .post(format!("{}/files/{}/permissions", self.api_base, file_id))
                .bearer_auth(&self.token)
                .json(&json!({"role": "reader", "type": "anyone"}))
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(TransferError::http_status(
                    status,
                    format!("{}/files/{}/permissions", self.api_base, file_id),
                    "permission-grant",
                ))
            }
        })
        .await;

        if let Err(err) = result {
            warn!("drive: permission grant failed for {}: {}", file_id, err);
        }
    }

    /// Poll metadata until the store has generated a preview, bounded by
    /// `PREVIEW_WAIT_MAX`. Best effort: the pipeline never fails because a
    /// thumbnail is late.
    pub async fn wait_for_preview(&self, file_id: &str) {
        let deadline = tokio::time::Instant::now() + PREVIEW_WAIT_MAX;

        loop {
            match self.file_metadata(file_id).await {
                Ok(meta) if meta.has_thumbnail || meta.processing_status.as_deref() == Some("ready") => {
                    debug!("drive: preview ready for {}", file_id);
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!("drive: preview probe failed for {}: {}", file_id, err);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!("drive: preview not ready for {} within wait budget", file_id);
                return;
            }
            tokio::time::sleep(PREVIEW_WAIT_INTERVAL).await;
        }
    }

    /// Passive HEAD against a preview URL, used by the wakeup job to nudge
    /// the store's preview generation.
    pub async fn preview_head(&self, preview_url: &str) -> Result<StatusCode> {
        let response = self.client.head(preview_url).send().await?;
        Ok(response.status())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::storage(format!("GET {url} returned {status}")));
        }
        Ok(response.json().await?)
    }
}

fn verify_integrity(
    meta: &FileMetadata,
    local_md5: &str,
    local_size: i64,
) -> std::result::Result<(), TransferError> {
    let remote_md5 = meta
        .md5_checksum
        .as_deref()
        .ok_or(TransferError::IntegrityMismatch {
            field: "md5",
            expected: local_md5.to_string(),
            actual: "absent (probable incomplete upload)".to_string(),
        })?;

    if !remote_md5.eq_ignore_ascii_case(local_md5) {
        return Err(TransferError::IntegrityMismatch {
            field: "md5",
            expected: local_md5.to_string(),
            actual: remote_md5.to_string(),
        });
    }

    let remote_size = meta.size.ok_or(TransferError::IntegrityMismatch {
        field: "size",
        expected: local_size.to_string(),
        actual: "absent".to_string(),
    })?;

    if (remote_size - local_size).abs() > SIZE_TOLERANCE_BYTES {
        return Err(TransferError::IntegrityMismatch {
            field: "size",
            expected: local_size.to_string(),
            actual: remote_size.to_string(),
        });
    }

    Ok(())
}

async fn expect_success(
    response: reqwest::Response,
    operation: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::storage(format!("{operation} returned {status}")))
    }
}

/// The store reports sizes as either a JSON number or a numeric string.
fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Numberish {
        Number(i64),
        String(String),
    }

    Ok(match Option::<Numberish>::deserialize(deserializer)? {
        Some(Numberish::Number(n)) => Some(n),
        Some(Numberish::String(s)) => s.parse().ok(),
        None => None,
    })
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(md5: Option<&str>, size: Option<i64>) -> FileMetadata {
        FileMetadata {
            id: "f1".into(),
            name: Some("a.mp4".into()),
            md5_checksum: md5.map(str::to_owned),
            size,
            has_thumbnail: false,
            web_view_link: Some("https://store.test/file/d/f1/view".into()),
            processing_status: None,
        }
    }

    #[test]
    fn test_verify_integrity_accepts_match_within_tolerance() {
        let m = meta(Some("abc"), Some(1_000_500));
        assert!(verify_integrity(&m, "abc", 1_000_000).is_ok());

        let m = meta(Some("abc"), Some(1_000_000 + 1024));
        assert!(verify_integrity(&m, "abc", 1_000_000).is_ok());

        let m = meta(Some("abc"), Some(1_002_000));
        assert!(verify_integrity(&m, "abc", 1_000_000).is_err());
    }

    #[test]
    fn test_verify_integrity_rejects_missing_md5() {
        let m = meta(None, Some(100));
        let err = verify_integrity(&m, "abc", 100).unwrap_err();
        assert!(matches!(err, TransferError::IntegrityMismatch { field: "md5", .. }));
    }

    #[test]
    fn test_verify_integrity_rejects_md5_mismatch() {
        let m = meta(Some("other"), Some(100));
        let err = verify_integrity(&m, "abc", 100).unwrap_err();
        assert!(matches!(err, TransferError::IntegrityMismatch { field: "md5", .. }));
    }

    #[test]
    fn test_metadata_parses_string_size() {
        let m: FileMetadata = serde_json::from_value(serde_json::json!({
            "id": "f1",
            "md5Checksum": "abc",
            "size": "52428800",
            "hasThumbnail": true,
            "webViewLink": "https://store.test/file/d/f1/view"
        }))
        .unwrap();
        assert_eq!(m.size, Some(52_428_800));
        assert!(m.has_thumbnail);
    }

    #[test]
    fn test_urlencode_escapes_query() {
        assert_eq!(urlencode("a b'c"), "a%20b%27c");
        assert_eq!(urlencode("safe-._~"), "safe-._~");
    }
}
