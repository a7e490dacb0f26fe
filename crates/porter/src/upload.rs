//! Chunked resumable-session upload with 308-driven offset tracking.

use std::path::Path;

use md5::{Digest, Md5};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::retry::{RetryPolicy, retry_with_policy};

/// Consecutive 308 responses without a `Range` header tolerated before the
/// session is declared stuck.
const MAX_BARE_308: u32 = 5;

/// An open resumable-upload session, identified by the URL the store handed
/// back in its `Location` header.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub session_url: String,
}

/// Result of a finished upload: the store's final metadata response body and
/// the byte count pushed through the session.
#[derive(Debug, Clone)]
pub struct UploadComplete {
    pub body: String,
    pub bytes_sent: u64,
}

enum ChunkOutcome {
    Complete { body: String },
    /// 308 received; `committed` is the last byte the server acknowledged,
    /// absent when the response carried no `Range` header.
    Resume { committed: Option<u64> },
}

/// Chunked uploader for resumable sessions.
pub struct ChunkedUploader {
    client: Client,
    policy: RetryPolicy,
    chunk_size: u64,
}

impl ChunkedUploader {
    pub fn new(client: Client, policy: RetryPolicy, chunk_size: u64) -> Self {
        Self {
            client,
            policy,
            chunk_size,
        }
    }

    /// Stream `path` through `session` in `Content-Range` chunks.
    ///
    /// Every PUT attempt re-opens the file and seeks to the chunk offset: a
    /// byte stream consumed by a failed attempt would otherwise send zero
    /// bytes on the retry.
    pub async fn upload(
        &self,
        session: &UploadSession,
        path: &Path,
    ) -> Result<UploadComplete, TransferError> {
        let total = tokio::fs::metadata(path).await?.len();
        if total == 0 {
            return Err(TransferError::invalid_artifact("refusing to upload empty file"));
        }

        let mut offset: u64 = 0;
        let mut bare_308: u32 = 0;

        while offset < total {
            let end = (offset + self.chunk_size).min(total) - 1;

            let outcome = retry_with_policy(&self.policy, |_attempt| {
                self.put_chunk(session, path, offset, end, total)
            })
            .await?;

            match outcome {
                ChunkOutcome::Complete { body } => {
                    info!("upload: session complete after {} bytes", total);
                    return Ok(UploadComplete {
                        body,
                        bytes_sent: total,
                    });
                }
                ChunkOutcome::Resume {
                    committed: Some(last),
                } => {
                    bare_308 = 0;
                    offset = last + 1;
                    debug!("upload: server committed through byte {}, advancing", last);
                }
                ChunkOutcome::Resume { committed: None } => {
                    bare_308 += 1;
                    warn!(
                        "upload: 308 without Range header ({}/{}), resending chunk at {}",
                        bare_308, MAX_BARE_308, offset
                    );
                    if bare_308 >= MAX_BARE_308 {
                        return Err(TransferError::Stuck308 { attempts: bare_308 });
                    }
                }
            }
        }

        // All bytes acknowledged but the server never finalized the file.
        Err(TransferError::SessionRejected {
            reason: "server acknowledged all bytes without completing the session".into(),
        })
    }

    async fn put_chunk(
        &self,
        session: &UploadSession,
        path: &Path,
        offset: u64,
        end: u64,
        total: u64,
    ) -> Result<ChunkOutcome, TransferError> {
        let len = end - offset + 1;

        // Fresh reader per attempt.
        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let stream = ReaderStream::new(file.take(len));

        let response = self
            .client
            .put(&session.session_url)
            .header(CONTENT_LENGTH, len)
            .header(CONTENT_RANGE, format!("bytes {offset}-{end}/{total}"))
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;

        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            return Ok(ChunkOutcome::Complete { body });
        }

        if status == StatusCode::PERMANENT_REDIRECT {
            let committed = response
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_committed_range);
            return Ok(ChunkOutcome::Resume { committed });
        }

        Err(TransferError::http_status(
            status,
            session.session_url.clone(),
            "upload",
        ))
    }
}

/// Parse the last committed byte out of a `Range: bytes=0-K` header.
fn parse_committed_range(header: &str) -> Option<u64> {
    let (_, span) = header.trim().split_once('=')?;
    let (_, last) = span.split_once('-')?;
    last.trim().parse().ok()
}

/// Streaming MD5 digest of a file, hex-encoded.
pub async fn file_md5(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_committed_range() {
        assert_eq!(parse_committed_range("bytes=0-33554431"), Some(33_554_431));
        assert_eq!(parse_committed_range("bytes=0-0"), Some(0));
        assert_eq!(parse_committed_range("bytes=0-"), None);
        assert_eq!(parse_committed_range("garbage"), None);
    }

    #[test]
    fn test_chunk_end_math() {
        // 100-byte file in 32-byte chunks: 0-31, 32-63, 64-95, 96-99.
        let total: u64 = 100;
        let chunk: u64 = 32;
        let mut offset = 0;
        let mut spans = Vec::new();
        while offset < total {
            let end = (offset + chunk).min(total) - 1;
            spans.push((offset, end));
            offset = end + 1;
        }
        assert_eq!(spans, vec![(0, 31), (32, 63), (64, 95), (96, 99)]);
    }

    #[tokio::test]
    async fn test_file_md5_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let digest = file_md5(&path).await.unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn test_upload_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mp4");
        tokio::fs::write(&path, b"").await.unwrap();

        let uploader = ChunkedUploader::new(
            reqwest::Client::new(),
            RetryPolicy::new("upload").with_max_attempts(1),
            32,
        );
        let session = UploadSession {
            session_url: "http://127.0.0.1:9/none".into(),
        };

        let err = uploader.upload(&session, &path).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidArtifact { .. }));
    }
}
