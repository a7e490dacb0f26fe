//! porter: a resumable HTTP transfer engine.
//!
//! Provides the three building blocks long-running media pipelines need:
//! range-resume downloads with HEAD warmup and artifact validation
//! ([`Downloader`]), chunked resumable-session uploads with 308-driven
//! offset tracking ([`ChunkedUploader`]), and a bounded, jittered
//! exponential-backoff retry driver ([`retry_with_policy`]).

pub mod client;
pub mod download;
pub mod error;
pub mod retry;
pub mod upload;

pub use client::{ClientOptions, build_client};
pub use download::{BearerTokenSource, DownloadOutcome, DownloadRequest, Downloader};
pub use error::TransferError;
pub use retry::{RetryPolicy, retry_with_policy};
pub use upload::{ChunkedUploader, UploadComplete, UploadSession, file_md5};
