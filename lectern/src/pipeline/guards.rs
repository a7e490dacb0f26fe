//! Per-process concurrency guards.
//!
//! All guards live on a single `PipelineContext` value threaded into the
//! coordinator at construction. State is process-local by design: a restart
//! forgets in-flight work and relies on the idempotency probes instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::{Error, Result};

/// Shared guard state for the pipeline.
pub struct PipelineContext {
    /// External meeting ids currently being processed.
    in_flight: Arc<DashSet<String>>,
    /// Per-path single-slot locks serializing local file access.
    file_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    /// Bounded concurrent uploads.
    upload_slots: Arc<Semaphore>,
    /// Manual-retry keys currently in progress.
    retry_keys: Arc<DashSet<String>>,
}

impl PipelineContext {
    pub fn new(max_concurrent_uploads: usize) -> Self {
        Self {
            in_flight: Arc::new(DashSet::new()),
            file_locks: DashMap::new(),
            upload_slots: Arc::new(Semaphore::new(max_concurrent_uploads)),
            retry_keys: Arc::new(DashSet::new()),
        }
    }

    /// Claim an external meeting id. Returns `None` when a pipeline for the
    /// same id is already running; the caller reports `in-flight` without
    /// side effects.
    pub fn try_begin_meeting(&self, external_meeting_id: &str) -> Option<KeyClaim> {
        KeyClaim::try_new(&self.in_flight, external_meeting_id)
    }

    pub fn is_meeting_in_flight(&self, external_meeting_id: &str) -> bool {
        self.in_flight.contains(external_meeting_id)
    }

    /// Single-slot mutex for a local path. Download and upload of the same
    /// file serialize through this lock.
    pub fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for an upload slot.
    pub async fn acquire_upload_slot(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.upload_slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("upload semaphore closed".into()))
    }

    /// Claim a manual-retry key. Returns `None` when the same target is
    /// already being retried; the caller reports `already-in-progress`.
    pub fn try_begin_retry(&self, key: &str) -> Option<KeyClaim> {
        KeyClaim::try_new(&self.retry_keys, key)
    }
}

/// RAII claim on a keyed set; releases on drop so every exit path,
/// including panics and early returns, frees the key.
pub struct KeyClaim {
    keys: Arc<DashSet<String>>,
    key: String,
}

impl KeyClaim {
    fn try_new(keys: &Arc<DashSet<String>>, key: &str) -> Option<Self> {
        if !keys.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            keys: Arc::clone(keys),
            key: key.to_string(),
        })
    }
}

impl Drop for KeyClaim {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_meeting_claim_denied() {
        let ctx = PipelineContext::new(3);

        let guard = ctx.try_begin_meeting("m-1");
        assert!(guard.is_some());
        assert!(ctx.try_begin_meeting("m-1").is_none());
        assert!(ctx.is_meeting_in_flight("m-1"));

        drop(guard);
        assert!(!ctx.is_meeting_in_flight("m-1"));
        assert!(ctx.try_begin_meeting("m-1").is_some());
    }

    #[test]
    fn test_distinct_meetings_run_in_parallel() {
        let ctx = PipelineContext::new(3);
        let a = ctx.try_begin_meeting("m-1");
        let b = ctx.try_begin_meeting("m-2");
        assert!(a.is_some() && b.is_some());
    }

    #[test]
    fn test_retry_guard_reports_in_progress() {
        let ctx = PipelineContext::new(3);
        let guard = ctx.try_begin_retry("recording:abc123");
        assert!(guard.is_some());
        assert!(ctx.try_begin_retry("recording:abc123").is_none());
        drop(guard);
        assert!(ctx.try_begin_retry("recording:abc123").is_some());
    }

    #[test]
    fn test_retry_and_meeting_keys_are_independent() {
        let ctx = PipelineContext::new(3);
        let _meeting = ctx.try_begin_meeting("94881330838").unwrap();
        assert!(ctx.try_begin_retry("94881330838").is_some());
    }

    #[test]
    fn test_path_lock_is_shared_per_path() {
        let ctx = PipelineContext::new(3);
        let a = ctx.path_lock(Path::new("downloads/a.mp4"));
        let b = ctx.path_lock(Path::new("downloads/a.mp4"));
        let c = ctx.path_lock(Path::new("downloads/c.mp4"));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_upload_slots_bounded() {
        let ctx = PipelineContext::new(2);

        let first = ctx.acquire_upload_slot().await.unwrap();
        let _second = ctx.acquire_upload_slot().await.unwrap();

        // Third acquisition must block until a permit is returned.
        let third = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            ctx.acquire_upload_slot(),
        )
        .await;
        assert!(third.is_err());

        drop(first);
        let third = ctx.acquire_upload_slot().await;
        assert!(third.is_ok());
    }
}
