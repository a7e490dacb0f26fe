//! Preview wakeup job.
//!
//! Some stored artifacts stall in the store's preview generation. Once a
//! day this job re-probes yesterday's recordings whose downstream
//! processing never finished, issuing a passive preview fetch to nudge it.
//! Probes per recording are bounded to two attempts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{Days, Local, NaiveDate, Timelike, Utc};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::clients::drive::StorageClient;
use crate::database::models::RecordingDbModel;
use crate::database::repositories::RecordingRepository;
use crate::publish;

/// Attempt ceiling per recording.
const MAX_WAKEUP_ATTEMPTS: i64 = 2;

/// Spacing before a recording may be probed again.
const REARM_SPACING_MINUTES: i64 = 90;

/// Configuration for the wakeup job.
#[derive(Debug, Clone)]
pub struct WakeupConfig {
    /// Local hour of day the job fires at.
    pub hour: u32,
}

impl Default for WakeupConfig {
    fn default() -> Self {
        Self { hour: 2 }
    }
}

/// Scheduled preview wakeup job.
pub struct WakeupJob {
    recordings: Arc<dyn RecordingRepository>,
    storage: Arc<StorageClient>,
    config: WakeupConfig,
    running: Arc<AtomicBool>,
    last_run_day: Mutex<Option<NaiveDate>>,
}

impl WakeupJob {
    pub fn new(
        recordings: Arc<dyn RecordingRepository>,
        storage: Arc<StorageClient>,
        config: WakeupConfig,
    ) -> Self {
        Self {
            recordings,
            storage,
            config,
            running: Arc::new(AtomicBool::new(false)),
            last_run_day: Mutex::new(None),
        }
    }

    /// Start the scheduler loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let job = self.clone();
        tokio::spawn(async move {
            job.running.store(true, Ordering::SeqCst);
            job.run_loop().await;
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            let now = Local::now();
            let today = now.date_naive();
            let due = now.hour() == self.config.hour
                && *self.last_run_day.lock() != Some(today);

            if due {
                *self.last_run_day.lock() = Some(today);
                if let Err(err) = self.run_once().await {
                    warn!("wakeup: run failed: {}", err);
                }
            }
        }
    }

    /// One full wakeup pass over yesterday's stalled recordings.
    pub async fn run_once(&self) -> crate::Result<()> {
        let (window_start, window_end) = previous_day_window();
        let rearm_cutoff = (Utc::now() - chrono::Duration::minutes(REARM_SPACING_MINUTES)).to_rfc3339();

        let candidates = self
            .recordings
            .list_wakeup_candidates(&window_start, &window_end, &rearm_cutoff)
            .await?;

        info!("wakeup: probing {} stalled recording(s)", candidates.len());

        for recording in candidates {
            self.probe(&recording).await;
        }

        Ok(())
    }

    async fn probe(&self, recording: &RecordingDbModel) {
        let now = Utc::now().to_rfc3339();

        let Some(artifact_url) = recording.artifact_url.as_deref() else {
            return;
        };

        let Some(artifact_id) = extract_artifact_id(artifact_url) else {
            warn!("wakeup: unrecognized artifact URL for recording {}", recording.id);
            let _ = self
                .recordings
                .update_wakeup(&recording.id, recording.wakeup_attempts + 1, &now)
                .await;
            return;
        };

        match self.storage.file_metadata(&artifact_id).await {
            Ok(meta) => {
                // A thumbnail with stalled processing will not recover from
                // more probes; stop spending attempts on it.
                if meta.has_thumbnail && meta.processing_status.as_deref() != Some("ready") {
                    debug!("wakeup: {} has thumbnail but is not ready, giving up", artifact_id);
                    let _ = self
                        .recordings
                        .update_wakeup(&recording.id, MAX_WAKEUP_ATTEMPTS, &now)
                        .await;
                    return;
                }

                let preview = publish::preview_url(artifact_url);
                match self.storage.preview_head(&preview).await {
                    Ok(status) => debug!("wakeup: preview HEAD for {} returned {}", artifact_id, status),
                    Err(err) => debug!("wakeup: preview HEAD for {} failed: {}", artifact_id, err),
                }

                // Re-fetch so the store registers interest; outcome is
                // informational only.
                if let Ok(meta) = self.storage.file_metadata(&artifact_id).await {
                    debug!(
                        "wakeup: {} thumbnail={} status={:?}",
                        artifact_id, meta.has_thumbnail, meta.processing_status
                    );
                }
            }
            Err(err) => {
                warn!("wakeup: metadata fetch failed for {}: {}", artifact_id, err);
            }
        }

        let attempts = (recording.wakeup_attempts + 1).min(MAX_WAKEUP_ATTEMPTS);
        if let Err(err) = self.recordings.update_wakeup(&recording.id, attempts, &now).await {
            warn!("wakeup: could not persist probe for {}: {}", recording.id, err);
        }
    }
}

/// UTC bounds of the previous calendar day, RFC 3339.
fn previous_day_window() -> (String, String) {
    let yesterday = Utc::now()
        .date_naive()
        .checked_sub_days(Days::new(1))
        .expect("date arithmetic");

    let start = yesterday.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
    let end = yesterday.and_hms_opt(23, 59, 59).expect("day end").and_utc();
    (start.to_rfc3339(), end.to_rfc3339())
}

/// Extract the artifact id out of a stored viewing URL, matching either the
/// `/file/d/<id>` path form or the `?id=<id>` query form.
fn extract_artifact_id(url: &str) -> Option<String> {
    static PATH_FORM: OnceLock<Regex> = OnceLock::new();
    static QUERY_FORM: OnceLock<Regex> = OnceLock::new();

    let path_form = PATH_FORM.get_or_init(|| Regex::new(r"/file/d/([A-Za-z0-9_-]+)").expect("path regex"));
    let query_form =
        QUERY_FORM.get_or_init(|| Regex::new(r"[?&]id=([A-Za-z0-9_-]+)").expect("query regex"));

    path_form
        .captures(url)
        .or_else(|| query_form.captures(url))
        .map(|captures| captures[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_artifact_id_path_form() {
        assert_eq!(
            extract_artifact_id("https://store.test/file/d/aB3_x-9/view").as_deref(),
            Some("aB3_x-9")
        );
    }

    #[test]
    fn test_extract_artifact_id_query_form() {
        assert_eq!(
            extract_artifact_id("https://store.test/open?id=aB3x9&usp=sharing").as_deref(),
            Some("aB3x9")
        );
    }

    #[test]
    fn test_extract_artifact_id_prefers_path_form() {
        assert_eq!(
            extract_artifact_id("https://store.test/file/d/path-id/view?id=query-id").as_deref(),
            Some("path-id")
        );
    }

    #[test]
    fn test_extract_artifact_id_rejects_unknown_shapes() {
        assert!(extract_artifact_id("https://store.test/folder/abc").is_none());
    }

    #[test]
    fn test_previous_day_window_bounds() {
        let (start, end) = previous_day_window();
        assert!(start < end);
        assert!(start.contains("T00:00:00"));
        assert!(end.contains("T23:59:59"));
    }
}
