//! Manual retry: selector resolution, mode determination, per-target
//! dispatch. Failures in one target never abort the batch.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clients::drive::StorageClient;
use crate::clients::provider::{ProviderClient, pick_best_mp4};
use crate::database::models::{MeetingDbModel, RecordingDbModel};
use crate::database::repositories::{MeetingRepository, RecordingRepository};
use crate::pipeline::coordinator::{IngestRequest, PipelineCoordinator, PipelineOutcome};
use crate::pipeline::reasons;
use crate::{Error, Result};

fn default_limit() -> i64 {
    5
}

/// Manual-retry request. Exactly one selector must be present.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryRequest {
    pub external_recording_id: Option<String>,
    pub internal_meeting_id: Option<String>,
    pub external_meeting_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,

    pub republish: bool,
    pub force_redownload: bool,
    /// Accepted for wire compatibility; carries no behavior distinct from
    /// `republish`.
    pub force_repost: bool,
    pub override_course_id: Option<i64>,
    pub dry_run: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl Default for RetryRequest {
    fn default() -> Self {
        Self {
            external_recording_id: None,
            internal_meeting_id: None,
            external_meeting_id: None,
            from: None,
            to: None,
            republish: false,
            force_redownload: false,
            force_repost: false,
            override_course_id: None,
            dry_run: false,
            limit: default_limit(),
        }
    }
}

/// Per-target retry result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResult {
    pub selector: String,
    pub mode: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_recording_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_meeting_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityInfo {
    pub remote_md5: Option<String>,
    pub remote_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    ExternalRecording(String),
    InternalMeeting(String),
    ExternalMeeting(String),
    Window { from: String, to: String },
}

impl Selector {
    fn describe(&self) -> String {
        match self {
            Self::ExternalRecording(id) => format!("externalRecordingId:{id}"),
            Self::InternalMeeting(id) => format!("internalMeetingId:{id}"),
            Self::ExternalMeeting(id) => format!("externalMeetingId:{id}"),
            Self::Window { from, to } => format!("window:{from}..{to}"),
        }
    }
}

/// One resolved retry target.
struct Target {
    selector: String,
    meeting: Option<MeetingDbModel>,
    recording: Option<RecordingDbModel>,
    external_meeting_id: Option<String>,
    topic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Republish,
    Full,
}

impl Mode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Republish => "republish",
            Self::Full => "full",
        }
    }
}

/// Manual retry engine.
pub struct RetryEngine {
    coordinator: Arc<PipelineCoordinator>,
    meetings: Arc<dyn MeetingRepository>,
    recordings: Arc<dyn RecordingRepository>,
    provider: Arc<ProviderClient>,
    storage: Arc<StorageClient>,
}

impl RetryEngine {
    pub fn new(
        coordinator: Arc<PipelineCoordinator>,
        meetings: Arc<dyn MeetingRepository>,
        recordings: Arc<dyn RecordingRepository>,
        provider: Arc<ProviderClient>,
        storage: Arc<StorageClient>,
    ) -> Self {
        Self {
            coordinator,
            meetings,
            recordings,
            provider,
            storage,
        }
    }

    /// Run a retry batch. Selector validation errors surface as `Err`;
    /// everything per-target lands inside the result records.
    pub async fn run(&self, req: &RetryRequest) -> Result<Vec<RetryResult>> {
        let selector = parse_selector(req)?;
        let targets = self.resolve_targets(&selector, req.limit).await?;

        info!(
            "retry: dispatching {} target(s) for {} (dry_run={})",
            targets.len(),
            selector.describe(),
            req.dry_run
        );

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.process_target(req, target).await);
        }
        Ok(results)
    }

    async fn resolve_targets(&self, selector: &Selector, limit: i64) -> Result<Vec<Target>> {
        let limit = limit.max(1);

        match selector {
            Selector::ExternalRecording(id) => {
                let recording = self.recordings.find_by_external_recording_id(id).await?;
                let meeting = match &recording {
                    Some(rec) => self.meetings.get_meeting(&rec.meeting_id).await.ok(),
                    None => None,
                };
                Ok(vec![Target {
                    selector: selector.describe(),
                    external_meeting_id: meeting
                        .as_ref()
                        .and_then(|m| m.external_meeting_id.clone()),
                    topic: meeting.as_ref().map(|m| m.topic.clone()),
                    meeting,
                    recording,
                }])
            }
            Selector::InternalMeeting(id) => {
                let meeting = self.meetings.get_meeting(id).await?;
                let recording = self
                    .recordings
                    .find_by_meeting_id(id)
                    .await?
                    .into_iter()
                    .next();
                Ok(vec![Target {
                    selector: selector.describe(),
                    external_meeting_id: meeting.external_meeting_id.clone(),
                    topic: Some(meeting.topic.clone()),
                    meeting: Some(meeting),
                    recording,
                }])
            }
            Selector::ExternalMeeting(id) => {
                let meeting = self.meetings.find_by_external_id(id).await?;
                let (topic, recording) = match &meeting {
                    Some(m) => (
                        Some(m.topic.clone()),
                        self.recordings
                            .find_by_meeting_id(&m.id)
                            .await?
                            .into_iter()
                            .next(),
                    ),
                    None => {
                        // Unknown meeting: the provider still knows the topic.
                        let listing = self.provider.meeting_recordings(id).await?;
                        (Some(listing.topic), None)
                    }
                };
                Ok(vec![Target {
                    selector: selector.describe(),
                    external_meeting_id: Some(id.clone()),
                    topic,
                    meeting,
                    recording,
                }])
            }
            Selector::Window { from, to } => {
                let recordings = self.recordings.list_created_between(from, to, limit).await?;
                let mut targets = Vec::with_capacity(recordings.len());
                for recording in recordings {
                    let meeting = self.meetings.get_meeting(&recording.meeting_id).await.ok();
                    targets.push(Target {
                        selector: selector.describe(),
                        external_meeting_id: meeting
                            .as_ref()
                            .and_then(|m| m.external_meeting_id.clone()),
                        topic: meeting.as_ref().map(|m| m.topic.clone()),
                        meeting,
                        recording: Some(recording),
                    });
                }
                Ok(targets)
            }
        }
    }

    async fn process_target(&self, req: &RetryRequest, target: Target) -> RetryResult {
        let mut result = RetryResult {
            selector: target.selector.clone(),
            mode: Mode::Full.as_str().to_string(),
            status: "failed".to_string(),
            reason: None,
            external_recording_id: target
                .recording
                .as_ref()
                .map(|r| r.external_recording_id.clone()),
            external_meeting_id: target.external_meeting_id.clone(),
            meeting_id: target.meeting.as_ref().map(|m| m.id.clone()),
            recording_id: target.recording.as_ref().map(|r| r.id.clone()),
            drive_url: None,
            integrity: None,
        };

        let retry_key = target
            .recording
            .as_ref()
            .map(|r| format!("recording:{}", r.external_recording_id))
            .or_else(|| {
                target
                    .external_meeting_id
                    .as_ref()
                    .map(|id| format!("meeting:{id}"))
            })
            .unwrap_or_else(|| format!("selector:{}", target.selector));

        let Some(_retry_guard) = self.coordinator.context().try_begin_retry(&retry_key) else {
            result.status = "skipped".into();
            result.reason = Some(reasons::ALREADY_IN_PROGRESS.into());
            return result;
        };

        let has_artifact = target
            .recording
            .as_ref()
            .and_then(|r| r.artifact_url.as_ref())
            .is_some();

        let mode = if req.force_redownload {
            Mode::Full
        } else if req.republish && has_artifact {
            Mode::Republish
        } else {
            Mode::Full
        };
        result.mode = mode.as_str().to_string();

        if req.dry_run {
            result.status = "skipped".into();
            result.reason = Some(reasons::DRY_RUN.into());
            return result;
        }

        let outcome = match mode {
            Mode::Republish => self.republish(req, &target, &mut result).await,
            Mode::Full => self.full(req, &target, &mut result).await,
        };

        if let Err(err) = outcome {
            warn!("retry: target {} failed: {}", target.selector, err);
            result.status = "failed".into();
            result.reason = Some(err.to_string());
        }

        result
    }

    /// Republish: post a fresh discussion over the already-stored artifact.
    async fn republish(
        &self,
        req: &RetryRequest,
        target: &Target,
        result: &mut RetryResult,
    ) -> Result<()> {
        let recording = target
            .recording
            .as_ref()
            .ok_or_else(|| Error::validation("republish target has no recording row"))?;
        let artifact_url = recording
            .artifact_url
            .as_ref()
            .ok_or_else(|| Error::validation("republish target has no artifact URL"))?;

        let topic = target
            .topic
            .clone()
            .unwrap_or_else(|| recording.external_recording_id.clone());

        let course_id = match self.republish_course(req, target, &topic).await? {
            Some(id) => id,
            None => {
                result.status = "skipped".into();
                result.reason = Some(reasons::NO_COURSE_RESOLVED.into());
                return Ok(());
            }
        };

        self.coordinator
            .publish_discussion(course_id, &topic, &recording.external_recording_id, artifact_url)
            .await?;

        let now = Utc::now().to_rfc3339();
        self.recordings.record_republish(&recording.id, &now).await?;

        result.status = "ok".into();
        result.reason = Some(reasons::REPUBLISHED.into());
        result.drive_url = Some(artifact_url.clone());
        Ok(())
    }

    async fn republish_course(
        &self,
        req: &RetryRequest,
        target: &Target,
        topic: &str,
    ) -> Result<Option<i64>> {
        if let Some(course_id) = req.override_course_id {
            return Ok(Some(course_id));
        }
        if let Some(course_id) = target.meeting.as_ref().and_then(|m| m.course_id) {
            return Ok(Some(course_id));
        }
        match self.coordinator.resolve_topic(topic).await {
            Ok(id) => Ok(Some(id)),
            Err(Error::NoCourseResolved(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Full mode: re-enumerate the provider's files and run the pipeline.
    async fn full(
        &self,
        req: &RetryRequest,
        target: &Target,
        result: &mut RetryResult,
    ) -> Result<()> {
        let external_meeting_id = target
            .external_meeting_id
            .clone()
            .ok_or_else(|| Error::validation("target has no external meeting id"))?;

        if !req.force_redownload
            && target.meeting.as_ref().is_some_and(|m| m.is_completed())
            && target
                .recording
                .as_ref()
                .and_then(|r| r.artifact_url.as_ref())
                .is_some()
        {
            result.status = "skipped".into();
            result.reason = Some(reasons::ALREADY_COMPLETED.into());
            return Ok(());
        }

        let Some(_meeting_guard) = self
            .coordinator
            .context()
            .try_begin_meeting(&external_meeting_id)
        else {
            result.status = "skipped".into();
            result.reason = Some(reasons::ALREADY_IN_PROGRESS.into());
            return Ok(());
        };

        let listing = self.provider.meeting_recordings(&external_meeting_id).await?;
        let Some(file) = pick_best_mp4(&listing.recording_files) else {
            result.status = "skipped".into();
            result.reason = Some(reasons::NO_DRIVE_URL_FOUND.into());
            return Ok(());
        };

        result.external_recording_id = Some(file.id.clone());

        let outcome = self
            .coordinator
            .ingest(IngestRequest {
                external_meeting_id: &external_meeting_id,
                topic: target.topic.as_deref().unwrap_or(&listing.topic),
                start_time: listing.start_time.as_deref(),
                file,
                download_token: None,
                override_course_id: req.override_course_id,
            })
            .await?;

        match outcome {
            PipelineOutcome::Done { drive_url } => {
                result.status = "ok".into();
                result.drive_url = Some(drive_url);
                result.integrity = self.probe_integrity(&file.id).await;
            }
            PipelineOutcome::InFlight => {
                result.status = "skipped".into();
                result.reason = Some(reasons::ALREADY_IN_PROGRESS.into());
            }
            PipelineOutcome::Ignored { reason } => {
                result.status = "skipped".into();
                result.reason = Some(reason);
            }
        }
        Ok(())
    }

    async fn probe_integrity(&self, external_recording_id: &str) -> Option<IntegrityInfo> {
        match self
            .storage
            .find_by_external_recording_id(external_recording_id)
            .await
        {
            Ok(Some(meta)) => Some(IntegrityInfo {
                remote_md5: meta.md5_checksum,
                remote_size: meta.size,
            }),
            _ => None,
        }
    }
}

fn parse_selector(req: &RetryRequest) -> Result<Selector> {
    let mut selectors = Vec::new();

    if let Some(id) = &req.external_recording_id {
        selectors.push(Selector::ExternalRecording(id.clone()));
    }
    if let Some(id) = &req.internal_meeting_id {
        selectors.push(Selector::InternalMeeting(id.clone()));
    }
    if let Some(id) = &req.external_meeting_id {
        selectors.push(Selector::ExternalMeeting(id.clone()));
    }
    match (&req.from, &req.to) {
        (Some(from), Some(to)) => selectors.push(Selector::Window {
            from: from.clone(),
            to: to.clone(),
        }),
        (None, None) => {}
        _ => {
            return Err(Error::validation(
                "window selector requires both 'from' and 'to'",
            ));
        }
    }

    match selectors.len() {
        1 => Ok(selectors.remove(0)),
        0 => Err(Error::validation("exactly one selector is required, none given")),
        n => Err(Error::validation(format!(
            "exactly one selector is required, {n} given"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_requires_exactly_one() {
        let empty = RetryRequest::default();
        assert!(parse_selector(&empty).is_err());

        let single = RetryRequest {
            external_recording_id: Some("abc123".into()),
            ..Default::default()
        };
        assert!(matches!(
            parse_selector(&single).unwrap(),
            Selector::ExternalRecording(_)
        ));

        let double = RetryRequest {
            external_recording_id: Some("abc123".into()),
            external_meeting_id: Some("94881330838".into()),
            ..Default::default()
        };
        assert!(parse_selector(&double).is_err());
    }

    #[test]
    fn test_window_selector_requires_both_bounds() {
        let half = RetryRequest {
            from: Some("2025-08-18T00:00:00Z".into()),
            ..Default::default()
        };
        assert!(parse_selector(&half).is_err());

        let full = RetryRequest {
            from: Some("2025-08-18T00:00:00Z".into()),
            to: Some("2025-08-18T23:59:59Z".into()),
            ..Default::default()
        };
        assert!(matches!(parse_selector(&full).unwrap(), Selector::Window { .. }));
    }

    #[test]
    fn test_request_defaults() {
        let req: RetryRequest = serde_json::from_str(r#"{"externalRecordingId":"abc123"}"#).unwrap();
        assert_eq!(req.limit, 5);
        assert!(!req.republish);
        assert!(!req.dry_run);
    }

    #[test]
    fn test_request_accepts_flags() {
        let req: RetryRequest = serde_json::from_str(
            r#"{"externalRecordingId":"abc123","republish":true,"dryRun":true,"forceRepost":true}"#,
        )
        .unwrap();
        assert!(req.republish);
        assert!(req.dry_run);
        assert!(req.force_repost);
    }
}
