//! Pipeline coordinator: idempotency checks, state transitions, and
//! external-service orchestration for completed recordings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use porter::{DownloadRequest, Downloader};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clients::drive::{ArtifactTags, StorageClient};
use crate::clients::lms::LmsClient;
use crate::clients::provider::{RecordingFile, WebhookEnvelope, pick_best_mp4};
use crate::config::Settings;
use crate::database::models::{MeetingDbModel, RecordingDbModel};
use crate::database::repositories::{LicenseRepository, MeetingRepository, RecordingRepository};
use crate::pipeline::guards::PipelineContext;
use crate::pipeline::reasons;
use crate::publish;
use crate::resolver::CourseResolver;
use crate::utils::filename::artifact_file_name;
use crate::{Error, Result};

/// Logical outcome of an admission, carried in the webhook response body.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PipelineOutcome {
    Done {
        #[serde(rename = "driveUrl")]
        drive_url: String,
    },
    InFlight,
    Ignored {
        reason: String,
    },
}

/// Parameters for one ingestion run, shared by the webhook path, manual
/// retry in full mode, and the backfill sync.
pub struct IngestRequest<'a> {
    pub external_meeting_id: &'a str,
    pub topic: &'a str,
    pub start_time: Option<&'a str>,
    pub file: &'a RecordingFile,
    pub download_token: Option<&'a str>,
    pub override_course_id: Option<i64>,
}

/// Pipeline coordinator.
pub struct PipelineCoordinator {
    settings: Settings,
    ctx: Arc<PipelineContext>,
    meetings: Arc<dyn MeetingRepository>,
    recordings: Arc<dyn RecordingRepository>,
    licenses: Arc<dyn LicenseRepository>,
    storage: Arc<StorageClient>,
    lms: Arc<LmsClient>,
    resolver: Arc<CourseResolver>,
    downloader: Downloader,
}

impl PipelineCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        ctx: Arc<PipelineContext>,
        meetings: Arc<dyn MeetingRepository>,
        recordings: Arc<dyn RecordingRepository>,
        licenses: Arc<dyn LicenseRepository>,
        storage: Arc<StorageClient>,
        lms: Arc<LmsClient>,
        resolver: Arc<CourseResolver>,
        downloader: Downloader,
    ) -> Self {
        Self {
            settings,
            ctx,
            meetings,
            recordings,
            licenses,
            storage,
            lms,
            resolver,
            downloader,
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Entry point for `recording.completed` webhooks.
    pub async fn process_completed_recording(
        &self,
        envelope: &WebhookEnvelope,
    ) -> Result<PipelineOutcome> {
        let Some(object) = envelope.payload.object.as_ref() else {
            return Ok(PipelineOutcome::Ignored {
                reason: "missing-recording-object".into(),
            });
        };

        let Some(_guard) = self.ctx.try_begin_meeting(&object.id) else {
            info!("pipeline: meeting {} already in flight, skipping duplicate webhook", object.id);
            return Ok(PipelineOutcome::InFlight);
        };

        let Some(file) = pick_best_mp4(&object.recording_files) else {
            warn!("pipeline: no completed MP4 in webhook for meeting {}", object.id);
            return Ok(PipelineOutcome::Ignored {
                reason: "no-recording-file".into(),
            });
        };

        self.ingest(IngestRequest {
            external_meeting_id: &object.id,
            topic: &object.topic,
            start_time: object.start_time.as_deref(),
            file,
            download_token: envelope.download_token.as_deref(),
            override_course_id: None,
        })
        .await
    }

    /// Run the idempotency checks and, when the recording is genuinely new,
    /// the full download-upload-publish pipeline.
    ///
    /// The caller must already hold the in-flight claim for the meeting.
    pub async fn ingest(&self, req: IngestRequest<'_>) -> Result<PipelineOutcome> {
        let meeting = self.ensure_meeting(&req).await?;
        let meeting = match meeting {
            Some(m) => m,
            None => {
                return Ok(PipelineOutcome::Ignored {
                    reason: reasons::NO_COURSE_RESOLVED.into(),
                });
            }
        };

        // Idempotent re-entry: a Recording row means the artifact already
        // made it through; only the trailing state may need repair.
        if let Some(existing) = self
            .recordings
            .find_by_external_recording_id(&req.file.id)
            .await?
        {
            debug!("pipeline: recording {} already persisted", req.file.id);
            self.complete_meeting(&meeting).await?;
            return Ok(PipelineOutcome::Done {
                drive_url: existing.artifact_url.unwrap_or_default(),
            });
        }

        // The store may hold the artifact from a run that crashed before the
        // row insert. Adopt it instead of re-uploading.
        if let Some(stored) = self
            .storage
            .find_by_external_recording_id(&req.file.id)
            .await?
        {
            if let Some(view_url) = stored.web_view_link {
                info!("drive: adopting existing artifact {} for recording {}", stored.id, req.file.id);
                let recording = RecordingDbModel::new(&meeting.id, &req.file.id, &view_url);
                self.recordings.create_recording(&recording).await?;
                self.complete_meeting(&meeting).await?;
                return Ok(PipelineOutcome::Done { drive_url: view_url });
            }
        }

        self.execute_pipeline(&meeting, &req).await
    }

    /// Find or synthesize the Meeting row, resolving its course binding.
    /// Returns `None` when no course can be resolved.
    async fn ensure_meeting(&self, req: &IngestRequest<'_>) -> Result<Option<MeetingDbModel>> {
        if let Some(mut meeting) = self
            .meetings
            .find_by_external_id(req.external_meeting_id)
            .await?
        {
            if meeting.course_id.is_none() {
                let course_id = match self.resolve_course(req).await? {
                    Some(id) => id,
                    None => return Ok(None),
                };
                self.meetings.set_course(&meeting.id, course_id).await?;
                meeting.course_id = Some(course_id);
            }
            return Ok(Some(meeting));
        }

        let course_id = match self.resolve_course(req).await? {
            Some(id) => id,
            None => return Ok(None),
        };

        let mut meeting = MeetingDbModel::new(req.topic)
            .with_external_id(req.external_meeting_id)
            .with_course(course_id);
        if let Some(start_time) = req.start_time {
            meeting.start_time = start_time.to_string();
        }

        info!(
            "pipeline: synthesizing meeting for external id {} (course {})",
            req.external_meeting_id, course_id
        );
        self.meetings.create_meeting(&meeting).await?;
        Ok(Some(meeting))
    }

    async fn resolve_course(&self, req: &IngestRequest<'_>) -> Result<Option<i64>> {
        if let Some(course_id) = req.override_course_id {
            return Ok(Some(course_id));
        }

        match self.resolver.resolve(req.topic).await {
            Ok(id) => Ok(Some(id)),
            Err(Error::NoCourseResolved(topic)) => {
                warn!("pipeline: no course resolved for topic '{}'", topic);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// The full download → upload → verify → publish → persist sequence.
    async fn execute_pipeline(
        &self,
        meeting: &MeetingDbModel,
        req: &IngestRequest<'_>,
    ) -> Result<PipelineOutcome> {
        let course_id = meeting
            .course_id
            .ok_or_else(|| Error::validation("meeting has no course binding"))?;

        let download_url = req
            .file
            .download_url
            .clone()
            .ok_or_else(|| Error::validation("recording file carries no download URL"))?;

        let started = parse_start_time(req.start_time);
        let file_name = artifact_file_name(&meeting.topic, started, &req.file.id);
        let local_path = self.settings.downloads_dir.join(&file_name);

        let path_lock = self.ctx.path_lock(&local_path);
        let _path_guard = path_lock.lock().await;

        info!("download: fetching recording {} to {}", req.file.id, local_path.display());
        let request = DownloadRequest {
            url: download_url,
            dest: local_path.clone(),
            download_token: req.download_token.map(str::to_owned),
            expected_bytes: req.file.file_size,
        };
        let outcome = self.downloader.download(&request).await?;
        debug!(
            "download: {} complete ({} bytes, type {:?})",
            req.file.id, outcome.content_length, outcome.content_type
        );

        let course_folder = self
            .storage
            .ensure_folder(&course_id.to_string(), self.storage.root_folder_id())
            .await?;
        let month_folder = self
            .storage
            .ensure_folder(&started.format("%Y-%m").to_string(), &course_folder)
            .await?;

        let _upload_slot = self.ctx.acquire_upload_slot().await?;

        info!("upload: storing {} into folder {}", file_name, month_folder);
        let tags = ArtifactTags {
            meeting_id: meeting.id.clone(),
            course_id,
            external_recording_id: req.file.id.clone(),
        };
        let artifact = self
            .storage
            .upload(&local_path, &file_name, &month_folder, &tags)
            .await?;

        self.storage.wait_for_preview(&artifact.file_id).await;

        if self.settings.prepublish_delay_ms > 0 {
            debug!("pipeline: pre-publish delay {} ms", self.settings.prepublish_delay_ms);
            tokio::time::sleep(Duration::from_millis(self.settings.prepublish_delay_ms)).await;
        }

        self.publish_discussion(course_id, &meeting.topic, &req.file.id, &artifact.view_url)
            .await?;

        let recording = RecordingDbModel::new(&meeting.id, &req.file.id, &artifact.view_url);
        self.recordings.create_recording(&recording).await?;
        self.meetings.mark_completed(&meeting.id).await?;
        self.release_license(&meeting.id).await;

        if let Err(err) = tokio::fs::remove_file(&local_path).await {
            warn!("pipeline: could not delete local file {}: {}", local_path.display(), err);
        }

        Ok(PipelineOutcome::Done {
            drive_url: artifact.view_url,
        })
    }

    /// Resolve a topic through the course resolver.
    pub async fn resolve_topic(&self, topic: &str) -> Result<i64> {
        self.resolver.resolve(topic).await
    }

    /// Post the discussion announcing the stored artifact.
    pub async fn publish_discussion(
        &self,
        course_id: i64,
        topic: &str,
        external_recording_id: &str,
        view_url: &str,
    ) -> Result<i64> {
        let forums = self.lms.list_forums(course_id).await?;
        let forum = publish::choose_forum(&forums)
            .ok_or_else(|| Error::Forum(format!("course {course_id} has no forums")))?;

        let subject = publish::discussion_subject(topic, Utc::now(), external_recording_id);
        let message = publish::embed_html(&publish::preview_url(view_url));

        let discussion_id = self.lms.create_discussion(forum.id, &subject, &message).await?;
        info!(
            "drive: recording {} announced in forum {} as discussion {}",
            external_recording_id, forum.id, discussion_id
        );
        Ok(discussion_id)
    }

    /// Repair trailing state on idempotent re-entry: completed status and
    /// license release.
    async fn complete_meeting(&self, meeting: &MeetingDbModel) -> Result<()> {
        if !meeting.is_completed() {
            self.meetings.mark_completed(&meeting.id).await?;
        }
        self.release_license(&meeting.id).await;
        Ok(())
    }

    /// Meetings synthesized from webhooks never held a license slot, so a
    /// zero-row release is routine.
    async fn release_license(&self, meeting_id: &str) {
        match self.licenses.release_for_meeting(meeting_id).await {
            Ok(0) => debug!("pipeline: no license slot bound to meeting {}", meeting_id),
            Ok(n) => info!("pipeline: released {} license slot(s) for meeting {}", n, meeting_id),
            Err(err) => warn!("pipeline: license release failed for meeting {}: {}", meeting_id, err),
        }
    }
}

fn parse_start_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        let done = PipelineOutcome::Done {
            drive_url: "https://store.test/file/d/x/view".into(),
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["status"], "done");
        assert_eq!(json["driveUrl"], "https://store.test/file/d/x/view");

        let json = serde_json::to_value(PipelineOutcome::InFlight).unwrap();
        assert_eq!(json["status"], "in-flight");

        let json = serde_json::to_value(PipelineOutcome::Ignored {
            reason: reasons::NO_COURSE_RESOLVED.into(),
        })
        .unwrap();
        assert_eq!(json["status"], "ignored");
        assert_eq!(json["reason"], "no-course-resolved");
    }

    #[test]
    fn test_parse_start_time_accepts_rfc3339() {
        let parsed = parse_start_time(Some("2025-08-18T10:30:00Z"));
        assert_eq!(parsed.format("%Y-%m").to_string(), "2025-08");
    }
}
