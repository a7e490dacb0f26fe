//! Meeting, recording, and license database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Meeting database model. One row per scheduled or webhook-synthesized
/// session; the external meeting id is the provider's identifier.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MeetingDbModel {
    pub id: String,
    pub external_meeting_id: Option<String>,
    pub topic: String,
    /// LMS course the recording publishes into; null until resolved.
    pub course_id: Option<i64>,
    /// Status: SCHEDULED, COMPLETED.
    pub status: String,
    /// ISO 8601 timestamp.
    pub start_time: String,
    pub join_url: Option<String>,
    pub start_url: Option<String>,
    pub license_id: Option<String>,
}

impl MeetingDbModel {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            external_meeting_id: None,
            topic: topic.into(),
            course_id: None,
            status: MeetingStatus::Scheduled.as_str().to_string(),
            start_time: chrono::Utc::now().to_rfc3339(),
            join_url: None,
            start_url: None,
            license_id: None,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_meeting_id = Some(external_id.into());
        self
    }

    pub fn with_course(mut self, course_id: i64) -> Self {
        self.course_id = Some(course_id);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == MeetingStatus::Completed.as_str()
    }
}

/// Meeting lifecycle states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeetingStatus {
    Scheduled,
    Completed,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(Self::Scheduled),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Recording database model. One row per successfully ingested artifact;
/// the external recording id is the idempotency key for the pipeline.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RecordingDbModel {
    pub id: String,
    pub meeting_id: String,
    pub external_recording_id: String,
    /// Shareable viewing URL on the object store.
    pub artifact_url: Option<String>,
    /// ISO 8601 timestamp.
    pub created_at: String,
    /// Incremented only by manual republish.
    pub retry_count: i64,
    pub last_retry_at: Option<String>,
    /// Bounded to 2; mutated only by the preview wakeup job.
    pub wakeup_attempts: i64,
    pub last_wakeup_at: Option<String>,
}

impl RecordingDbModel {
    pub fn new(
        meeting_id: impl Into<String>,
        external_recording_id: impl Into<String>,
        artifact_url: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            meeting_id: meeting_id.into(),
            external_recording_id: external_recording_id.into(),
            artifact_url: Some(artifact_url.into()),
            created_at: chrono::Utc::now().to_rfc3339(),
            retry_count: 0,
            last_retry_at: None,
            wakeup_attempts: 0,
            last_wakeup_at: None,
        }
    }
}

/// License database model: an external-account slot assigned for the
/// duration of a meeting.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LicenseDbModel {
    pub id: String,
    pub account_email: String,
    pub meeting_id: Option<String>,
    pub in_use: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meeting_builder() {
        let meeting = MeetingDbModel::new("Matemáticas Básicas")
            .with_external_id("94881330838")
            .with_course(13);
        assert_eq!(meeting.topic, "Matemáticas Básicas");
        assert_eq!(meeting.external_meeting_id.as_deref(), Some("94881330838"));
        assert_eq!(meeting.course_id, Some(13));
        assert!(!meeting.is_completed());
    }

    #[test]
    fn test_meeting_status_roundtrip() {
        assert_eq!(MeetingStatus::parse("COMPLETED"), Some(MeetingStatus::Completed));
        assert_eq!(MeetingStatus::parse("bogus"), None);
        assert_eq!(MeetingStatus::Completed.as_str(), "COMPLETED");
    }

    #[test]
    fn test_recording_new_starts_unretried() {
        let rec = RecordingDbModel::new("m-1", "abc123", "https://store.test/file/d/x/view");
        assert_eq!(rec.retry_count, 0);
        assert_eq!(rec.wakeup_attempts, 0);
        assert!(rec.last_retry_at.is_none());
    }
}
