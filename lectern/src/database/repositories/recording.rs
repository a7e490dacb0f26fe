//! Recording repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::RecordingDbModel;
use crate::{Error, Result};

/// Recording repository trait.
#[async_trait]
pub trait RecordingRepository: Send + Sync {
    async fn get_recording(&self, id: &str) -> Result<RecordingDbModel>;
    async fn find_by_external_recording_id(
        &self,
        external_recording_id: &str,
    ) -> Result<Option<RecordingDbModel>>;
    async fn find_by_meeting_id(&self, meeting_id: &str) -> Result<Vec<RecordingDbModel>>;
    async fn create_recording(&self, recording: &RecordingDbModel) -> Result<()>;

    /// Record a manual republish: bump `retry_count` and stamp
    /// `last_retry_at`.
    async fn record_republish(&self, id: &str, at: &str) -> Result<()>;

    /// Candidates for the pending-retry listing.
    async fn list_pending(
        &self,
        only_without_artifact: bool,
        limit: i64,
    ) -> Result<Vec<RecordingDbModel>>;

    /// Recordings created inside `[from, to]` (RFC 3339 bounds).
    async fn list_created_between(
        &self,
        from: &str,
        to: &str,
        limit: i64,
    ) -> Result<Vec<RecordingDbModel>>;

    /// Wakeup-job candidates: created inside the window, artifact present,
    /// fewer than two attempts, and not probed within the re-arm spacing.
    async fn list_wakeup_candidates(
        &self,
        window_start: &str,
        window_end: &str,
        rearm_cutoff: &str,
    ) -> Result<Vec<RecordingDbModel>>;

    /// Persist a wakeup probe outcome.
    async fn update_wakeup(&self, id: &str, attempts: i64, at: &str) -> Result<()>;
}

/// SQLx implementation of RecordingRepository.
pub struct SqlxRecordingRepository {
    pool: SqlitePool,
}

impl SqlxRecordingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordingRepository for SqlxRecordingRepository {
    async fn get_recording(&self, id: &str) -> Result<RecordingDbModel> {
        sqlx::query_as::<_, RecordingDbModel>("SELECT * FROM recordings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Recording", id))
    }

    async fn find_by_external_recording_id(
        &self,
        external_recording_id: &str,
    ) -> Result<Option<RecordingDbModel>> {
        let recording = sqlx::query_as::<_, RecordingDbModel>(
            "SELECT * FROM recordings WHERE external_recording_id = ?",
        )
        .bind(external_recording_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(recording)
    }

    async fn find_by_meeting_id(&self, meeting_id: &str) -> Result<Vec<RecordingDbModel>> {
        let recordings = sqlx::query_as::<_, RecordingDbModel>(
            "SELECT * FROM recordings WHERE meeting_id = ? ORDER BY created_at",
        )
        .bind(meeting_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(recordings)
    }

    async fn create_recording(&self, recording: &RecordingDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recordings (id, meeting_id, external_recording_id, artifact_url, created_at,
                                    retry_count, last_retry_at, wakeup_attempts, last_wakeup_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&recording.id)
        .bind(&recording.meeting_id)
        .bind(&recording.external_recording_id)
        .bind(&recording.artifact_url)
        .bind(&recording.created_at)
        .bind(recording.retry_count)
        .bind(&recording.last_retry_at)
        .bind(recording.wakeup_attempts)
        .bind(&recording.last_wakeup_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_republish(&self, id: &str, at: &str) -> Result<()> {
        sqlx::query(
            "UPDATE recordings SET retry_count = retry_count + 1, last_retry_at = ? WHERE id = ?",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pending(
        &self,
        only_without_artifact: bool,
        limit: i64,
    ) -> Result<Vec<RecordingDbModel>> {
        let sql = if only_without_artifact {
            "SELECT * FROM recordings WHERE artifact_url IS NULL ORDER BY created_at DESC LIMIT ?"
        } else {
            "SELECT * FROM recordings ORDER BY created_at DESC LIMIT ?"
        };

        let recordings = sqlx::query_as::<_, RecordingDbModel>(sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(recordings)
    }

    async fn list_created_between(
        &self,
        from: &str,
        to: &str,
        limit: i64,
    ) -> Result<Vec<RecordingDbModel>> {
        let recordings = sqlx::query_as::<_, RecordingDbModel>(
            "SELECT * FROM recordings WHERE created_at >= ? AND created_at <= ? ORDER BY created_at LIMIT ?",
        )
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(recordings)
    }

    async fn list_wakeup_candidates(
        &self,
        window_start: &str,
        window_end: &str,
        rearm_cutoff: &str,
    ) -> Result<Vec<RecordingDbModel>> {
        let recordings = sqlx::query_as::<_, RecordingDbModel>(
            r#"
            SELECT * FROM recordings
            WHERE created_at >= ? AND created_at <= ?
              AND artifact_url IS NOT NULL
              AND wakeup_attempts < 2
              AND (last_wakeup_at IS NULL OR last_wakeup_at <= ?)
            ORDER BY created_at
            "#,
        )
        .bind(window_start)
        .bind(window_end)
        .bind(rearm_cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(recordings)
    }

    async fn update_wakeup(&self, id: &str, attempts: i64, at: &str) -> Result<()> {
        sqlx::query("UPDATE recordings SET wakeup_attempts = ?, last_wakeup_at = ? WHERE id = ?")
            .bind(attempts)
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
