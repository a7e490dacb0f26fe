//! Meeting repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::MeetingDbModel;
use crate::{Error, Result};

/// Meeting repository trait.
#[async_trait]
pub trait MeetingRepository: Send + Sync {
    async fn get_meeting(&self, id: &str) -> Result<MeetingDbModel>;
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<MeetingDbModel>>;
    async fn create_meeting(&self, meeting: &MeetingDbModel) -> Result<()>;
    /// Transition the meeting to COMPLETED. Idempotent.
    async fn mark_completed(&self, id: &str) -> Result<()>;
    async fn set_course(&self, id: &str, course_id: i64) -> Result<()>;
}

/// SQLx implementation of MeetingRepository.
pub struct SqlxMeetingRepository {
    pool: SqlitePool,
}

impl SqlxMeetingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MeetingRepository for SqlxMeetingRepository {
    async fn get_meeting(&self, id: &str) -> Result<MeetingDbModel> {
        sqlx::query_as::<_, MeetingDbModel>("SELECT * FROM meetings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Meeting", id))
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<MeetingDbModel>> {
        let meeting = sqlx::query_as::<_, MeetingDbModel>(
            "SELECT * FROM meetings WHERE external_meeting_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(meeting)
    }

    async fn create_meeting(&self, meeting: &MeetingDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO meetings (id, external_meeting_id, topic, course_id, status, start_time, join_url, start_url, license_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&meeting.id)
        .bind(&meeting.external_meeting_id)
        .bind(&meeting.topic)
        .bind(meeting.course_id)
        .bind(&meeting.status)
        .bind(&meeting.start_time)
        .bind(&meeting.join_url)
        .bind(&meeting.start_url)
        .bind(&meeting.license_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE meetings SET status = 'COMPLETED' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_course(&self, id: &str, course_id: i64) -> Result<()> {
        sqlx::query("UPDATE meetings SET course_id = ? WHERE id = ?")
            .bind(course_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
