//! License repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;

/// License repository trait. The pipeline only releases slots; assignment
/// belongs to the scheduling path, which is outside this service.
#[async_trait]
pub trait LicenseRepository: Send + Sync {
    /// Free any license slot bound to the meeting. Returns the number of
    /// rows released; 0 is a valid outcome for meetings synthesized from
    /// webhooks, which never held a slot.
    async fn release_for_meeting(&self, meeting_id: &str) -> Result<u64>;
}

/// SQLx implementation of LicenseRepository.
pub struct SqlxLicenseRepository {
    pool: SqlitePool,
}

impl SqlxLicenseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LicenseRepository for SqlxLicenseRepository {
    async fn release_for_meeting(&self, meeting_id: &str) -> Result<u64> {
        let result =
            sqlx::query("UPDATE licenses SET meeting_id = NULL, in_use = 0 WHERE meeting_id = ?")
                .bind(meeting_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
