//! Integration tests for the lectern persistence layer.
//!
//! These run against a real in-memory SQLite database with the actual
//! migrations applied.

use lectern::database::models::{MeetingDbModel, RecordingDbModel};
use lectern::database::repositories::{
    LicenseRepository, MeetingRepository, RecordingRepository, SqlxLicenseRepository,
    SqlxMeetingRepository, SqlxRecordingRepository,
};
use lectern::database::{DbPool, init_pool, run_migrations};

/// Helper to create a test database pool with migrations applied.
async fn setup_test_db() -> DbPool {
    let pool = init_pool("sqlite::memory:")
        .await
        .expect("Failed to create test pool");

    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

mod schema_tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = setup_test_db().await;

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .expect("Failed to query tables");

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();

        assert!(table_names.contains(&"meetings"), "meetings table missing");
        assert!(table_names.contains(&"recordings"), "recordings table missing");
        assert!(table_names.contains(&"licenses"), "licenses table missing");
    }

    #[tokio::test]
    async fn test_wakeup_columns_added_by_migration() {
        let pool = setup_test_db().await;

        let columns: Vec<(i64, String, String, i64, Option<String>, i64)> =
            sqlx::query_as("PRAGMA table_info(recordings)")
                .fetch_all(&pool)
                .await
                .expect("Failed to inspect recordings");

        let names: Vec<&str> = columns.iter().map(|c| c.1.as_str()).collect();
        assert!(names.contains(&"wakeup_attempts"));
        assert!(names.contains(&"last_wakeup_at"));
    }
}

mod meeting_repository_tests {
    use super::*;

    #[tokio::test]
    async fn test_meeting_crud_roundtrip() {
        let pool = setup_test_db().await;
        let repo = SqlxMeetingRepository::new(pool);

        let meeting = MeetingDbModel::new("Matemáticas Básicas")
            .with_external_id("94881330838")
            .with_course(13);
        repo.create_meeting(&meeting).await.unwrap();

        let found = repo
            .find_by_external_id("94881330838")
            .await
            .unwrap()
            .expect("meeting should exist");
        assert_eq!(found.id, meeting.id);
        assert_eq!(found.topic, "Matemáticas Básicas");
        assert_eq!(found.course_id, Some(13));
        assert_eq!(found.status, "SCHEDULED");

        repo.mark_completed(&meeting.id).await.unwrap();
        let completed = repo.get_meeting(&meeting.id).await.unwrap();
        assert!(completed.is_completed());

        // Marking again is idempotent.
        repo.mark_completed(&meeting.id).await.unwrap();
        assert!(repo.get_meeting(&meeting.id).await.unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_duplicate_external_meeting_id_rejected() {
        let pool = setup_test_db().await;
        let repo = SqlxMeetingRepository::new(pool);

        let first = MeetingDbModel::new("Topic A").with_external_id("dup-1");
        repo.create_meeting(&first).await.unwrap();

        let second = MeetingDbModel::new("Topic B").with_external_id("dup-1");
        assert!(repo.create_meeting(&second).await.is_err());
    }

    #[tokio::test]
    async fn test_set_course_updates_binding() {
        let pool = setup_test_db().await;
        let repo = SqlxMeetingRepository::new(pool);

        let meeting = MeetingDbModel::new("Sin Curso").with_external_id("m-2");
        repo.create_meeting(&meeting).await.unwrap();

        repo.set_course(&meeting.id, 42).await.unwrap();
        assert_eq!(repo.get_meeting(&meeting.id).await.unwrap().course_id, Some(42));
    }
}

mod recording_repository_tests {
    use super::*;

    async fn meeting_fixture(pool: &DbPool) -> MeetingDbModel {
        let repo = SqlxMeetingRepository::new(pool.clone());
        let meeting = MeetingDbModel::new("Fixture").with_external_id(uuid::Uuid::new_v4().to_string());
        repo.create_meeting(&meeting).await.unwrap();
        meeting
    }

    #[tokio::test]
    async fn test_external_recording_id_is_unique() {
        let pool = setup_test_db().await;
        let meeting = meeting_fixture(&pool).await;
        let repo = SqlxRecordingRepository::new(pool);

        let first = RecordingDbModel::new(&meeting.id, "abc123", "https://store.test/file/d/x/view");
        repo.create_recording(&first).await.unwrap();

        // Same external recording id again violates the unique index (I1).
        let second = RecordingDbModel::new(&meeting.id, "abc123", "https://store.test/file/d/y/view");
        assert!(repo.create_recording(&second).await.is_err());

        let found = repo
            .find_by_external_recording_id("abc123")
            .await
            .unwrap()
            .expect("recording should exist");
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn test_record_republish_increments_counter() {
        let pool = setup_test_db().await;
        let meeting = meeting_fixture(&pool).await;
        let repo = SqlxRecordingRepository::new(pool);

        let recording =
            RecordingDbModel::new(&meeting.id, "rep-1", "https://store.test/file/d/x/view");
        repo.create_recording(&recording).await.unwrap();

        repo.record_republish(&recording.id, "2025-08-18T12:00:00Z")
            .await
            .unwrap();

        let updated = repo.get_recording(&recording.id).await.unwrap();
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.last_retry_at.as_deref(), Some("2025-08-18T12:00:00Z"));
    }

    #[tokio::test]
    async fn test_wakeup_candidates_filtering() {
        let pool = setup_test_db().await;
        let meeting = meeting_fixture(&pool).await;
        let repo = SqlxRecordingRepository::new(pool);

        let mut in_window =
            RecordingDbModel::new(&meeting.id, "w-1", "https://store.test/file/d/a/view");
        in_window.created_at = "2025-08-17T10:00:00+00:00".into();
        repo.create_recording(&in_window).await.unwrap();

        let mut exhausted =
            RecordingDbModel::new(&meeting.id, "w-2", "https://store.test/file/d/b/view");
        exhausted.created_at = "2025-08-17T11:00:00+00:00".into();
        exhausted.wakeup_attempts = 2;
        repo.create_recording(&exhausted).await.unwrap();

        let mut outside =
            RecordingDbModel::new(&meeting.id, "w-3", "https://store.test/file/d/c/view");
        outside.created_at = "2025-08-10T10:00:00+00:00".into();
        repo.create_recording(&outside).await.unwrap();

        let candidates = repo
            .list_wakeup_candidates(
                "2025-08-17T00:00:00+00:00",
                "2025-08-17T23:59:59+00:00",
                "2025-08-18T01:00:00+00:00",
            )
            .await
            .unwrap();

        let ids: Vec<&str> = candidates
            .iter()
            .map(|r| r.external_recording_id.as_str())
            .collect();
        assert_eq!(ids, vec!["w-1"]);
    }

    #[tokio::test]
    async fn test_update_wakeup_persists_counters() {
        let pool = setup_test_db().await;
        let meeting = meeting_fixture(&pool).await;
        let repo = SqlxRecordingRepository::new(pool);

        let recording =
            RecordingDbModel::new(&meeting.id, "wu-1", "https://store.test/file/d/x/view");
        repo.create_recording(&recording).await.unwrap();

        repo.update_wakeup(&recording.id, 1, "2025-08-18T02:05:00Z")
            .await
            .unwrap();

        let updated = repo.get_recording(&recording.id).await.unwrap();
        assert_eq!(updated.wakeup_attempts, 1);
        assert_eq!(updated.last_wakeup_at.as_deref(), Some("2025-08-18T02:05:00Z"));
    }

    #[tokio::test]
    async fn test_list_created_between_respects_limit() {
        let pool = setup_test_db().await;
        let meeting = meeting_fixture(&pool).await;
        let repo = SqlxRecordingRepository::new(pool);

        for i in 0..4 {
            let mut recording = RecordingDbModel::new(
                &meeting.id,
                format!("win-{i}"),
                "https://store.test/file/d/x/view",
            );
            recording.created_at = format!("2025-08-18T0{i}:00:00+00:00");
            repo.create_recording(&recording).await.unwrap();
        }

        let rows = repo
            .list_created_between(
                "2025-08-18T00:00:00+00:00",
                "2025-08-18T23:59:59+00:00",
                3,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].external_recording_id, "win-0");
    }
}

mod license_repository_tests {
    use super::*;

    #[tokio::test]
    async fn test_release_frees_slot_and_is_noop_without_one() {
        let pool = setup_test_db().await;

        sqlx::query(
            "INSERT INTO licenses (id, account_email, meeting_id, in_use) VALUES ('l-1', 'host@school.test', 'm-1', 1)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let repo = SqlxLicenseRepository::new(pool.clone());

        // Meeting without a slot: zero rows, not an error.
        assert_eq!(repo.release_for_meeting("m-unknown").await.unwrap(), 0);

        // Meeting holding a slot: released exactly once.
        assert_eq!(repo.release_for_meeting("m-1").await.unwrap(), 1);
        assert_eq!(repo.release_for_meeting("m-1").await.unwrap(), 0);

        let (meeting_id, in_use): (Option<String>, bool) =
            sqlx::query_as("SELECT meeting_id, in_use FROM licenses WHERE id = 'l-1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(meeting_id.is_none());
        assert!(!in_use);
    }
}
