//! The recording-processing pipeline: coordinator, guards, manual retry,
//! and historical backfill.

pub mod coordinator;
pub mod guards;
pub mod retry_engine;
pub mod sync;

pub use coordinator::{IngestRequest, PipelineCoordinator, PipelineOutcome};
pub use guards::PipelineContext;

/// Stable result/skip reason strings surfaced by the admin API.
pub mod reasons {
    pub const ALREADY_COMPLETED: &str = "already-completed";
    pub const NO_COURSE_RESOLVED: &str = "no-course-resolved";
    pub const NO_DRIVE_URL_FOUND: &str = "no-drive-url-found";
    pub const ALREADY_IN_PROGRESS: &str = "already-in-progress";
    pub const DRY_RUN: &str = "dry-run";
    pub const REPUBLISHED: &str = "republished-successfully";
}
