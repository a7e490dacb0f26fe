//! Repository traits and their sqlx implementations.

pub mod license;
pub mod meeting;
pub mod recording;

pub use license::{LicenseRepository, SqlxLicenseRepository};
pub use meeting::{MeetingRepository, SqlxMeetingRepository};
pub use recording::{RecordingRepository, SqlxRecordingRepository};
