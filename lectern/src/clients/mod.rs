//! Outbound HTTP clients: conferencing provider, object store, LMS.

pub mod drive;
pub mod lms;
pub mod provider;
