//! HTTP API: webhook admission and admin surface.

pub mod error;
pub mod routes;
pub mod server;

pub use server::{ApiServerConfig, AppState};
