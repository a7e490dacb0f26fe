//! Health check routes.

use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};

use crate::api::server::AppState;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}
