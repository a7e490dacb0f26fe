//! API route modules.

pub mod admin;
pub mod health;
pub mod webhook;

use axum::Router;
use axum::routing::post;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::server::AppState;

/// Create the main API router.
pub fn create_router(enable_cors: bool, state: AppState) -> Router {
    let mut router = Router::new()
        .route("/webhook", post(webhook::handle_webhook))
        .nest("/admin", admin::router())
        .nest("/health", health::router())
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));
    }

    router.with_state(state)
}
