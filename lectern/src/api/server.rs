//! API server setup and shared state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tracing::info;

use crate::api::routes;
use crate::database::repositories::RecordingRepository;
use crate::pipeline::coordinator::PipelineCoordinator;
use crate::pipeline::retry_engine::RetryEngine;
use crate::pipeline::sync::SyncEngine;
use crate::Result;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: false,
        }
    }
}

/// Webhook admission settings carried in state.
#[derive(Debug, Clone, Default)]
pub struct WebhookAdmission {
    pub secret: Option<String>,
    pub disable_signature: bool,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime reporting.
    pub start_time: Instant,
    pub webhook: WebhookAdmission,
    pub coordinator: Option<Arc<PipelineCoordinator>>,
    pub retry_engine: Option<Arc<RetryEngine>>,
    pub sync_engine: Option<Arc<SyncEngine>>,
    pub recordings: Option<Arc<dyn RecordingRepository>>,
}

impl AppState {
    /// Create a new application state without services (for testing).
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            webhook: WebhookAdmission::default(),
            coordinator: None,
            retry_engine: None,
            sync_engine: None,
            recordings: None,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind and serve the API.
pub async fn serve(config: ApiServerConfig, state: AppState) -> Result<()> {
    let router = routes::create_router(config.enable_cors, state);

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .map_err(|e| crate::Error::config(format!("invalid bind address: {e}")))?;

    let listener = TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, router)
        .await
        .map_err(crate::Error::Io)?;
    Ok(())
}
