//! HTTP control plane for the port forwarder
//!
//! Authenticates requests with a shared secret and translates them into
//! start/stop/status operations on a [`ForwardingSession`].

pub mod auth;
pub mod control;
pub mod error;
pub mod handlers;
pub mod models;

use axum::{routing::get, Json, Router};
use portfwd_core::ForwardingSession;
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

pub use control::{ControlPlane, ProcessInfo};
pub use error::ApiError;

/// Default shared secret when none is configured
pub const DEFAULT_AUTH_SECRET: &str = "taven123";

/// Application state shared across handlers
pub struct AppState {
    pub control: ControlPlane,
    pub auth_secret: String,
    pub process: ProcessInfo,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Port Forwarder API",
        version = "0.1.0",
        description = "Control plane for a single-rule TCP port forwarder"
    ),
    paths(
        handlers::forward_work_get,
        handlers::forward_work_post,
        handlers::server_summary,
        handlers::health_check,
    ),
    components(
        schemas(
            models::ApiResponse,
            models::ClientInfo,
            models::ServerSummary,
            models::HealthResponse,
        )
    ),
    tags(
        (name = "forwarding", description = "Start and stop the forwarding rule"),
        (name = "system", description = "Status and health endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Shared secret expected in the `auth` parameter
    pub auth_secret: String,
    /// Version string reported by status endpoints
    pub version: String,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            auth_secret: DEFAULT_AUTH_SECRET.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create a new API server driving `session`
    pub fn new(config: ApiServerConfig, session: Arc<ForwardingSession>) -> Self {
        let state = Arc::new(AppState {
            control: ControlPlane::new(session),
            auth_secret: config.auth_secret.clone(),
            process: ProcessInfo {
                rest_api_addr: config.bind_addr.to_string(),
                version: config.version.clone(),
            },
        });

        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        Router::new()
            .route(
                "/ForwardWork",
                get(handlers::forward_work_get).post(handlers::forward_work_post),
            )
            .route("/ServerSummary", get(handlers::server_summary))
            .route("/api/health", get(handlers::health_check))
            .route("/api/openapi.json", get(openapi_spec))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("Control API listening on {}", listener.local_addr()?);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
