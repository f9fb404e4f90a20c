//! Webhook HTTP server.
//!
//! Routes:
//!   POST <webhook_path>  → handle an LPR event
//!   GET  <webhook_path>  → 405
//!   GET  /api/health     → health check

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use lpr_common::config::ConfigHandle;
use lpr_common::protocol::{HealthResponse, WebhookPayload, WebhookResponse};

use crate::capture::Orchestrator;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigHandle>,
    pub orchestrator: Arc<Orchestrator>,
    pub start_time: Instant,
}

/// Unexpected failure while handling a request; answered with 500.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Error processing webhook: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{:#}", self.0) })),
        )
            .into_response()
    }
}

pub fn router(state: AppState, webhook_path: &str) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(webhook_path, get(webhook_get).post(webhook_post))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn run(state: AppState, listen_addr: &str, webhook_path: &str, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = router(state, webhook_path);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Webhook server listening on {listen_addr} (path {webhook_path})");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn webhook_get() -> impl IntoResponse {
    info!("Received GET on webhook path");
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "only post allowed" })),
    )
}

async fn webhook_post(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let payload = WebhookPayload::from_bytes(&body);
    let config = state.config.snapshot();
    let summary = state.orchestrator.handle_event(&config, &payload).await?;
    Ok(Json(summary.response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use lpr_common::config::{CaptureMode, Config};
    use lpr_common::ffmpeg::ToolError;

    use crate::executor::CaptureExecutor;

    struct NoopExecutor;

    impl CaptureExecutor for NoopExecutor {
        fn capture_image(&self, _url: &str, _output: &Path) -> Result<(), ToolError> {
            Ok(())
        }
        fn capture_video(&self, _url: &str, _output: &Path, _d: u32) -> Result<(), ToolError> {
            Ok(())
        }
    }

    fn state(dir: &Path) -> AppState {
        let mut config = Config::default();
        config.paths.image_dir = dir.to_path_buf();
        config.server.mode = CaptureMode::Pull;
        AppState {
            config: Arc::new(ConfigHandle::fixed(config)),
            orchestrator: Arc::new(Orchestrator::new(
                Arc::new(NoopExecutor),
                2,
                CancellationToken::new(),
            )),
            start_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_post_valid_event() {
        let dir = tempfile::tempdir().unwrap();
        let body = Bytes::from_static(
            br#"{"alarm":{"triggers":[{"device":"d","key":"license_plate","value":"ABC123","timestamp":1748260800000}]}}"#,
        );
        let Json(resp) = webhook_post(State(state(dir.path())), body).await.unwrap();
        assert_eq!(resp.status, "received");
        assert_eq!(resp.log_file_created, Some(true));
        assert!(resp.message.unwrap().starts_with("license ABC123 received at "));
    }

    #[tokio::test]
    async fn test_post_malformed_is_missing_data() {
        let dir = tempfile::tempdir().unwrap();
        let Json(resp) = webhook_post(State(state(dir.path())), Bytes::from_static(b"{"))
            .await
            .unwrap();
        assert_eq!(resp, WebhookResponse::missing_data());
    }

    #[tokio::test]
    async fn test_get_not_allowed() {
        let resp = webhook_get().await.into_response();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_internal_error_is_500() {
        let resp = AppError::from(anyhow::anyhow!("disk full")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
