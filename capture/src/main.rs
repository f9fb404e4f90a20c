//! LPR capture server – receives plate-recognition webhooks.
//!
//! This binary:
//! 1. Reads the TOML configuration (first argument, `LPR_CONFIG`, or the
//!    default path)
//! 2. Runs an axum HTTP server for the webhook
//! 3. Per event, either captures stills/video from the camera's RTSP streams
//!    (inline mode) or writes an event-log record for the processing server
//!    (pull mode)

mod barrier;
mod capture;
mod executor;
mod server;
mod trigger;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lpr_common::config::{Config, ConfigHandle};

#[tokio::main]
async fn main() -> Result<()> {
    // ── load config ──────────────────────────────────────────────────
    let config_path = Config::path_from_env();
    let handle = Arc::new(ConfigHandle::load(&config_path).context("Config load failed")?);
    let config = handle.snapshot();

    lpr_common::logging::init(&config.logging, &config.paths.log_dir)?;

    info!(
        "LPR Capture Server starting (listen={}, mode={:?}, config={})",
        config.server.listen_addr,
        config.server.mode,
        config_path.display()
    );

    std::fs::create_dir_all(&config.paths.image_dir)
        .with_context(|| format!("Cannot create {}", config.paths.image_dir.display()))?;

    // ── shutdown ─────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cancel.cancel();
        });
    }

    // ── periodic config refresh ──────────────────────────────────────
    if config.server.config_refresh_secs > 0 {
        let handle = handle.clone();
        let cancel = cancel.clone();
        let every = Duration::from_secs(config.server.config_refresh_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                let h = handle.clone();
                if let Ok(true) = tokio::task::spawn_blocking(move || h.refresh()).await {
                    tracing::debug!("Config refreshed");
                }
            }
        });
    }

    // ── HTTP server ──────────────────────────────────────────────────
    let orchestrator = capture::Orchestrator::new(
        Arc::new(executor::FfmpegExecutor),
        config.server.max_concurrent_ffmpeg,
        cancel.clone(),
    );
    let state = server::AppState {
        config: handle.clone(),
        orchestrator: Arc::new(orchestrator),
        start_time: Instant::now(),
    };

    server::run(
        state,
        &config.server.listen_addr,
        &config.server.webhook_path,
        cancel,
    )
    .await?;

    info!("LPR Capture Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
