//! LPR Processing Server – scans the event-log directory on a schedule,
//! fetches footage from UniFi Protect, trims it and stores the events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use lpr_common::config::{Config, ConfigHandle};
use lpr_processing::pipeline::PullPipeline;
use lpr_processing::protect::ProtectClient;
use lpr_processing::retry::sleep_unless_shutdown;
use lpr_processing::tools::FfmpegTools;
use lpr_processing::trim::MotionTrimmer;
use lpr_processing::{db, retention};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn main() -> Result<()> {
    // ── load config ──────────────────────────────────────────────────
    let config_path = Config::path_from_env();
    let handle = ConfigHandle::load(&config_path).context("Config load failed")?;
    let config = handle.snapshot();

    lpr_common::logging::init(&config.logging, &config.paths.log_dir)?;

    info!(
        "LPR Processing Server starting (image_dir={}, db={}, protect={}:{})",
        config.paths.image_dir.display(),
        config.paths.db_file.display(),
        config.protect.address,
        config.protect.port
    );

    // ── initialize storage ───────────────────────────────────────────
    std::fs::create_dir_all(&config.paths.image_dir)
        .with_context(|| format!("Cannot create {}", config.paths.image_dir.display()))?;
    db::initialize(&config.paths.db_file)?;
    info!("{} event(s) stored", db::count_events(&config.paths.db_file)?);

    // ── ctrl-c ───────────────────────────────────────────────────────
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // The Protect client keeps the address and credentials it was built
    // with; a config refresh only affects the scan settings.
    let source = ProtectClient::new(&config.protect).context("Cannot build Protect client")?;
    let pipeline = PullPipeline::new(source, MotionTrimmer::new(FfmpegTools), &SHUTDOWN);

    // ── scan loop ────────────────────────────────────────────────────
    let mut last_purge: Option<Instant> = None;
    while !SHUTDOWN.load(Ordering::Relaxed) {
        handle.refresh();
        let config = handle.snapshot();

        match pipeline.scan(&config) {
            Ok(report) if report.done + report.pending > 0 => {
                info!("Scan finished: {} done, {} still pending", report.done, report.pending);
            }
            Ok(_) => {}
            Err(e) => error!("Scan failed: {e:#}"),
        }

        let purge_every = Duration::from_secs(config.retention.purge_interval_seconds);
        if !purge_every.is_zero() && last_purge.map_or(true, |t| t.elapsed() >= purge_every) {
            if let Err(e) = retention::run_purge(&config) {
                warn!("Retention purge failed: {e:#}");
            }
            last_purge = Some(Instant::now());
        }

        sleep_unless_shutdown(
            Duration::from_secs(config.pull.schedule_interval_seconds.max(1)),
            &SHUTDOWN,
        );
    }

    info!("LPR Processing Server stopped");
    Ok(())
}
