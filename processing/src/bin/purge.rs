//! One-shot retention purge, meant for cron.
//!
//! Deletes events older than `retention.retention_days` with their media
//! and, when `retention.sweep_aged_files` is set, aged orphan files.

use anyhow::{Context, Result};
use tracing::info;

use lpr_common::config::{self, Config};
use lpr_processing::{db, retention};

fn main() -> Result<()> {
    let config_path = Config::path_from_env();
    let config = config::load(&config_path).context("Config load failed")?;
    lpr_common::logging::init(&config.logging, &config.paths.log_dir)?;

    db::initialize(&config.paths.db_file)?;
    let report = retention::run_purge(&config)?;

    info!(
        "Purge done: {} event(s), {} media file(s), {} aged file(s), {} director(ies)",
        report.events_deleted, report.files_deleted, report.aged_files_deleted, report.dirs_pruned
    );
    Ok(())
}
