//! Event pull pipeline.
//!
//! Each scan picks up event-log records older than `pull.age_seconds`
//! (oldest first) and, per record line:
//!   1. fetches the footage window around the event into `<image_dir>/<plate>`
//!   2. trims every downloaded clip to its motion window
//!   3. stores one event row per clip (deduplicated on the first media path)
//!
//! A record whose footage could not be fetched stays in place and is retried
//! on a later scan; otherwise it is renamed to `<name>.done`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use lpr_common::config::Config;
use lpr_common::event_log::{self, EventLogRecord};
use lpr_common::{media, plate};

use crate::db::{self, InsertOutcome};
use crate::fetch::{fetch_with_retry, FetchWindow, FootageSource};
use crate::retention;
use crate::trim::{ClipTrimmer, TrimOutcome, TrimSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Renamed to the done marker.
    Done,
    /// Left in place for the next scan.
    Pending,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub done: usize,
    pub pending: usize,
    pub markers_removed: usize,
}

pub struct PullPipeline<'a, S, C> {
    source: S,
    trimmer: C,
    shutdown: &'a AtomicBool,
}

/// Pending records in `dir` whose mtime is at least `min_age` old, oldest
/// first.
pub fn pending_records(dir: &Path, prefix: &str, suffix: &str, min_age: Duration) -> Result<Vec<PathBuf>> {
    let now = SystemTime::now();
    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();

    for entry in fs::read_dir(dir).with_context(|| format!("Cannot list {}", dir.display()))? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Cannot read directory entry: {e}");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if !event_log::is_pending_record(&name, prefix, suffix) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age >= min_age {
            found.push((modified, entry.path()));
        } else {
            debug!("{name} is too young ({}s), skipping for now", age.as_secs());
        }
    }

    found.sort();
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

impl<'a, S: FootageSource, C: ClipTrimmer> PullPipeline<'a, S, C> {
    pub fn new(source: S, trimmer: C, shutdown: &'a AtomicBool) -> Self {
        Self {
            source,
            trimmer,
            shutdown,
        }
    }

    /// One scan over the event-log directory.
    pub fn scan(&self, config: &Config) -> Result<ScanReport> {
        let dir = &config.paths.image_dir;
        let records = pending_records(
            dir,
            &config.pull.log_prefix,
            &config.pull.log_suffix,
            Duration::from_secs(config.pull.age_seconds),
        )?;

        let mut report = ScanReport::default();
        if !records.is_empty() {
            info!("Found {} pending event record(s)", records.len());
        }

        for path in &records {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match self.process_record(config, path) {
                RecordOutcome::Done => report.done += 1,
                RecordOutcome::Pending => report.pending += 1,
            }
        }

        report.markers_removed =
            retention::cleanup_done_markers(dir, config.pull.done_retention_days, SystemTime::now());
        Ok(report)
    }

    /// Process every line of one record file.
    pub fn process_record(&self, config: &Config, path: &Path) -> RecordOutcome {
        info!("Processing event record {}", path.display());
        let lines = match event_log::read_records(path) {
            Ok(lines) => lines,
            Err(e) => {
                error!("Cannot read {}: {e}", path.display());
                return RecordOutcome::Pending;
            }
        };

        let mut persist_failed = false;
        for line in lines {
            let record = match line {
                Ok(r) => r,
                Err(e) => {
                    warn!("{}: skipping malformed line: {e}", path.display());
                    continue;
                }
            };
            match self.process_event(config, &record) {
                Ok(ok) => persist_failed |= !ok,
                Err(e) => {
                    error!("Footage for {} not fetched, record stays pending: {e:#}", record.license_plate);
                    return RecordOutcome::Pending;
                }
            }
        }

        if persist_failed && !config.pull.mark_done_on_persist_failure {
            warn!("{}: database errors, leaving record pending", path.display());
            return RecordOutcome::Pending;
        }

        let done = event_log::done_path(path);
        match fs::rename(path, &done) {
            Ok(()) => {
                info!("Renamed {} → {}", path.display(), done.display());
                RecordOutcome::Done
            }
            Err(e) => {
                error!("Cannot rename {} → {}: {e}", path.display(), done.display());
                RecordOutcome::Pending
            }
        }
    }

    /// Fetch, trim and store one event.  `Err` means the fetch failed;
    /// `Ok(false)` means at least one row could not be stored.
    fn process_event(&self, config: &Config, record: &EventLogRecord) -> Result<bool> {
        let safe_plate = plate::sanitize(&record.license_plate);
        if safe_plate.is_empty() {
            warn!("Record plate {:?} is unusable, skipping", record.license_plate);
            return Ok(true);
        }
        let window = record.event_time().and_then(|event| {
            FetchWindow::around(event, config.pull.window_start_seconds, config.pull.window_end_seconds)
        });
        let Some(window) = window else {
            warn!("Event time {} out of range, skipping", record.event_timestamp_ms);
            return Ok(true);
        };

        let dest = config.plate_dir(&safe_plate);
        fs::create_dir_all(&dest).with_context(|| format!("Cannot create {}", dest.display()))?;

        debug!("{safe_plate}: downloading");
        let camera_ids = config.protect.camera_ids.ids();
        let files = fetch_with_retry(
            &self.source,
            &dest,
            &window,
            camera_ids.as_deref(),
            config.pull.retry_attempts,
            Duration::from_secs(config.pull.retry_wait_seconds),
            self.shutdown,
        )?;
        if files.is_empty() {
            warn!("No footage downloaded for {safe_plate}");
        }

        let settings = TrimSettings::from(&config.trim);
        let mut all_stored = true;
        for file in files {
            let clip = dest.join(&file);
            if media::is_derived(&clip) {
                warn!("Skipping derived file {}", clip.display());
                continue;
            }
            let produced = if config.trim.enabled {
                debug!("{safe_plate}: trimming {}", clip.display());
                self.trimmed_paths(&clip, &settings)
            } else {
                vec![clip]
            };
            let media_urls: Vec<String> = produced
                .iter()
                .map(|p| media::relative_to(&config.paths.image_dir, p))
                .collect();

            debug!("{safe_plate}: persisting {media_urls:?}");
            match db::insert_event(&config.paths.db_file, &record.received_at, &safe_plate, &media_urls) {
                Ok(InsertOutcome::Inserted(id)) => {
                    info!("Stored event {id} for {safe_plate}: {media_urls:?}");
                }
                Ok(InsertOutcome::Duplicate) => {
                    info!("Event with media {} already stored, skipping", media_urls[0]);
                }
                Err(e) => {
                    error!("Cannot store event for {safe_plate}: {e:#}");
                    all_stored = false;
                }
            }
        }
        Ok(all_stored)
    }

    fn trimmed_paths(&self, clip: &Path, settings: &TrimSettings) -> Vec<PathBuf> {
        match self.trimmer.trim(clip, settings) {
            Ok(TrimOutcome::Trimmed(files)) => files.paths(),
            Ok(TrimOutcome::NoMotion) => vec![clip.to_path_buf()],
            Err(e) => {
                error!("Trim failed, storing clip untouched: {e}");
                vec![clip.to_path_buf()]
            }
        }
    }
}
