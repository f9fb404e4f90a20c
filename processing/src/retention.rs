//! Retention: done-marker cleanup, expired-event purge and the aged-file
//! sweep.
//!
//! A retention of zero (or less) days disables the corresponding cleanup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, info, warn};

use lpr_common::config::Config;
use lpr_common::event_log::{self, DONE_SUFFIX};
use lpr_common::media;

use crate::db;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub events_deleted: usize,
    pub files_deleted: usize,
    pub aged_files_deleted: usize,
    pub dirs_pruned: usize,
}

fn max_age(days: f64) -> Option<Duration> {
    if days.is_finite() && days > 0.0 {
        Duration::try_from_secs_f64(days * 86_400.0).ok()
    } else {
        None
    }
}

fn is_older(path: &Path, now: SystemTime, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|a| a > age)
}

fn remove_if_present(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Deleted {}", path.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Cannot delete {}: {e}", path.display());
            false
        }
    }
}

// ── done markers ─────────────────────────────────────────────────────────

/// Delete `*.done` markers in `dir` older than `days`.  Returns how many
/// were removed.
pub fn cleanup_done_markers(dir: &Path, days: f64, now: SystemTime) -> usize {
    let Some(age) = max_age(days) else { return 0 };
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("Cannot list {}: {e}", dir.display());
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_marker = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().ends_with(DONE_SUFFIX));
        if is_marker && is_older(&path, now, age) && remove_if_present(&path) {
            removed += 1;
        }
    }
    if removed > 0 {
        info!("Removed {removed} old done marker(s)");
    }
    removed
}

// ── event purge ──────────────────────────────────────────────────────────

/// Delete events received before `now - retention_days` together with
/// their media files and every derived artifact.
pub fn purge_expired_events(config: &Config, now: NaiveDateTime) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();
    let Some(age) = max_age(config.retention.retention_days) else {
        return Ok(report);
    };
    // a window reaching past the calendar expires nothing
    let cutoff = TimeDelta::from_std(age).ok().and_then(|age| now.checked_sub_signed(age));
    let Some(cutoff) = cutoff else {
        return Ok(report);
    };

    let mut expired = Vec::new();
    for event in db::all_events(&config.paths.db_file)? {
        let Some(received) = event_log::parse_received_at(&event.datetime) else {
            warn!("Event {}: unparseable datetime {:?}, keeping it", event.id, event.datetime);
            continue;
        };
        if received >= cutoff {
            continue;
        }
        for url in &event.media_urls {
            let file = config.paths.image_dir.join(url);
            let targets = std::iter::once(file.clone()).chain(media::derived_artifacts(&file));
            report.files_deleted += targets.filter(|p| remove_if_present(p)).count();
        }
        expired.push(event.id);
    }

    report.events_deleted = db::delete_events(&config.paths.db_file, &expired)?;
    if report.events_deleted > 0 {
        info!(
            "Purged {} event(s) older than {cutoff} ({} file(s))",
            report.events_deleted, report.files_deleted
        );
    }
    Ok(report)
}

// ── aged-file sweep ──────────────────────────────────────────────────────

struct Sweep<'a> {
    root: &'a Path,
    db_file: &'a Path,
    prefix: &'a str,
    suffix: &'a str,
    now: SystemTime,
    age: Duration,
}

impl Sweep<'_> {
    fn keep(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return true;
        };
        if event_log::is_pending_record(&name, self.prefix, self.suffix) {
            return true;
        }
        // the database and its -wal/-journal companions
        let db_name = self.db_file.file_name().map(|n| n.to_string_lossy().into_owned());
        path.parent() == self.db_file.parent() && db_name.is_some_and(|db| name.starts_with(&db))
    }

    /// Returns whether `dir` is empty afterwards.
    fn walk(&self, dir: &Path, report: &mut PurgeReport) -> bool {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("Cannot list {}: {e}", dir.display());
                return false;
            }
        };

        let mut empty = true;
        let mut subdirs: Vec<PathBuf> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(t) if t.is_dir() => subdirs.push(path),
                Ok(_) if !self.keep(&path) && is_older(&path, self.now, self.age) => {
                    if remove_if_present(&path) {
                        report.aged_files_deleted += 1;
                    } else {
                        empty = false;
                    }
                }
                _ => empty = false,
            }
        }

        for sub in subdirs {
            if self.walk(&sub, report) && fs::remove_dir(&sub).is_ok() {
                debug!("Pruned empty directory {}", sub.display());
                report.dirs_pruned += 1;
            } else {
                empty = false;
            }
        }
        empty && dir != self.root
    }
}

/// Delete every file under `image_dir` older than the retention window,
/// except pending records, then prune emptied directories.
pub fn sweep_aged_files(config: &Config, now: SystemTime) -> PurgeReport {
    let mut report = PurgeReport::default();
    let Some(age) = max_age(config.retention.retention_days) else {
        return report;
    };
    let sweep = Sweep {
        root: &config.paths.image_dir,
        db_file: &config.paths.db_file,
        prefix: &config.pull.log_prefix,
        suffix: &config.pull.log_suffix,
        now,
        age,
    };
    sweep.walk(&config.paths.image_dir, &mut report);
    if report.aged_files_deleted > 0 || report.dirs_pruned > 0 {
        info!(
            "Swept {} aged file(s), pruned {} director(ies)",
            report.aged_files_deleted, report.dirs_pruned
        );
    }
    report
}

/// Full retention pass: expired events, then (when enabled) the sweep.
pub fn run_purge(config: &Config) -> Result<PurgeReport> {
    let mut report = purge_expired_events(config, chrono::Local::now().naive_local())?;
    if config.retention.sweep_aged_files {
        let swept = sweep_aged_files(config, SystemTime::now());
        report.aged_files_deleted = swept.aged_files_deleted;
        report.dirs_pruned = swept.dirs_pruned;
    }
    Ok(report)
}
