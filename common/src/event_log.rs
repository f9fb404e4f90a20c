//! Event-log records – the hand-off between the webhook server and the pull
//! pipeline.
//!
//! A record is a one-line text file:
//!
//! ```text
//! 2025-05-26_12-00-00,ABC123,1748260800000
//! ```
//!
//! (local receive time, plate, event timestamp in epoch milliseconds).  The
//! webhook server writes it under a hidden temporary name and renames it into
//! place; the pull pipeline renames it to `<name>.done` once processed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use thiserror::Error;

/// Format of the receive-time label.
pub const RECEIVED_AT_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Same label with milliseconds, as written by older installations.
pub const RECEIVED_AT_FORMAT_MS: &str = "%Y-%m-%d_%H-%M-%S-%3f";

pub const DONE_SUFFIX: &str = ".done";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordParseError {
    #[error("expected 3 comma-separated fields, got {0}")]
    FieldCount(usize),
    #[error("empty license plate")]
    EmptyPlate,
    #[error("bad event timestamp {0:?}")]
    Timestamp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLogRecord {
    pub received_at: String,
    pub license_plate: String,
    pub event_timestamp_ms: i64,
}

impl EventLogRecord {
    /// New record stamped with the current local time.
    pub fn new(license_plate: &str, event_timestamp_ms: i64) -> Self {
        Self {
            received_at: Local::now().format(RECEIVED_AT_FORMAT).to_string(),
            license_plate: license_plate.to_string(),
            event_timestamp_ms,
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{},{},{}",
            self.received_at, self.license_plate, self.event_timestamp_ms
        )
    }

    pub fn parse_line(line: &str) -> Result<Self, RecordParseError> {
        let parts: Vec<&str> = line.trim().split(',').collect();
        if parts.len() != 3 {
            return Err(RecordParseError::FieldCount(parts.len()));
        }
        let license_plate = parts[1].trim();
        if license_plate.is_empty() {
            return Err(RecordParseError::EmptyPlate);
        }
        let ts = parts[2].trim();
        let event_timestamp_ms = ts
            .parse::<i64>()
            .map_err(|_| RecordParseError::Timestamp(ts.to_string()))?;

        Ok(Self {
            received_at: parts[0].trim().to_string(),
            license_plate: license_plate.to_string(),
            event_timestamp_ms,
        })
    }

    /// Event time as UTC, if the millisecond value is representable.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.event_timestamp_ms)
    }
}

/// Parse a receive-time label (with or without milliseconds).
pub fn parse_received_at(label: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(label, RECEIVED_AT_FORMAT_MS)
        .or_else(|_| NaiveDateTime::parse_from_str(label, RECEIVED_AT_FORMAT))
        .ok()
}

/// `<prefix><plate>_<uuid><suffix>`
pub fn record_file_name(prefix: &str, license_plate: &str, suffix: &str) -> String {
    format!("{prefix}{license_plate}_{}{suffix}", uuid::Uuid::new_v4())
}

/// Whether `file_name` is a pending record (not a done marker, not a
/// temporary file).
pub fn is_pending_record(file_name: &str, prefix: &str, suffix: &str) -> bool {
    !file_name.starts_with('.')
        && file_name.starts_with(prefix)
        && file_name.ends_with(suffix)
        && !file_name.ends_with(DONE_SUFFIX)
}

pub fn done_path(record_path: &Path) -> PathBuf {
    let mut name = record_path.as_os_str().to_os_string();
    name.push(DONE_SUFFIX);
    PathBuf::from(name)
}

/// Publish `record` in `dir`.  The file appears atomically: it is written
/// under a hidden name first and then renamed.
pub fn write_record(
    dir: &Path,
    prefix: &str,
    suffix: &str,
    record: &EventLogRecord,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Cannot create {}", dir.display()))?;

    let file_name = record_file_name(prefix, &record.license_plate, suffix);
    let final_path = dir.join(&file_name);
    let tmp_path = dir.join(format!(".{file_name}.tmp"));

    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("Cannot create {}", tmp_path.display()))?;
    writeln!(file, "{}", record.to_line())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, &final_path).with_context(|| {
        format!(
            "Cannot rename {} → {}",
            tmp_path.display(),
            final_path.display()
        )
    })?;
    Ok(final_path)
}

/// Read every line of a record file.  Blank lines are dropped; malformed
/// lines are returned as errors so the caller can log and skip them.
pub fn read_records(path: &Path) -> std::io::Result<Vec<Result<EventLogRecord, RecordParseError>>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(EventLogRecord::parse_line)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let r = EventLogRecord::parse_line("2025-05-26_12-00-00,ABC123,1748260800000\n").unwrap();
        assert_eq!(r.received_at, "2025-05-26_12-00-00");
        assert_eq!(r.license_plate, "ABC123");
        assert_eq!(r.event_timestamp_ms, 1_748_260_800_000);
        assert_eq!(r.to_line(), "2025-05-26_12-00-00,ABC123,1748260800000");
        assert_eq!(
            r.event_time().unwrap().to_rfc3339(),
            "2025-05-26T12:00:00+00:00"
        );
    }

    #[test]
    fn test_parse_line_errors() {
        assert_eq!(
            EventLogRecord::parse_line("a,b"),
            Err(RecordParseError::FieldCount(2))
        );
        assert_eq!(
            EventLogRecord::parse_line("a, ,1"),
            Err(RecordParseError::EmptyPlate)
        );
        assert!(matches!(
            EventLogRecord::parse_line("a,b,notanumber"),
            Err(RecordParseError::Timestamp(_))
        ));
    }

    #[test]
    fn test_received_at_formats() {
        assert!(parse_received_at("2025-05-26_12-00-00").is_some());
        assert!(parse_received_at("2025-05-26_12-00-00-123").is_some());
        assert!(parse_received_at("yesterday").is_none());
    }

    #[test]
    fn test_write_record_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let record = EventLogRecord::new("ABC123", 1_748_260_800_000);
        let path = write_record(dir.path(), "event_", ".log", &record).unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("event_ABC123_"));
        assert!(is_pending_record(&name, "event_", ".log"));

        let lines = read_records(&path).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_ref().unwrap(), &record);

        // no temporary file left behind
        let count = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_done_marker_not_pending() {
        let done = done_path(Path::new("/x/event_A_1.log"));
        assert_eq!(done, PathBuf::from("/x/event_A_1.log.done"));
        assert!(!is_pending_record("event_A_1.log.done", "event_", ".log"));
        assert!(!is_pending_record(".event_A_1.log.tmp", "event_", ".log"));
    }
}
