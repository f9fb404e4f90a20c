//! Remote footage fetcher – downloads the clips around an event.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::info;

use crate::retry::retry_fixed;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection problems, timeouts, 5xx/429 answers.  Worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Time range to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    /// `[event + start_offset_s, event + end_offset_s]`, or `None` when
    /// either end falls outside the representable time range.
    pub fn around(event: DateTime<Utc>, start_offset_s: i64, end_offset_s: i64) -> Option<Self> {
        Some(Self {
            start: event.checked_add_signed(TimeDelta::try_seconds(start_offset_s)?)?,
            end: event.checked_add_signed(TimeDelta::try_seconds(end_offset_s)?)?,
        })
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

/// Anything that can export footage for a time window into a directory.
pub trait FootageSource {
    /// Download every selected camera's footage for `window` into `dest`.
    /// `cameras = None` means all cameras.  Returns the downloaded file
    /// names relative to `dest`.
    fn fetch(
        &self,
        dest: &Path,
        window: &FetchWindow,
        cameras: Option<&[String]>,
    ) -> Result<Vec<String>, FetchError>;
}

/// [`FootageSource::fetch`] with up to `attempts` tries, `wait` apart, on
/// transient errors only.
pub fn fetch_with_retry<S: FootageSource + ?Sized>(
    source: &S,
    dest: &Path,
    window: &FetchWindow,
    cameras: Option<&[String]>,
    attempts: u32,
    wait: Duration,
    shutdown: &AtomicBool,
) -> Result<Vec<String>, FetchError> {
    let files = retry_fixed(attempts, wait, shutdown, FetchError::is_transient, |attempt| {
        info!(
            "Fetching footage {} → {} into {} (attempt {attempt}/{attempts})",
            window.start,
            window.end,
            dest.display()
        );
        source.fetch(dest, window, cameras)
    })?;
    info!("Fetched {} file(s) into {}", files.len(), dest.display());
    Ok(files)
}
