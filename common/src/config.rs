//! Configuration parsing – reads the TOML file shared by the capture and
//! processing servers.
//!
//! Both servers load the same file; each ignores the sections it does not
//! need.  Every key has a default so a minimal file only has to name the
//! directories and the camera streams.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::plate;

/// Upper bounds for values that feed time arithmetic.
const MAX_RETENTION_DAYS: f64 = 36_500.0;
const MAX_STREAM_IMAGES: u32 = 1000;
const MAX_STREAM_DELAY_MS: u64 = 3_600_000;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub protect: ProtectConfig,
    pub pull: PullConfig,
    pub trim: TrimConfig,
    pub retention: RetentionConfig,
    pub ignored_plates: Vec<IgnoredPlate>,
    /// Device id → RTSP streams captured when that device fires.
    pub rtsp_streams: HashMap<String, Vec<StreamConfig>>,
}

// ── sections ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the media tree; one subdirectory per plate.
    pub image_dir: PathBuf,
    pub log_dir: PathBuf,
    pub db_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub level: String,
    /// File name under `paths.log_dir`; `None` logs to stderr only.
    pub file: Option<String>,
}

/// How the webhook handler treats a valid event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Grab stills/video from RTSP right away and answer with the paths.
    Inline,
    /// Write an event-log record; the pull pipeline fetches footage later.
    Pull,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub webhook_path: String,
    pub max_concurrent_ffmpeg: usize,
    pub mode: CaptureMode,
    pub barrier_url: Option<String>,
    pub config_refresh_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtectConfig {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub verify_ssl: bool,
    pub camera_ids: CameraFilter,
    pub download_wait_secs: u64,
    pub download_timeout_secs: u64,
}

/// Which cameras the footage fetcher exports from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CameraFilter {
    /// `"all"` or a comma-separated id list.
    Text(String),
    Ids(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    /// Minimum age of an event-log file before it is picked up.
    pub age_seconds: u64,
    pub window_start_seconds: i64,
    pub window_end_seconds: i64,
    pub retry_attempts: u32,
    pub retry_wait_seconds: u64,
    pub schedule_interval_seconds: u64,
    pub log_prefix: String,
    pub log_suffix: String,
    pub done_retention_days: f64,
    /// Mark a record done even when the database insert failed.
    pub mark_done_on_persist_failure: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    pub enabled: bool,
    pub motion_threshold: f64,
    pub motion_min_frames: usize,
    pub backup_original: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub retention_days: f64,
    /// 0 disables the in-daemon purge (use `lpr-purge` from cron instead).
    pub purge_interval_seconds: u64,
    pub sweep_aged_files: bool,
}

/// Entry of the ignore list; both `"AB-12-CD"` and `{ plate = "AB-12-CD" }`
/// are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IgnoredPlate {
    Plain(String),
    Entry { plate: String },
}

impl IgnoredPlate {
    pub fn plate(&self) -> &str {
        match self {
            IgnoredPlate::Plain(p) => p,
            IgnoredPlate::Entry { plate } => plate,
        }
    }
}

/// One RTSP stream attached to a device.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default = "default_num_images")]
    pub num_images: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub video_duration_s: u32,
}

fn default_num_images() -> u32 {
    1
}

fn default_interval_ms() -> u64 {
    1000
}

// ── defaults ─────────────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            protect: ProtectConfig::default(),
            pull: PullConfig::default(),
            trim: TrimConfig::default(),
            retention: RetentionConfig::default(),
            ignored_plates: Vec::new(),
            rtsp_streams: HashMap::new(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("/var/lib/protect-lpr/images"),
            log_dir: PathBuf::from("/var/log/protect-lpr"),
            db_file: PathBuf::from("/var/lib/protect-lpr/db/protect-lpr.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1025".into(),
            webhook_path: "/".into(),
            max_concurrent_ffmpeg: 4,
            mode: CaptureMode::Pull,
            barrier_url: None,
            config_refresh_secs: 30,
        }
    }
}

impl Default for ProtectConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".into(),
            port: 443,
            username: String::new(),
            password: String::new(),
            verify_ssl: false,
            camera_ids: CameraFilter::Text("all".into()),
            download_wait_secs: 5,
            download_timeout_secs: 15,
        }
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            age_seconds: 20,
            window_start_seconds: -15,
            window_end_seconds: 20,
            retry_attempts: 3,
            retry_wait_seconds: 5,
            schedule_interval_seconds: 10,
            log_prefix: "event_".into(),
            log_suffix: ".log".into(),
            done_retention_days: 7.0,
            mark_done_on_persist_failure: true,
        }
    }
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            motion_threshold: 1.0,
            motion_min_frames: 5,
            backup_original: true,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 30.0,
            purge_interval_seconds: 3600,
            sweep_aged_files: true,
        }
    }
}

// ── accessors ────────────────────────────────────────────────────────────

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/protect-lpr/config.toml"
    }

    /// Config path from the first CLI argument, `LPR_CONFIG`, or the default.
    pub fn path_from_env() -> PathBuf {
        std::env::args()
            .nth(1)
            .or_else(|| std::env::var("LPR_CONFIG").ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::default_path()))
    }

    /// Streams configured for `device_id` (empty when unknown).
    pub fn streams_for(&self, device_id: &str) -> &[StreamConfig] {
        self.rtsp_streams
            .get(device_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `license_plate` is on the ignore list.  Comparison ignores
    /// case and separators, so `ab-12-cd` matches `AB12CD`.
    pub fn is_ignored(&self, license_plate: &str) -> bool {
        let wanted = plate::normalize(license_plate);
        !wanted.is_empty()
            && self
                .ignored_plates
                .iter()
                .any(|p| plate::normalize(p.plate()) == wanted)
    }

    /// Directory for one plate's media.
    pub fn plate_dir(&self, safe_plate: &str) -> PathBuf {
        self.paths.image_dir.join(safe_plate)
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_concurrent_ffmpeg == 0 {
            anyhow::bail!("server.max_concurrent_ffmpeg must be at least 1");
        }
        if self.pull.retry_attempts == 0 {
            anyhow::bail!("pull.retry_attempts must be at least 1");
        }
        if self.pull.window_end_seconds <= self.pull.window_start_seconds {
            anyhow::bail!(
                "pull.window_end_seconds ({}) must be after window_start_seconds ({})",
                self.pull.window_end_seconds,
                self.pull.window_start_seconds
            );
        }
        if self.trim.motion_min_frames == 0 {
            anyhow::bail!("trim.motion_min_frames must be at least 1");
        }
        if self.pull.log_prefix.is_empty() && self.pull.log_suffix.is_empty() {
            anyhow::bail!("pull.log_prefix and pull.log_suffix cannot both be empty");
        }
        for (key, days) in [
            ("retention.retention_days", self.retention.retention_days),
            ("pull.done_retention_days", self.pull.done_retention_days),
        ] {
            if !days.is_finite() || days > MAX_RETENTION_DAYS {
                anyhow::bail!("{key} ({days}) must be a number of days up to {MAX_RETENTION_DAYS}");
            }
        }
        for (device, streams) in &self.rtsp_streams {
            for stream in streams {
                if stream.num_images > MAX_STREAM_IMAGES {
                    anyhow::bail!(
                        "rtsp_streams.{device}.{}: num_images must be at most {MAX_STREAM_IMAGES}",
                        stream.name
                    );
                }
                if stream.initial_delay_ms > MAX_STREAM_DELAY_MS
                    || stream.interval_ms > MAX_STREAM_DELAY_MS
                    || u64::from(stream.video_duration_s) * 1000 > MAX_STREAM_DELAY_MS
                {
                    anyhow::bail!(
                        "rtsp_streams.{device}.{}: delays and video duration must be at most one hour",
                        stream.name
                    );
                }
            }
        }
        Ok(())
    }
}

impl CameraFilter {
    /// `None` means every camera.
    pub fn ids(&self) -> Option<Vec<String>> {
        let ids: Vec<String> = match self {
            CameraFilter::Text(s) if s.trim().eq_ignore_ascii_case("all") => return None,
            CameraFilter::Text(s) => s
                .split(',')
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            CameraFilter::Ids(ids) => ids.clone(),
        };
        if ids.is_empty() {
            None
        } else {
            Some(ids)
        }
    }
}

// ── loading ──────────────────────────────────────────────────────────────

/// Parse and validate the configuration file at `path`.
///
/// `LPR_PROTECT_USERNAME` / `LPR_PROTECT_PASSWORD` override the credentials
/// in the file so secrets can stay out of it.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let mut config = parse(&text)
        .with_context(|| format!("Invalid config: {}", path.display()))?;

    if let Ok(user) = std::env::var("LPR_PROTECT_USERNAME") {
        config.protect.username = user;
    }
    if let Ok(pass) = std::env::var("LPR_PROTECT_PASSWORD") {
        config.protect.password = pass;
    }

    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Parse TOML text into a validated [`Config`].
pub fn parse(text: &str) -> Result<Config> {
    let config: Config = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

/// Shared, refreshable configuration.
///
/// Callers take an immutable [`snapshot`](ConfigHandle::snapshot) per
/// request or per scan; [`refresh`](ConfigHandle::refresh) re-reads the
/// file and swaps the snapshot.  A file that fails to load leaves the last
/// good snapshot in place.
pub struct ConfigHandle {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
}

impl ConfigHandle {
    pub fn load(path: &Path) -> Result<Self> {
        let config = load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Wrap an already-built config (no file behind it).
    pub fn fixed(config: Config) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Reload from disk.  Returns `true` when a new snapshot was installed.
    pub fn refresh(&self) -> bool {
        if self.path.as_os_str().is_empty() {
            return false;
        }
        match load(&self.path) {
            Ok(config) => {
                let mut guard = match self.current.write() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *guard = Arc::new(config);
                true
            }
            Err(e) => {
                warn!("Config reload failed, keeping previous snapshot: {e:#}");
                false
            }
        }
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
