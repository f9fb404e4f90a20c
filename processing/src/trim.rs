//! Motion trim engine – cuts a clip down to its motion window.
//!
//! For `dir/clip.mp4` a successful trim leaves:
//!   * `dir/clip.mp4`               the trimmed clip
//!   * `dir/clip.original.mp4`      the untouched original (with backup)
//!   * `dir/clip_center.jpg`        frame a quarter into the window
//!   * `dir/clip_center.thumb.jpg`  and its thumbnail
//!   * `dir/clip.thumb.jpg`         thumbnail of the trimmed clip
//!
//! Without motion the source is left exactly as it was.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use lpr_common::config::TrimConfig;
use lpr_common::ffmpeg::ToolError;
use lpr_common::media;

use crate::motion::{motion_mask, trim_window};
use crate::tools::VideoTools;

#[derive(Debug, Error)]
pub enum TrimError {
    #[error("cannot analyse {path}: {source}")]
    Analyse {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("{path}: unusable frame rate {fps}")]
    BadFrameRate { path: PathBuf, fps: f64 },

    #[error("cutting {path} failed: {source}")]
    Cut {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("cannot install trimmed clip {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrimSettings {
    pub motion_threshold: f64,
    pub motion_min_frames: usize,
    pub backup_original: bool,
}

impl From<&TrimConfig> for TrimSettings {
    fn from(cfg: &TrimConfig) -> Self {
        Self {
            motion_threshold: cfg.motion_threshold,
            motion_min_frames: cfg.motion_min_frames,
            backup_original: cfg.backup_original,
        }
    }
}

/// Files a successful trim produced, in the order they are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedFiles {
    pub video: PathBuf,
    pub center_frame: Option<PathBuf>,
}

impl ProducedFiles {
    pub fn paths(&self) -> Vec<PathBuf> {
        std::iter::once(self.video.clone())
            .chain(self.center_frame.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrimOutcome {
    Trimmed(ProducedFiles),
    NoMotion,
}

pub trait ClipTrimmer {
    fn trim(&self, video: &Path, settings: &TrimSettings) -> Result<TrimOutcome, TrimError>;
}

pub struct MotionTrimmer<T> {
    tools: T,
}

impl<T: VideoTools> MotionTrimmer<T> {
    pub fn new(tools: T) -> Self {
        Self { tools }
    }

    fn center_frame(&self, video: &Path, at_s: f64) -> Option<PathBuf> {
        let center = media::center_frame_path(video);
        if let Err(e) = self.tools.extract_frame(video, at_s, &center) {
            warn!("Center frame of {} failed: {e}", video.display());
            let _ = fs::remove_file(&center);
            return None;
        }
        let thumb = media::thumbnail_path(&center);
        if let Err(e) = self.tools.image_thumbnail(&center, &thumb) {
            warn!("Thumbnail of {} failed: {e}", center.display());
        }
        Some(center)
    }

    /// Move `trimmed` into `video`'s name, keeping the original as backup
    /// when asked.  On failure `video` still holds a complete file.
    fn install(&self, video: &Path, trimmed: &Path, backup: bool) -> Result<(), TrimError> {
        let install_err = |source| TrimError::Install {
            path: video.to_path_buf(),
            source,
        };

        if !backup {
            return fs::rename(trimmed, video).map_err(install_err);
        }

        let backup_path = media::backup_path(video);
        fs::rename(video, &backup_path).map_err(install_err)?;
        if let Err(e) = fs::rename(trimmed, video) {
            if let Err(restore) = fs::rename(&backup_path, video) {
                warn!(
                    "Cannot restore {} from {}: {restore}",
                    video.display(),
                    backup_path.display()
                );
            }
            return Err(install_err(e));
        }
        Ok(())
    }
}

impl<T: VideoTools> ClipTrimmer for MotionTrimmer<T> {
    fn trim(&self, video: &Path, settings: &TrimSettings) -> Result<TrimOutcome, TrimError> {
        let analyse_err = |source| TrimError::Analyse {
            path: video.to_path_buf(),
            source,
        };

        let info = self.tools.probe(video).map_err(analyse_err)?;
        if !(info.fps > 0.0 && info.fps.is_finite()) {
            return Err(TrimError::BadFrameRate {
                path: video.to_path_buf(),
                fps: info.fps,
            });
        }

        let levels = self.tools.motion_levels(video, &info).map_err(analyse_err)?;
        let mask = motion_mask(&levels, settings.motion_threshold, settings.motion_min_frames);
        let Some((start, end)) = trim_window(&mask) else {
            info!("No motion in {} ({} frames), leaving it untouched", video.display(), levels.len());
            return Ok(TrimOutcome::NoMotion);
        };

        let start_s = start as f64 / info.fps;
        let end_s = (end + 1) as f64 / info.fps;
        info!(
            "Trimming {} to frames {start}..={end} ({start_s:.3}s to {end_s:.3}s of {} frames)",
            video.display(),
            levels.len()
        );

        let trimmed = media::trim_temp_path(video);
        let cut = self
            .tools
            .cut(video, &trimmed, start_s, end_s - start_s)
            .and_then(|()| match fs::metadata(&trimmed) {
                Ok(m) if m.len() > 0 => Ok(()),
                _ => Err(ToolError::InvalidOutput("trimmed clip is missing or empty".into())),
            });
        if let Err(source) = cut {
            let _ = fs::remove_file(&trimmed);
            return Err(TrimError::Cut {
                path: video.to_path_buf(),
                source,
            });
        }

        let center_index = start + (end - start) / 4;
        let center_frame = self.center_frame(video, center_index as f64 / info.fps);

        if let Err(e) = self.install(video, &trimmed, settings.backup_original) {
            let _ = fs::remove_file(&trimmed);
            if let Some(center) = &center_frame {
                let _ = fs::remove_file(media::thumbnail_path(center));
                let _ = fs::remove_file(center);
            }
            return Err(e);
        }

        let thumb = media::thumbnail_path(video);
        if let Err(e) = self.tools.video_thumbnail(video, &thumb) {
            warn!("Thumbnail of {} failed: {e}", video.display());
        }

        Ok(TrimOutcome::Trimmed(ProducedFiles {
            video: video.to_path_buf(),
            center_frame,
        }))
    }
}
