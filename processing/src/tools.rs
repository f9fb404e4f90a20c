//! Video tool seam used by the trim engine.
//!
//! [`FfmpegTools`] shells out to `ffprobe` / `ffmpeg` and resizes stills
//! with the `image` crate.  Tests substitute their own [`VideoTools`].

use std::io::{BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use serde::Deserialize;
use tracing::debug;

use lpr_common::ffmpeg::{run_tool, FfmpegCommand, ToolError};
use lpr_common::media::{THUMB_QUALITY, THUMB_SIZE};

use crate::motion::MotionLevels;

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Seconds; 0.0 when the container does not say.
    pub duration: f64,
}

pub trait VideoTools {
    fn probe(&self, video: &Path) -> Result<VideoInfo, ToolError>;

    /// One motion level per decoded frame (see [`crate::motion`]).
    fn motion_levels(&self, video: &Path, info: &VideoInfo) -> Result<Vec<f64>, ToolError>;

    /// Stream-copy `[start_s, start_s + duration_s)` of `src` into `dst`.
    fn cut(&self, src: &Path, dst: &Path, start_s: f64, duration_s: f64) -> Result<(), ToolError>;

    /// Write the frame at `at_s` as a JPEG.
    fn extract_frame(&self, src: &Path, at_s: f64, dst: &Path) -> Result<(), ToolError>;

    /// Scale an image file to the thumbnail size.
    fn image_thumbnail(&self, src: &Path, dst: &Path) -> Result<(), ToolError>;

    /// Thumbnail of the first frame of a video.
    fn video_thumbnail(&self, src: &Path, dst: &Path) -> Result<(), ToolError>;
}

// ── ffprobe JSON ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// Parse a frame rate such as `"30/1"`, `"30000/1001"` or `"29.97"`.
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    let fps = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den <= 0.0 {
                return None;
            }
            num / den
        }
        None => s.trim().parse().ok()?,
    };
    (fps > 0.0 && fps.is_finite()).then_some(fps)
}

fn parse_probe(json: &[u8]) -> Result<VideoInfo, ToolError> {
    let probe: FfprobeOutput = serde_json::from_slice(json)
        .map_err(|e| ToolError::InvalidOutput(format!("ffprobe JSON: {e}")))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ToolError::InvalidOutput("no video stream".into()))?;

    let fps = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .ok_or_else(|| ToolError::InvalidOutput("unknown frame rate".into()))?;

    let duration = probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(VideoInfo {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps,
        duration,
    })
}

fn image_error(e: image::ImageError) -> ToolError {
    ToolError::InvalidOutput(format!("image: {e}"))
}

fn write_jpeg(img: &RgbImage, dst: &Path, quality: u8) -> Result<(), ToolError> {
    let file = std::fs::File::create(dst)?;
    let mut writer = std::io::BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality)
        .encode_image(img)
        .map_err(image_error)
}

// ── ffmpeg implementation ────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct FfmpegTools;

impl VideoTools for FfmpegTools {
    fn probe(&self, video: &Path) -> Result<VideoInfo, ToolError> {
        let mut args = vec![
            "-v".to_string(),
            "quiet".into(),
            "-print_format".into(),
            "json".into(),
            "-show_format".into(),
            "-show_streams".into(),
        ];
        args.push(video.to_string_lossy().into_owned());
        let output = run_tool("ffprobe", &args)?;
        parse_probe(&output.stdout)
    }

    fn motion_levels(&self, video: &Path, info: &VideoInfo) -> Result<Vec<f64>, ToolError> {
        let frame_len = info.width as usize * info.height as usize;
        if frame_len == 0 {
            return Err(ToolError::InvalidOutput("video has no frame size".into()));
        }

        let args = FfmpegCommand::new(video, "-")
            .output_args(["-an", "-f", "rawvideo", "-pix_fmt", "gray"])
            .build_args();
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ToolError::NotFound("ffmpeg".into()),
                _ => ToolError::Io(e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::InvalidOutput("ffmpeg stdout not captured".into()))?;
        let mut reader = BufReader::new(stdout);
        let frames = std::iter::from_fn(|| {
            let mut buf = vec![0u8; frame_len];
            reader.read_exact(&mut buf).ok().map(|_| buf)
        });
        let levels: Vec<f64> = MotionLevels::new(frames).collect();
        drop(reader);

        let status = child.wait()?;
        if levels.is_empty() {
            return Err(ToolError::Failed {
                program: "ffmpeg".into(),
                exit_code: status.code(),
                stderr: "no frames decoded".into(),
            });
        }
        debug!("{}: {} frames analysed", video.display(), levels.len());
        Ok(levels)
    }

    fn cut(&self, src: &Path, dst: &Path, start_s: f64, duration_s: f64) -> Result<(), ToolError> {
        FfmpegCommand::new(src, dst)
            .seek(start_s)
            .duration(duration_s)
            .output_args(["-c", "copy", "-avoid_negative_ts", "make_zero", "-fflags", "+genpts"])
            .run()
    }

    fn extract_frame(&self, src: &Path, at_s: f64, dst: &Path) -> Result<(), ToolError> {
        FfmpegCommand::new(src, dst)
            .seek(at_s)
            .single_frame()
            .output_args(["-q:v", "5"])
            .run()
    }

    fn image_thumbnail(&self, src: &Path, dst: &Path) -> Result<(), ToolError> {
        let (w, h) = THUMB_SIZE;
        let thumb = image::open(src)
            .map_err(image_error)?
            .resize_exact(w, h, FilterType::Triangle)
            .to_rgb8();
        write_jpeg(&thumb, dst, THUMB_QUALITY)
    }

    fn video_thumbnail(&self, src: &Path, dst: &Path) -> Result<(), ToolError> {
        let (w, h) = THUMB_SIZE;
        let args = FfmpegCommand::new(src, "-")
            .single_frame()
            .video_filter(format!("scale={w}:{h}"))
            .output_args(["-an", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .build_args();
        let output = run_tool("ffmpeg", &args)?;
        let thumb = RgbImage::from_raw(w, h, output.stdout)
            .ok_or_else(|| ToolError::InvalidOutput("short thumbnail frame".into()))?;
        write_jpeg(&thumb, dst, THUMB_QUALITY)
    }
}
