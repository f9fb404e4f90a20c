//! Capture executor – one `ffmpeg` process per still image or video clip.

use std::path::Path;

use lpr_common::ffmpeg::{FfmpegCommand, ToolError};

/// Runs a single capture against a stream.  Implementations block until the
/// capture finished; the orchestrator calls them on the blocking pool.
pub trait CaptureExecutor: Send + Sync {
    fn capture_image(&self, url: &str, output: &Path) -> Result<(), ToolError>;
    fn capture_video(&self, url: &str, output: &Path, duration_s: u32) -> Result<(), ToolError>;
}

/// Captures with the `ffmpeg` binary found in `PATH`.
#[derive(Debug, Default, Clone)]
pub struct FfmpegExecutor;

/// Socket timeout options for network inputs (10 s, in microseconds).
fn timeout_args(url: &str) -> Vec<&'static str> {
    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        vec!["-timeout", "10000000"]
    } else if url.contains("://") {
        vec!["-rw_timeout", "10000000"]
    } else {
        vec![]
    }
}

fn input_command(url: &str, output: &Path) -> FfmpegCommand {
    let mut cmd = FfmpegCommand::new(url, output);
    if url.starts_with("rtsp") {
        cmd = cmd.rtsp_tcp();
    }
    for arg in timeout_args(url) {
        cmd = cmd.input_arg(arg);
    }
    cmd
}

pub fn image_command(url: &str, output: &Path) -> FfmpegCommand {
    input_command(url, output)
        .single_frame()
        .video_filter("fps=1")
        .output_args(["-f", "image2"])
}

pub fn video_command(url: &str, output: &Path, duration_s: u32) -> FfmpegCommand {
    input_command(url, output)
        .duration(f64::from(duration_s))
        .output_args(["-c:v", "copy", "-c:a", "copy", "-f", "mp4"])
}

impl CaptureExecutor for FfmpegExecutor {
    fn capture_image(&self, url: &str, output: &Path) -> Result<(), ToolError> {
        image_command(url, output).run()
    }

    fn capture_video(&self, url: &str, output: &Path, duration_s: u32) -> Result<(), ToolError> {
        video_command(url, output, duration_s).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_command() {
        let args = image_command("rtsp://10.0.0.5:7447/front", Path::new("/tmp/a.jpg")).build_args();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert!(args[..i].contains(&"-timeout".to_string()));
        assert!(args[..i].contains(&"tcp".to_string()));
        assert!(args[i..].contains(&"image2".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/a.jpg");
    }

    #[test]
    fn test_video_command() {
        let args = video_command("http://cam/stream", Path::new("v.mp4"), 8).build_args();
        assert!(args.contains(&"-rw_timeout".to_string()));
        assert!(!args.contains(&"tcp".to_string()));
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "8.000");
        assert!(args.contains(&"copy".to_string()));
    }

    #[test]
    fn test_local_file_has_no_timeout() {
        assert!(timeout_args("/dev/video0").is_empty());
    }
}
