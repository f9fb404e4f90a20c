//! External codec tool invocation.
//!
//! Every call to `ffmpeg` / `ffprobe` goes through [`run_tool`], which runs
//! the process to completion and captures its exit code and stderr.
//! [`FfmpegCommand`] builds the argument lists.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

/// Failure of an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0} not found in PATH")]
    NotFound(String),

    #[error("{program} exited with code {exit_code:?}: {stderr}")]
    Failed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `program` with `args`, wait for it, and fail on a non-zero exit.
pub fn run_tool<I, S>(program: &str, args: I) -> Result<Output, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let started = Instant::now();
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ToolError::NotFound(program.to_string()),
            _ => ToolError::Io(e),
        })?;

    debug!(
        "{program} finished in {:.3}s ({})",
        started.elapsed().as_secs_f64(),
        output.status
    );

    if output.status.success() {
        Ok(output)
    } else {
        Err(ToolError::Failed {
            program: program.to_string(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Builder for a single `ffmpeg` invocation.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: String,
    output: String,
    input_args: Vec<String>,
    output_args: Vec<String>,
}

impl FfmpegCommand {
    /// `input` may be a file path or a stream URL.
    pub fn new(input: impl AsRef<OsStr>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_string_lossy().into_owned(),
            output: output.as_ref().to_string_lossy().into_owned(),
            input_args: Vec::new(),
            output_args: Vec::new(),
        }
    }

    /// Add an argument placed before `-i`.
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    /// Add an argument placed after `-i`.
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Input seek (fast, keyframe-based).
    pub fn seek(self, seconds: f64) -> Self {
        self.input_arg("-ss").input_arg(format!("{seconds:.3}"))
    }

    /// Limit the output duration.
    pub fn duration(self, seconds: f64) -> Self {
        self.output_arg("-t").output_arg(format!("{seconds:.3}"))
    }

    /// Pull RTSP over TCP.
    pub fn rtsp_tcp(self) -> Self {
        self.input_arg("-rtsp_transport").input_arg("tcp")
    }

    pub fn single_frame(self) -> Self {
        self.output_arg("-frames:v").output_arg("1")
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
        ];
        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.clone());
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.clone());
        args
    }

    pub fn run(&self) -> Result<(), ToolError> {
        let args = self.build_args();
        debug!("Running: ffmpeg {}", args.join(" "));
        run_tool("ffmpeg", &args).map(|_| ())
    }
}
