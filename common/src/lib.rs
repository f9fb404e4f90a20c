//! Types and helpers shared by the capture and processing servers.

pub mod config;
pub mod event_log;
pub mod ffmpeg;
pub mod logging;
pub mod media;
pub mod plate;
pub mod protocol;
