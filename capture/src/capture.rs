//! Concurrent capture orchestrator.
//!
//! A valid webhook event either
//! * (inline mode) fans out into image/video captures across every stream
//!   configured for the device, run concurrently but bounded by a shared
//!   semaphore, or
//! * (pull mode) is written as an event-log record for the processing
//!   server to fetch footage for later.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lpr_common::config::{CaptureMode, Config, StreamConfig};
use lpr_common::event_log::{self, EventLogRecord};
use lpr_common::protocol::{WebhookPayload, WebhookResponse};

use crate::barrier::BarrierNotifier;
use crate::executor::CaptureExecutor;
use crate::trigger::ValidTrigger;

// ── data model ───────────────────────────────────────────────────────────

/// Capture settings for one stream, fixed at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub stream_name: String,
    pub rtsp_url: String,
    pub initial_delay: Duration,
    pub interval: Duration,
    pub image_count: u32,
    /// Seconds; 0 means no video.
    pub video_duration: u32,
}

impl CaptureRequest {
    pub fn from_stream(stream: &StreamConfig) -> Self {
        Self {
            stream_name: stream.name.clone(),
            rtsp_url: stream.url.clone(),
            initial_delay: Duration::from_millis(stream.initial_delay_ms),
            interval: Duration::from_millis(stream.interval_ms),
            image_count: stream.num_images,
            video_duration: stream.video_duration_s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Success,
    Error,
    /// Never started (server shutting down).
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureResult {
    pub kind: CaptureKind,
    pub output_path: PathBuf,
    pub status: CaptureStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One scheduled capture.
#[derive(Debug, Clone)]
pub struct PlannedCapture {
    pub kind: CaptureKind,
    pub rtsp_url: String,
    pub output_path: PathBuf,
    pub delay: Duration,
    pub video_duration: u32,
}

impl PlannedCapture {
    fn result(&self, status: CaptureStatus, error: Option<String>) -> CaptureResult {
        CaptureResult {
            kind: self.kind,
            output_path: self.output_path.clone(),
            status,
            error,
        }
    }
}

/// Response body plus the individual results behind it.
#[derive(Debug, Clone)]
pub struct CaptureSummary {
    pub response: WebhookResponse,
    pub results: Vec<CaptureResult>,
}

impl CaptureSummary {
    fn without_captures(response: WebhookResponse) -> Self {
        Self {
            response,
            results: Vec::new(),
        }
    }
}

// ── planning ─────────────────────────────────────────────────────────────

/// Expand stream requests into individual captures.
///
/// Images of stream `s` are named `<dir>/<label>_<s>_<n>.jpg` (n from 1) and
/// start at `initial_delay + i*interval`; the optional video is
/// `<dir>/<label>_<s>_video.mp4` and starts immediately.
pub fn plan_captures(requests: &[CaptureRequest], dir: &Path, label: &str) -> Vec<PlannedCapture> {
    let mut plan = Vec::new();
    for req in requests {
        let base = format!("{label}_{}", req.stream_name);
        for i in 0..req.image_count {
            plan.push(PlannedCapture {
                kind: CaptureKind::Image,
                rtsp_url: req.rtsp_url.clone(),
                output_path: dir.join(format!("{base}_{}.jpg", i + 1)),
                delay: req.initial_delay.saturating_add(req.interval.saturating_mul(i)),
                video_duration: 0,
            });
        }
        if req.video_duration > 0 {
            plan.push(PlannedCapture {
                kind: CaptureKind::Video,
                rtsp_url: req.rtsp_url.clone(),
                output_path: dir.join(format!("{base}_video.mp4")),
                delay: Duration::ZERO,
                video_duration: req.video_duration,
            });
        }
    }
    plan
}

// ── execution ────────────────────────────────────────────────────────────

async fn run_one(
    capture: PlannedCapture,
    executor: Arc<dyn CaptureExecutor>,
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
) -> CaptureResult {
    tokio::select! {
        _ = cancel.cancelled() => return capture.result(CaptureStatus::Skipped, None),
        _ = tokio::time::sleep(capture.delay) => {}
    }

    let permit = tokio::select! {
        _ = cancel.cancelled() => return capture.result(CaptureStatus::Skipped, None),
        permit = limit.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return capture.result(CaptureStatus::Skipped, None),
        },
    };

    let job = capture.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        match job.kind {
            CaptureKind::Image => executor.capture_image(&job.rtsp_url, &job.output_path),
            CaptureKind::Video => {
                executor.capture_video(&job.rtsp_url, &job.output_path, job.video_duration)
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => {
            info!("Captured {}", capture.output_path.display());
            capture.result(CaptureStatus::Success, None)
        }
        Ok(Err(e)) => {
            error!("Capture {} failed: {e}", capture.output_path.display());
            let msg = format!("Failed to capture from {}: {e}", capture.rtsp_url);
            capture.result(CaptureStatus::Error, Some(msg))
        }
        Err(e) => capture.result(CaptureStatus::Error, Some(format!("capture task failed: {e}"))),
    }
}

/// Run every planned capture concurrently and collect the results in plan
/// order.  At most `limit` captures hold an external process at a time.
pub async fn run_captures(
    plan: Vec<PlannedCapture>,
    executor: Arc<dyn CaptureExecutor>,
    limit: Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Vec<CaptureResult> {
    let handles: Vec<_> = plan
        .into_iter()
        .map(|capture| {
            let fallback = capture.clone();
            let handle = tokio::spawn(run_one(
                capture,
                executor.clone(),
                limit.clone(),
                cancel.clone(),
            ));
            (fallback, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (capture, handle) in handles {
        let result = match handle.await {
            Ok(r) => r,
            Err(e) => capture.result(CaptureStatus::Error, Some(format!("capture task failed: {e}"))),
        };
        results.push(result);
    }
    results
}

// ── event handling ───────────────────────────────────────────────────────

pub struct Orchestrator {
    executor: Arc<dyn CaptureExecutor>,
    limit: Arc<Semaphore>,
    barrier: BarrierNotifier,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        executor: Arc<dyn CaptureExecutor>,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
            barrier: BarrierNotifier::new(),
            cancel,
        }
    }

    /// Handle one webhook event against a config snapshot.
    ///
    /// Returns `Err` only for internal failures; every other outcome
    /// (missing data, ignored plate, failed captures) is a normal response.
    pub async fn handle_event(&self, config: &Config, payload: &WebhookPayload) -> Result<CaptureSummary> {
        let trigger = match ValidTrigger::from_payload(payload) {
            Ok(t) => t,
            Err(e) => {
                warn!("Rejected webhook: {e}");
                return Ok(CaptureSummary::without_captures(WebhookResponse::missing_data()));
            }
        };
        info!(
            "Event: plate={} device={} key={} ts={}",
            trigger.license_plate, trigger.device_id, trigger.key, trigger.timestamp_ms
        );

        let barrier = self.barrier.notify(
            config.server.barrier_url.as_deref(),
            &trigger.license_plate,
            &trigger.device_id,
        );

        if config.is_ignored(&trigger.license_plate) {
            info!("Plate {} is on the ignore list; skipping capture", trigger.license_plate);
            return Ok(CaptureSummary::without_captures(WebhookResponse {
                status: "skipped".to_string(),
                barrier: Some(barrier),
                message: Some(format!("Imaging skipped for ignored plate {}", trigger.license_plate)),
                ..WebhookResponse::default()
            }));
        }

        let mut summary = match config.server.mode {
            CaptureMode::Pull => self.record_event(config, &trigger),
            CaptureMode::Inline => self.capture_inline(config, &trigger).await?,
        };
        summary.response.barrier = Some(barrier);
        Ok(summary)
    }

    fn record_event(&self, config: &Config, trigger: &ValidTrigger) -> CaptureSummary {
        let record = EventLogRecord::new(&trigger.safe_plate, trigger.timestamp_ms);
        let written = event_log::write_record(
            &config.paths.image_dir,
            &config.pull.log_prefix,
            &config.pull.log_suffix,
            &record,
        );
        let log_file_path = match written {
            Ok(path) => {
                info!("Event log record created: {}", path.display());
                Some(path.to_string_lossy().into_owned())
            }
            Err(e) => {
                error!("Failed to create event log record: {e:#}");
                None
            }
        };

        CaptureSummary::without_captures(WebhookResponse {
            message: Some(format!(
                "license {} received at {}",
                trigger.license_plate,
                Local::now().format("%H:%M:%S")
            )),
            log_file_created: Some(log_file_path.is_some()),
            log_file_path,
            ..WebhookResponse::received()
        })
    }

    async fn capture_inline(&self, config: &Config, trigger: &ValidTrigger) -> Result<CaptureSummary> {
        let streams = config.streams_for(&trigger.device_id);
        if streams.is_empty() {
            warn!("No RTSP streams mapped for device {}", trigger.device_id);
            return Ok(CaptureSummary::without_captures(WebhookResponse {
                error: Some(format!("No RTSP streams for device {}", trigger.device_id)),
                ..WebhookResponse::received()
            }));
        }

        let dir = config.plate_dir(&trigger.safe_plate);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;

        let requests: Vec<CaptureRequest> = streams.iter().map(CaptureRequest::from_stream).collect();
        let label = format!("{}_{}", trigger.file_label(), trigger.safe_plate);
        let plan = plan_captures(&requests, &dir, &label);
        info!(
            "Scheduling {} captures across {} streams for {}",
            plan.len(),
            requests.len(),
            trigger.license_plate
        );

        let results = run_captures(plan, self.executor.clone(), self.limit.clone(), &self.cancel).await;

        let paths = |kind: CaptureKind| -> Vec<String> {
            results
                .iter()
                .filter(|r| r.kind == kind && r.status == CaptureStatus::Success)
                .map(|r| r.output_path.to_string_lossy().into_owned())
                .collect()
        };
        let errors: Vec<String> = results.iter().filter_map(|r| r.error.clone()).collect();

        let response = WebhookResponse {
            images: paths(CaptureKind::Image),
            videos: paths(CaptureKind::Video),
            errors: (!errors.is_empty()).then_some(errors),
            ..WebhookResponse::received()
        };
        Ok(CaptureSummary { response, results })
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use lpr_common::config::IgnoredPlate;
    use lpr_common::ffmpeg::ToolError;

    /// Counts calls, tracks peak concurrency, fails URLs containing "bad".
    #[derive(Default)]
    struct FakeExecutor {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        hold: Duration,
    }

    impl FakeExecutor {
        fn run(&self, url: &str) -> Result<(), ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.hold);
            self.running.fetch_sub(1, Ordering::SeqCst);
            if url.contains("bad") {
                Err(ToolError::Failed {
                    program: "ffmpeg".into(),
                    exit_code: Some(1),
                    stderr: "connection refused".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    impl CaptureExecutor for FakeExecutor {
        fn capture_image(&self, url: &str, _output: &Path) -> Result<(), ToolError> {
            self.run(url)
        }
        fn capture_video(&self, url: &str, _output: &Path, _d: u32) -> Result<(), ToolError> {
            self.run(url)
        }
    }

    fn stream(name: &str, url: &str, images: u32, video: u32) -> StreamConfig {
        StreamConfig {
            name: name.into(),
            url: url.into(),
            initial_delay_ms: 0,
            num_images: images,
            interval_ms: 10,
            video_duration_s: video,
        }
    }

    fn config(dir: &Path, mode: CaptureMode, streams: Vec<StreamConfig>) -> Config {
        let mut config = Config::default();
        config.paths.image_dir = dir.to_path_buf();
        config.server.mode = mode;
        config.rtsp_streams.insert("dev1".into(), streams);
        config
    }

    fn payload(device: &str, plate: &str) -> WebhookPayload {
        let body = serde_json::json!({
            "alarm": {"triggers": [{"device": device, "key": "license_plate",
                "value": plate, "timestamp": 1748260800000i64}]}
        });
        WebhookPayload::from_bytes(body.to_string().as_bytes())
    }

    fn orchestrator(exec: Arc<FakeExecutor>, limit: usize) -> Orchestrator {
        Orchestrator::new(exec, limit, CancellationToken::new())
    }

    #[test]
    fn test_plan_counts_and_delays() {
        let requests = vec![
            CaptureRequest::from_stream(&stream("front", "rtsp://a", 3, 5)),
            CaptureRequest::from_stream(&stream("side", "rtsp://b", 3, 5)),
        ];
        let plan = plan_captures(&requests, Path::new("/img/P1"), "2025-05-26_12-00-00-000_P1");
        let images: Vec<_> = plan.iter().filter(|c| c.kind == CaptureKind::Image).collect();
        let videos: Vec<_> = plan.iter().filter(|c| c.kind == CaptureKind::Video).collect();
        assert_eq!(images.len(), 6);
        assert_eq!(videos.len(), 2);
        assert_eq!(images[2].delay, Duration::from_millis(20));
        assert_eq!(
            images[0].output_path,
            PathBuf::from("/img/P1/2025-05-26_12-00-00-000_P1_front_1.jpg")
        );
        assert_eq!(
            videos[1].output_path,
            PathBuf::from("/img/P1/2025-05-26_12-00-00-000_P1_side_video.mp4")
        );
    }

    #[test]
    fn test_plan_delays_saturate() {
        let mut huge = stream("front", "rtsp://a", 3, 0);
        huge.initial_delay_ms = u64::MAX;
        huge.interval_ms = u64::MAX;
        let plan = plan_captures(&[CaptureRequest::from_stream(&huge)], Path::new("/x"), "L");
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[2].delay, Duration::MAX);
    }

    #[test]
    fn test_no_video_when_duration_zero() {
        let plan = plan_captures(
            &[CaptureRequest::from_stream(&stream("front", "rtsp://a", 2, 0))],
            Path::new("/x"),
            "l",
        );
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|c| c.kind == CaptureKind::Image));
    }

    #[tokio::test]
    async fn test_inline_captures_all_streams() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            CaptureMode::Inline,
            vec![stream("front", "rtsp://a", 3, 4), stream("side", "rtsp://b", 3, 4)],
        );
        let exec = Arc::new(FakeExecutor::default());
        let summary = orchestrator(exec.clone(), 4)
            .handle_event(&cfg, &payload("dev1", "ABC123"))
            .await
            .unwrap();

        assert_eq!(exec.calls.load(Ordering::SeqCst), 8);
        assert_eq!(summary.results.len(), 8);
        assert_eq!(summary.response.images.len(), 6);
        assert_eq!(summary.response.videos.len(), 2);
        assert!(summary.response.errors.is_none());
        assert!(dir.path().join("ABC123").is_dir());
    }

    #[tokio::test]
    async fn test_failed_stream_does_not_stop_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            CaptureMode::Inline,
            vec![stream("front", "rtsp://bad", 2, 0), stream("side", "rtsp://ok", 2, 0)],
        );
        let exec = Arc::new(FakeExecutor::default());
        let summary = orchestrator(exec.clone(), 4)
            .handle_event(&cfg, &payload("dev1", "ABC123"))
            .await
            .unwrap();

        assert_eq!(summary.results.len(), 4);
        assert_eq!(summary.response.images.len(), 2);
        assert_eq!(summary.response.errors.as_ref().map(Vec::len), Some(2));
        assert!(summary
            .results
            .iter()
            .filter(|r| r.status == CaptureStatus::Error)
            .all(|r| r.error.as_deref().unwrap_or("").contains("connection refused")));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = stream("s", "rtsp://a", 6, 0);
        s.interval_ms = 0;
        let cfg = config(dir.path(), CaptureMode::Inline, vec![s]);
        let exec = Arc::new(FakeExecutor {
            hold: Duration::from_millis(30),
            ..FakeExecutor::default()
        });
        orchestrator(exec.clone(), 2)
            .handle_event(&cfg, &payload("dev1", "ABC123"))
            .await
            .unwrap();

        assert_eq!(exec.calls.load(Ordering::SeqCst), 6);
        assert!(exec.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_missing_data_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), CaptureMode::Inline, vec![stream("s", "rtsp://a", 2, 2)]);
        let exec = Arc::new(FakeExecutor::default());
        let orch = orchestrator(exec.clone(), 4);

        let no_plate = WebhookPayload::from_bytes(
            br#"{"alarm":{"triggers":[{"device":"dev1","key":"k","timestamp":1}]}}"#,
        );
        let summary = orch.handle_event(&cfg, &no_plate).await.unwrap();
        assert_eq!(summary.response, WebhookResponse::missing_data());

        let summary = orch
            .handle_event(&cfg, &WebhookPayload::from_bytes(b"garbage"))
            .await
            .unwrap();
        assert!(summary.response.images.is_empty());
        assert!(summary.response.videos.is_empty());
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ignored_plate_skips_capture() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), CaptureMode::Inline, vec![stream("s", "rtsp://a", 2, 0)]);
        cfg.ignored_plates.push(IgnoredPlate::Plain("abc-123".into()));
        let exec = Arc::new(FakeExecutor::default());
        let summary = orchestrator(exec.clone(), 4)
            .handle_event(&cfg, &payload("dev1", "ABC123"))
            .await
            .unwrap();

        assert_eq!(summary.response.status, "skipped");
        assert!(summary.response.barrier.is_some());
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_device_reports_no_streams() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), CaptureMode::Inline, vec![stream("s", "rtsp://a", 2, 0)]);
        let exec = Arc::new(FakeExecutor::default());
        let summary = orchestrator(exec.clone(), 4)
            .handle_event(&cfg, &payload("other", "ABC123"))
            .await
            .unwrap();

        assert_eq!(summary.response.error.as_deref(), Some("No RTSP streams for device other"));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pull_mode_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), CaptureMode::Pull, vec![]);
        let exec = Arc::new(FakeExecutor::default());
        let summary = orchestrator(exec.clone(), 4)
            .handle_event(&cfg, &payload("dev1", "ABC123"))
            .await
            .unwrap();

        assert_eq!(summary.response.log_file_created, Some(true));
        let path = PathBuf::from(summary.response.log_file_path.unwrap());
        assert_eq!(path.parent().unwrap(), dir.path());
        let records = event_log::read_records(&path).unwrap();
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.license_plate, "ABC123");
        assert_eq!(record.event_timestamp_ms, 1_748_260_800_000);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_captures_are_skipped() {
        let exec: Arc<dyn CaptureExecutor> = Arc::new(FakeExecutor::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut req = CaptureRequest::from_stream(&stream("s", "rtsp://a", 2, 0));
        req.initial_delay = Duration::from_secs(60);
        let plan = plan_captures(&[req], Path::new("/x"), "l");

        let results = run_captures(plan, exec, Arc::new(Semaphore::new(1)), &cancel).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == CaptureStatus::Skipped));
    }
}
