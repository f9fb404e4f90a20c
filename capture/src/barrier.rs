//! Barrier notification – fired once per valid event, never awaited by the
//! webhook response.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use lpr_common::protocol::BarrierStatus;

#[derive(Debug, Serialize)]
struct BarrierRequest<'a> {
    license_plate: &'a str,
    device_id: &'a str,
}

#[derive(Clone)]
pub struct BarrierNotifier {
    client: reqwest::Client,
}

impl Default for BarrierNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BarrierNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Notify `url` (when set) on a detached task and return immediately.
    /// Without a URL the action is only logged.
    pub fn notify(&self, url: Option<&str>, license_plate: &str, device_id: &str) -> BarrierStatus {
        let Some(url) = url.filter(|u| !u.is_empty()) else {
            info!("Barrier action for {license_plate} on device {device_id} (no barrier_url, logged only)");
            return BarrierStatus {
                status: "logged".to_string(),
                message: format!("Barrier action logged for {license_plate}"),
            };
        };

        let client = self.client.clone();
        let url = url.to_string();
        let plate = license_plate.to_string();
        let device = device_id.to_string();
        tokio::spawn(async move {
            let body = BarrierRequest {
                license_plate: &plate,
                device_id: &device,
            };
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("Barrier notified for {plate} ({})", resp.status());
                }
                Ok(resp) => warn!("Barrier endpoint answered {} for {plate}", resp.status()),
                Err(e) => warn!("Barrier notification for {plate} failed: {e}"),
            }
        });

        BarrierStatus {
            status: "dispatched".to_string(),
            message: format!("Barrier notification sent for {license_plate}"),
        }
    }
}
