//! UniFi Protect footage client (UniFi OS consoles).
//!
//! Per fetch:
//!   POST /api/auth/login                      → session cookie + CSRF token
//!   GET  /proxy/protect/api/cameras           → camera list
//!   GET  /proxy/protect/api/video/export?...  → MP4 per selected camera

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use lpr_common::config::ProtectConfig;

use crate::fetch::{FetchError, FetchWindow, FootageSource};

#[derive(Debug, Clone, Deserialize)]
pub struct Camera {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

struct Session {
    cookie: String,
    csrf_token: Option<String>,
}

pub struct ProtectClient {
    base_url: String,
    username: String,
    password: String,
    download_wait: Duration,
    client: Client,
}

fn status_error(status: StatusCode, what: &str) -> FetchError {
    let msg = format!("{what} returned {status}");
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        FetchError::Auth(msg)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::Transient(msg)
    } else {
        FetchError::Remote(msg)
    }
}

fn request_error(e: reqwest::Error, what: &str) -> FetchError {
    if let Some(status) = e.status() {
        return status_error(status, what);
    }
    if e.is_timeout() || e.is_connect() || e.is_request() {
        FetchError::Transient(format!("{what}: {e}"))
    } else {
        FetchError::Remote(format!("{what}: {e}"))
    }
}

/// `name=value` pairs of every `Set-Cookie` header, joined for a `Cookie`
/// header.
fn session_cookie(headers: &HeaderMap) -> String {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

/// `<name> (<last 4 of id>) - YYYY-MM-DD - HH.MM.SS±zzzz.mp4`
pub fn export_file_name(camera: &Camera, start: DateTime<Utc>) -> String {
    let name: String = camera
        .name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .collect();
    let name = if name.trim().is_empty() { "camera".to_string() } else { name };
    let id_len = camera.id.chars().count();
    let short_id: String = camera.id.chars().skip(id_len.saturating_sub(4)).collect();
    let stamp = start.with_timezone(&Local).format("%Y-%m-%d - %H.%M.%S%z");
    format!("{name} ({short_id}) - {stamp}.mp4")
}

impl ProtectClient {
    pub fn new(cfg: &ProtectConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.download_timeout_secs.max(1)))
            .danger_accept_invalid_certs(!cfg.verify_ssl)
            .build()
            .map_err(|e| FetchError::Remote(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            base_url: format!("https://{}:{}", cfg.address, cfg.port),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            download_wait: Duration::from_secs(cfg.download_wait_secs),
            client,
        })
    }

    fn authed(&self, req: RequestBuilder, session: &Session) -> RequestBuilder {
        let req = req.header(COOKIE, &session.cookie);
        match &session.csrf_token {
            Some(token) => req.header("x-csrf-token", token),
            None => req,
        }
    }

    fn send(&self, req: RequestBuilder, what: &str) -> Result<Response, FetchError> {
        let resp = req.send().map_err(|e| request_error(e, what))?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), what));
        }
        Ok(resp)
    }

    fn login(&self) -> Result<Session, FetchError> {
        let url = format!("{}/api/auth/login", self.base_url);
        let body = json!({
            "username": self.username,
            "password": self.password,
            "rememberMe": false,
        });
        let resp = self.send(self.client.post(&url).json(&body), "login")?;

        let cookie = session_cookie(resp.headers());
        if cookie.is_empty() {
            return Err(FetchError::Auth("login returned no session cookie".into()));
        }
        let csrf_token = resp
            .headers()
            .get("x-csrf-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!("Logged in to {}", self.base_url);
        Ok(Session { cookie, csrf_token })
    }

    fn cameras(&self, session: &Session) -> Result<Vec<Camera>, FetchError> {
        let url = format!("{}/proxy/protect/api/cameras", self.base_url);
        let resp = self.send(self.authed(self.client.get(&url), session), "camera list")?;
        resp.json::<Vec<Camera>>()
            .map_err(|e| FetchError::Remote(format!("camera list JSON: {e}")))
    }

    /// Export one camera's footage.  Returns the file name, or `None` when
    /// the export was empty.
    fn export(
        &self,
        session: &Session,
        camera: &Camera,
        window: &FetchWindow,
        dest: &Path,
    ) -> Result<Option<String>, FetchError> {
        let url = format!(
            "{}/proxy/protect/api/video/export?camera={}&start={}&end={}",
            self.base_url,
            camera.id,
            window.start_ms(),
            window.end_ms()
        );
        let what = format!("export of camera {}", camera.id);
        let resp = self.send(self.authed(self.client.get(&url), session), &what)?;
        let bytes = resp.bytes().map_err(|e| request_error(e, &what))?;

        if bytes.is_empty() {
            warn!("Empty export for camera {} ({})", camera.name, camera.id);
            return Ok(None);
        }

        let file_name = export_file_name(camera, window.start);
        fs::write(dest.join(&file_name), &bytes)?;
        info!("Downloaded {} ({} bytes)", file_name, bytes.len());
        Ok(Some(file_name))
    }
}

impl FootageSource for ProtectClient {
    fn fetch(
        &self,
        dest: &Path,
        window: &FetchWindow,
        cameras: Option<&[String]>,
    ) -> Result<Vec<String>, FetchError> {
        fs::create_dir_all(dest)?;
        let session = self.login()?;

        let selected: Vec<Camera> = self
            .cameras(&session)?
            .into_iter()
            .filter(|c| cameras.map_or(true, |ids| ids.iter().any(|id| id == &c.id)))
            .collect();
        if selected.is_empty() {
            warn!("No cameras match the configured camera filter");
        }

        let mut files = Vec::new();
        for (i, camera) in selected.iter().enumerate() {
            if i > 0 && !self.download_wait.is_zero() {
                std::thread::sleep(self.download_wait);
            }
            if let Some(name) = self.export(&session, camera, window, dest)? {
                files.push(name);
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_status_classes() {
        assert!(matches!(status_error(StatusCode::UNAUTHORIZED, "x"), FetchError::Auth(_)));
        assert!(matches!(status_error(StatusCode::FORBIDDEN, "x"), FetchError::Auth(_)));
        assert!(status_error(StatusCode::BAD_GATEWAY, "x").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "x").is_transient());
        assert!(matches!(status_error(StatusCode::NOT_FOUND, "x"), FetchError::Remote(_)));
    }

    #[test]
    fn test_export_file_name() {
        let camera = Camera {
            id: "5f9a1b2c3d4e5f60a1b2".into(),
            name: "Gate/Entry".into(),
        };
        let start = DateTime::from_timestamp_millis(1_748_260_785_000).unwrap();
        let name = export_file_name(&camera, start);
        assert!(name.starts_with("Gate-Entry (a1b2) - "));
        assert!(name.ends_with(".mp4"));

        let local = start.with_timezone(&Local).format("%Y-%m-%d - %H.%M.%S%z").to_string();
        assert!(name.contains(&local));
    }

    #[test]
    fn test_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("TOKEN=abc; Path=/; HttpOnly"));
        headers.append(SET_COOKIE, HeaderValue::from_static("other=1; Secure"));
        assert_eq!(session_cookie(&headers), "TOKEN=abc; other=1");
    }

    #[test]
    fn test_client_base_url() {
        let cfg = ProtectConfig {
            address: "192.168.1.1".into(),
            port: 443,
            ..ProtectConfig::default()
        };
        let client = ProtectClient::new(&cfg).unwrap();
        assert_eq!(client.base_url, "https://192.168.1.1:443");
    }
}
