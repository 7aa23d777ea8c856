use std::{fs, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

/// Engine settings: defaults, then an optional `chat.toml`, then environment
/// overrides, last writer wins.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    pub server_url: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            poll_interval_ms: 3_000,
            request_timeout_ms: 10_000,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    poll_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    event_buffer: Option<usize>,
}

pub fn load_settings() -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string("chat.toml") {
        if let Ok(file_cfg) = toml::from_str::<FileSettings>(&raw) {
            if let Some(v) = file_cfg.server_url {
                settings.server_url = v;
            }
            if let Some(v) = file_cfg.poll_interval_ms {
                settings.poll_interval_ms = v;
            }
            if let Some(v) = file_cfg.request_timeout_ms {
                settings.request_timeout_ms = v;
            }
            if let Some(v) = file_cfg.event_buffer {
                settings.event_buffer = v;
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_POLL_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.poll_interval_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_REQUEST_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT_EVENT_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_buffer = parsed;
        }
    }

    settings
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    /// Validated base url with no trailing slash; accepts only http(s).
    pub fn normalized_server_url(&self) -> Result<String> {
        let url = Url::parse(self.server_url.trim())
            .with_context(|| format!("invalid server url '{}'", self.server_url))?;
        match url.scheme() {
            "http" | "https" => {}
            other => anyhow::bail!("server url must be http or https, got '{other}'"),
        }
        Ok(self.server_url.trim().trim_end_matches('/').to_string())
    }
}
