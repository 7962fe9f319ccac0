use std::{collections::HashMap, fs, path::Path, time::Duration};

use url::Url;

use crate::error::ClientError;

const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub events_url: Option<String>,
    pub request_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    pub completion_grace_secs: u64,
    pub access_token: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            events_url: None,
            request_timeout_secs: 30,
            reconnect_delay_ms: 1000,
            completion_grace_secs: 60,
            access_token: None,
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_secs(self.completion_grace_secs)
    }

    pub fn api_base_url(&self) -> String {
        self.server_url.trim_end_matches('/').to_string()
    }

    /// Websocket base for push streams. An explicit `events_url` wins;
    /// otherwise the server url's scheme is mapped to its websocket form.
    pub fn events_base_url(&self) -> Result<String, ClientError> {
        if let Some(explicit) = &self.events_url {
            return Ok(explicit.trim_end_matches('/').to_string());
        }

        let mut url = Url::parse(&self.server_url)
            .map_err(|err| ClientError::InvalidServerUrl(format!("{}: {err}", self.server_url)))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(ClientError::InvalidServerUrl(format!(
                    "unsupported scheme '{other}' in {}",
                    self.server_url
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidServerUrl(self.server_url.clone()))?;
        Ok(url.as_str().trim_end_matches('/').to_string())
    }
}

pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string(Path::new(SETTINGS_FILE)) {
        apply_file_overrides(&mut settings, &raw);
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        tracing::warn!(file = SETTINGS_FILE, "ignoring unparsable settings file");
        return;
    };

    let text = |key: &str| match file_cfg.get(key) {
        Some(toml::Value::String(v)) => Some(v.clone()),
        Some(toml::Value::Integer(v)) => Some(v.to_string()),
        _ => None,
    };

    if let Some(v) = text("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = text("events_url") {
        settings.events_url = Some(v);
    }
    if let Some(v) = text("request_timeout_secs").and_then(|v| v.parse().ok()) {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = text("reconnect_delay_ms").and_then(|v| v.parse().ok()) {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = text("completion_grace_secs").and_then(|v| v.parse().ok()) {
        settings.completion_grace_secs = v;
    }
    if let Some(v) = text("access_token") {
        settings.access_token = Some(v);
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__EVENTS_URL") {
        settings.events_url = Some(v);
    }
    if let Some(v) = lookup("APP__REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = lookup("APP__RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = lookup("APP__COMPLETION_GRACE_SECS").and_then(|v| v.parse().ok()) {
        settings.completion_grace_secs = v;
    }
    if let Some(v) = lookup("APP__ACCESS_TOKEN") {
        settings.access_token = Some(v);
    }
}
