use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::transport::channel::DEFAULT_RECONNECT_DELAY;
use crate::transport::{ChannelRole, Endpoint};

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8787";
pub const DEFAULT_MEDIA_EVENT_CAP: usize = 100;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid url '{value}': {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// Connection settings for the job and PTY backends.
#[derive(Debug, Clone)]
pub struct DockConfig {
    api_base: Url,
    stream_base: Url,
    reconnect_delay: Duration,
    media_event_cap: usize,
    ticket: Option<String>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl DockConfig {
    /// Builds a config for the HTTP API at `api_base`; the streaming base is
    /// derived from it by switching to the matching websocket scheme.
    pub fn new(api_base: impl AsRef<str>) -> Result<Self, ConfigError> {
        let api_base = normalize_base(api_base.as_ref(), "http")?;
        let stream_base = websocket_base(&api_base)?;
        Ok(Self {
            api_base,
            stream_base,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            media_event_cap: DEFAULT_MEDIA_EVENT_CAP,
            ticket: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Loads configuration from `BEACH_DOCK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api = env::var("BEACH_DOCK_API").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let mut config = Self::new(api)?;
        if let Ok(stream) = env::var("BEACH_DOCK_STREAM") {
            config = config.with_stream_base(stream)?;
        }
        if let Ok(raw) = env::var("BEACH_DOCK_RECONNECT_MS") {
            let millis = parse_number("BEACH_DOCK_RECONNECT_MS", &raw)?;
            config = config.with_reconnect_delay(Duration::from_millis(millis as u64));
        }
        if let Ok(raw) = env::var("BEACH_DOCK_MEDIA_CAP") {
            let cap = parse_number("BEACH_DOCK_MEDIA_CAP", &raw)?;
            if cap == 0 {
                return Err(ConfigError::InvalidValue {
                    var: "BEACH_DOCK_MEDIA_CAP",
                    value: raw,
                });
            }
            config = config.with_media_event_cap(cap);
        }
        if let Ok(ticket) = env::var("BEACH_DOCK_TICKET") {
            config = config.with_ticket(ticket);
        }
        Ok(config)
    }

    pub fn with_stream_base(mut self, stream_base: impl AsRef<str>) -> Result<Self, ConfigError> {
        self.stream_base = normalize_base(stream_base.as_ref(), "ws")?;
        Ok(self)
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_media_event_cap(mut self, cap: usize) -> Self {
        self.media_event_cap = cap.max(1);
        self
    }

    pub fn with_ticket(mut self, ticket: impl Into<String>) -> Self {
        let ticket = ticket.into();
        self.ticket = if ticket.trim().is_empty() {
            None
        } else {
            Some(ticket.trim().to_string())
        };
        self
    }

    pub fn api_base(&self) -> &Url {
        &self.api_base
    }

    pub fn stream_base(&self) -> &Url {
        &self.stream_base
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn media_event_cap(&self) -> usize {
        self.media_event_cap
    }

    pub fn ticket(&self) -> Option<&str> {
        self.ticket.as_deref()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// `{api}/{segments...}` for HTTP calls.
    pub fn api_url(&self, segments: &[&str]) -> Result<Url, ConfigError> {
        extend_url(&self.api_base, segments, &[], None)
    }

    pub fn job_stream_endpoint(&self, job_id: &str) -> Result<Endpoint, ConfigError> {
        let url = extend_url(
            &self.stream_base,
            &["jobs", job_id, "stream"],
            &[],
            self.ticket(),
        )?;
        Ok(Endpoint::new(ChannelRole::Job, url))
    }

    pub fn terminal_endpoint(&self, workspace: &str) -> Result<Endpoint, ConfigError> {
        let url = extend_url(
            &self.stream_base,
            &["terminal"],
            &[("workspace", workspace)],
            self.ticket(),
        )?;
        Ok(Endpoint::new(ChannelRole::Terminal, url))
    }

    pub fn media_endpoint(&self, workspace: &str) -> Result<Endpoint, ConfigError> {
        let url = extend_url(
            &self.stream_base,
            &["media"],
            &[("workspace", workspace)],
            self.ticket(),
        )?;
        Ok(Endpoint::new(ChannelRole::Media, url))
    }
}

impl Default for DockConfig {
    fn default() -> Self {
        let api_base = Url::parse("http://127.0.0.1:8787/").unwrap_or_else(|_| unreachable!());
        let stream_base = Url::parse("ws://127.0.0.1:8787/").unwrap_or_else(|_| unreachable!());
        Self {
            api_base,
            stream_base,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            media_event_cap: DEFAULT_MEDIA_EVENT_CAP,
            ticket: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn parse_number(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            value: raw.to_string(),
        })
}

fn normalize_base(raw: &str, default_scheme: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidUrl {
            value: raw.to_string(),
            reason: "url cannot be empty".into(),
        });
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{default_scheme}://{trimmed}")
    };
    // Normalize localhost to IPv4 to avoid resolving to ::1 first.
    let with_scheme = with_scheme.replacen("://localhost", "://127.0.0.1", 1);
    let mut url = Url::parse(&with_scheme).map_err(|err| ConfigError::InvalidUrl {
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidUrl {
            value: raw.to_string(),
            reason: "url cannot be used as a base".into(),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn websocket_base(api_base: &Url) -> Result<Url, ConfigError> {
    let scheme = match api_base.scheme() {
        "https" => "wss",
        "http" => "ws",
        "ws" | "wss" => return Ok(api_base.clone()),
        other => {
            return Err(ConfigError::InvalidUrl {
                value: api_base.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            });
        }
    };
    let mut url = api_base.clone();
    url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
        value: api_base.to_string(),
        reason: format!("cannot switch scheme to {scheme}"),
    })?;
    Ok(url)
}

fn extend_url(
    base: &Url,
    segments: &[&str],
    query: &[(&str, &str)],
    ticket: Option<&str>,
) -> Result<Url, ConfigError> {
    let mut url = base.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| ConfigError::InvalidUrl {
            value: base.to_string(),
            reason: "url cannot be used as a base".into(),
        })?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    if !query.is_empty() || ticket.is_some() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
        if let Some(ticket) = ticket {
            pairs.append_pair("ticket", ticket);
        }
    }
    Ok(url)
}
