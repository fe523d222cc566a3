use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod channel;
pub mod memory;
pub mod websocket;

pub use channel::{ChannelOptions, TransportChannel};

/// What a channel carries. Jobs get one stream each; terminal and media
/// channels are shared by every terminal session of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Job,
    Terminal,
    Media,
}

impl ChannelRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelRole::Job => "job",
            ChannelRole::Terminal => "terminal",
            ChannelRole::Media => "media",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Where a channel connects. Reconnects reuse the same endpoint verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub role: ChannelRole,
    pub url: Url,
}

impl Endpoint {
    pub fn new(role: ChannelRole, url: Url) -> Self {
        Self { role, url }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.role.as_str(), self.url)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection to {url} rejected: {reason}")]
    Rejected { url: String, reason: String },
    #[error("{0} is closed")]
    Closed(ChannelId),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// One established connection.
///
/// Text frames pushed into `outbound` are written to the peer; frames from the
/// peer arrive on `inbound`, which yields `None` once the connection is gone.
/// Dropping the link releases the connection.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
    _lease: Option<Box<dyn Send + Sync>>,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            _lease: None,
        }
    }

    /// Attaches a value that lives exactly as long as the link.
    pub fn with_lease(mut self, lease: impl Send + Sync + 'static) -> Self {
        self._lease = Some(Box::new(lease));
        self
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("outbound_closed", &self.outbound.is_closed())
            .finish()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, TransportError>;
}

/// Notifications a channel supervisor posts to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message { channel: ChannelId, text: String },
    Disconnected { channel: ChannelId, reason: String },
    Reconnected { channel: ChannelId },
}

impl ChannelEvent {
    pub fn channel(&self) -> ChannelId {
        match self {
            ChannelEvent::Message { channel, .. }
            | ChannelEvent::Disconnected { channel, .. }
            | ChannelEvent::Reconnected { channel } => *channel,
        }
    }
}
