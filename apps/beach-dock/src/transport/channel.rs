//! Reconnecting duplex channel.
//!
//! `TransportChannel::open` establishes the first connection itself so a
//! rejected ticket or unreachable backend surfaces to the caller. After that a
//! supervisor task owns the connection: inbound frames become
//! [`ChannelEvent::Message`]s, and an unexpected close is followed by a fixed
//! delay and a reconnect to the same endpoint until the channel is closed.
//! The supervisor never holds more than one link, and the old link is dropped
//! before the next connect starts.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ChannelEvent, ChannelId, Connector, Endpoint, Link, TransportError};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub reconnect_delay: Duration,
    /// Cancelling this token closes the channel. Callers that need to
    /// interrupt a stream from elsewhere pass their own token.
    pub shutdown: CancellationToken,
}

impl ChannelOptions {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            reconnect_delay,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_DELAY)
    }
}

pub struct TransportChannel {
    id: ChannelId,
    endpoint: Endpoint,
    queue: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl TransportChannel {
    pub async fn open<E>(
        id: ChannelId,
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<E>,
        options: ChannelOptions,
    ) -> Result<Self, TransportError>
    where
        E: From<ChannelEvent> + Send + 'static,
    {
        let ChannelOptions {
            reconnect_delay,
            shutdown,
        } = options;

        let link = tokio::select! {
            _ = shutdown.cancelled() => return Err(TransportError::Closed(id)),
            result = connector.connect(&endpoint) => result?,
        };
        debug!(channel = %id, endpoint = %endpoint, "channel opened");

        let (queue, queued) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            id,
            endpoint: endpoint.clone(),
            connector,
            events,
            reconnect_delay,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(supervisor.run(link, queued));

        Ok(Self {
            id,
            endpoint,
            queue,
            shutdown,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Queues a frame. Frames sent while the link is down are held and
    /// written in order once the channel reconnects.
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed(self.id));
        }
        self.queue
            .send(text)
            .map_err(|_| TransportError::Closed(self.id))
    }

    pub fn send<T: Serialize>(&self, frame: &T) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(frame).map_err(|err| TransportError::Encode(err.to_string()))?;
        self.send_text(text)
    }

    /// Closes the channel. Frames already queued are flushed to a live link
    /// before it is released; no reconnect follows.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(channel = %self.id, "closing channel");
            self.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum PumpExit {
    Shutdown,
    Lost(String),
}

struct Supervisor<E> {
    id: ChannelId,
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<E>,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
}

impl<E> Supervisor<E>
where
    E: From<ChannelEvent> + Send + 'static,
{
    async fn run(self, first: Link, mut queued: mpsc::UnboundedReceiver<String>) {
        let mut link = first;
        // A frame taken off the queue whose write failed; retried on the next link.
        let mut carry: Option<String> = None;
        loop {
            let reason = match self.pump(link, &mut queued, &mut carry).await {
                PumpExit::Shutdown => break,
                PumpExit::Lost(reason) => reason,
            };
            info!(channel = %self.id, endpoint = %self.endpoint, %reason, "channel lost");
            if !self.emit(ChannelEvent::Disconnected {
                channel: self.id,
                reason,
            }) {
                break;
            }
            link = match self.reconnect().await {
                Some(next) => next,
                None => break,
            };
            if !self.emit(ChannelEvent::Reconnected { channel: self.id }) {
                break;
            }
        }
        debug!(channel = %self.id, "channel supervisor finished");
    }

    async fn pump(
        &self,
        mut link: Link,
        queued: &mut mpsc::UnboundedReceiver<String>,
        carry: &mut Option<String>,
    ) -> PumpExit {
        if let Some(text) = carry.take() {
            if let Err(err) = link.outbound.send(text) {
                *carry = Some(err.0);
                return PumpExit::Lost("connection dropped while sending".into());
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    while let Ok(text) = queued.try_recv() {
                        if link.outbound.send(text).is_err() {
                            break;
                        }
                    }
                    return PumpExit::Shutdown;
                }
                frame = link.inbound.recv() => match frame {
                    Some(text) => {
                        trace!(channel = %self.id, bytes = text.len(), "frame received");
                        if !self.emit(ChannelEvent::Message { channel: self.id, text }) {
                            return PumpExit::Shutdown;
                        }
                    }
                    None => return PumpExit::Lost("connection closed by peer".into()),
                },
                next = queued.recv() => match next {
                    Some(text) => {
                        if let Err(err) = link.outbound.send(text) {
                            *carry = Some(err.0);
                            return PumpExit::Lost("connection dropped while sending".into());
                        }
                    }
                    None => return PumpExit::Shutdown,
                },
            }
        }
    }

    async fn reconnect(&self) -> Option<Link> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = sleep(self.reconnect_delay) => {}
            }
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                result = self.connector.connect(&self.endpoint) => result,
            };
            match result {
                Ok(link) => {
                    info!(channel = %self.id, attempt, "channel reconnected");
                    return Some(link);
                }
                Err(err) => {
                    warn!(channel = %self.id, attempt, error = %err, "reconnect attempt failed");
                }
            }
        }
    }

    fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(E::from(event)).is_ok()
    }
}
