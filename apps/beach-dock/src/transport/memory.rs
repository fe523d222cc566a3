//! In-process connector used by tests and local demos.
//!
//! Every successful connect produces a [`MemoryPeer`] standing in for the
//! backend end of the connection. Tests pick peers up with
//! [`MemoryConnector::accept`], script frames through them and drop them to
//! simulate a lost connection. The connector also counts live links per
//! endpoint so tests can check that a channel never holds two at once.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::{ChannelRole, Connector, Endpoint, Link, TransportError};

const ROLES: [ChannelRole; 3] = [ChannelRole::Job, ChannelRole::Terminal, ChannelRole::Media];

#[derive(Default)]
struct Counters {
    live: HashMap<Endpoint, usize>,
    peak: HashMap<Endpoint, usize>,
    attempts: HashMap<ChannelRole, usize>,
    refused: HashMap<ChannelRole, String>,
}

struct Shared {
    counters: Mutex<Counters>,
    accepted_tx: HashMap<ChannelRole, mpsc::UnboundedSender<MemoryPeer>>,
    accepted_rx: HashMap<ChannelRole, AsyncMutex<mpsc::UnboundedReceiver<MemoryPeer>>>,
}

#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        let mut accepted_tx = HashMap::new();
        let mut accepted_rx = HashMap::new();
        for role in ROLES {
            let (tx, rx) = mpsc::unbounded_channel();
            accepted_tx.insert(role, tx);
            accepted_rx.insert(role, AsyncMutex::new(rx));
        }
        Self {
            shared: Arc::new(Shared {
                counters: Mutex::new(Counters::default()),
                accepted_tx,
                accepted_rx,
            }),
        }
    }

    /// Makes connects for `role` fail until [`MemoryConnector::allow`] is called.
    pub fn refuse(&self, role: ChannelRole, reason: impl Into<String>) {
        self.shared
            .counters
            .lock()
            .refused
            .insert(role, reason.into());
    }

    pub fn allow(&self, role: ChannelRole) {
        self.shared.counters.lock().refused.remove(&role);
    }

    /// Waits for the next connection made for `role`.
    ///
    /// # Panics
    ///
    /// Test helper: panics if `role` has no accept queue or the queue has
    /// closed, since the awaited connection can then never arrive.
    pub async fn accept(&self, role: ChannelRole) -> MemoryPeer {
        let Some(queue) = self.shared.accepted_rx.get(&role) else {
            panic!("no accept queue for {}", role.as_str());
        };
        let mut queue = queue.lock().await;
        match queue.recv().await {
            Some(peer) => peer,
            None => panic!("memory connector dropped"),
        }
    }

    pub fn connect_attempts(&self, role: ChannelRole) -> usize {
        self.shared
            .counters
            .lock()
            .attempts
            .get(&role)
            .copied()
            .unwrap_or(0)
    }

    pub fn live_links(&self, endpoint: &Endpoint) -> usize {
        self.shared
            .counters
            .lock()
            .live
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneously live links seen for any one endpoint.
    pub fn peak_live(&self) -> usize {
        self.shared
            .counters
            .lock()
            .peak
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, TransportError> {
        {
            let mut counters = self.shared.counters.lock();
            *counters.attempts.entry(endpoint.role).or_default() += 1;
            if let Some(reason) = counters.refused.get(&endpoint.role) {
                return Err(TransportError::Rejected {
                    url: endpoint.url.to_string(),
                    reason: reason.clone(),
                });
            }
            let live = counters.live.entry(endpoint.clone()).or_default();
            *live += 1;
            let live = *live;
            let peak = counters.peak.entry(endpoint.clone()).or_default();
            *peak = (*peak).max(live);
        }

        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            endpoint: endpoint.clone(),
            to_client,
            from_client,
        };
        let lease = LiveLease {
            shared: self.shared.clone(),
            endpoint: endpoint.clone(),
        };
        let sent = self
            .shared
            .accepted_tx
            .get(&endpoint.role)
            .map(|queue| queue.send(peer).is_ok())
            .unwrap_or(false);
        if !sent {
            return Err(TransportError::Connect {
                url: endpoint.url.to_string(),
                reason: "no listener".into(),
            });
        }
        Ok(Link::new(to_peer, from_peer).with_lease(lease))
    }
}

struct LiveLease {
    shared: Arc<Shared>,
    endpoint: Endpoint,
}

impl Drop for LiveLease {
    fn drop(&mut self) {
        let mut counters = self.shared.counters.lock();
        if let Some(live) = counters.live.get_mut(&self.endpoint) {
            *live = live.saturating_sub(1);
        }
    }
}

/// Backend side of an in-memory connection.
pub struct MemoryPeer {
    pub endpoint: Endpoint,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    pub fn send_json(&self, value: Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Next frame written by the client, `None` once the client released the link.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }

    /// Frames already written by the client, without waiting.
    pub fn drain_json(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(value) = serde_json::from_str(&text) {
                frames.push(value);
            }
        }
        frames
    }
}

impl std::fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
