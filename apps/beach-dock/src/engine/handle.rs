use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{Command, Control, Engine, EngineEvent, Reply};
use crate::backend::{HttpJobBackend, JobBackend};
use crate::config::DockConfig;
use crate::error::DockError;
use crate::protocol::MediaKind;
use crate::session::{SessionId, SessionNotice, SessionSnapshot, Tab, TabId};
use crate::transport::Connector;
use crate::transport::websocket::WebSocketConnector;

const NOTICE_CAPACITY: usize = 1024;

/// Asks the engine to stop once the last handle is gone.
struct EngineGuard {
    inbox: mpsc::UnboundedSender<EngineEvent>,
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        let _ = self
            .inbox
            .send(EngineEvent::Command(Command::Shutdown { reply: None }));
    }
}

/// Cloneable front end to the session engine.
///
/// Every call is answered by the engine task in the order it was issued.
/// Controls (`cancel`, `kill`, `signal`, `resize`, `send_stdin`) only queue
/// the request; their effect shows up in later snapshots and notices.
#[derive(Clone)]
pub struct DockHandle {
    inbox: mpsc::UnboundedSender<EngineEvent>,
    notices: broadcast::Sender<SessionNotice>,
    _guard: Arc<EngineGuard>,
}

impl DockHandle {
    /// Engine talking to real backends over HTTP and WebSocket.
    pub fn connect(config: DockConfig) -> Result<Self, DockError> {
        let backend = HttpJobBackend::new(&config)?;
        Ok(Self::spawn(
            config,
            Arc::new(WebSocketConnector::new()),
            Arc::new(backend),
        ))
    }

    /// Spawns the engine task on the current tokio runtime.
    pub fn spawn(
        config: DockConfig,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn JobBackend>,
    ) -> Self {
        let (inbox, events) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let engine = Engine::new(config, connector, backend, inbox.clone(), notices.clone());
        tokio::spawn(engine.run(events));
        Self {
            inbox: inbox.clone(),
            notices,
            _guard: Arc::new(EngineGuard { inbox }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, DockError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(EngineEvent::Command(build(reply)))
            .map_err(|_| DockError::EngineStopped)?;
        response.await.map_err(|_| DockError::EngineStopped)?
    }

    pub async fn open_tab(&self, title: impl Into<String>) -> Result<TabId, DockError> {
        let title = title.into();
        self.request(|reply| Command::OpenTab { title, reply }).await
    }

    /// Closes the tab's session (killing it if it is still live), then the tab.
    pub async fn close_tab(&self, tab: TabId) -> Result<(), DockError> {
        self.request(|reply| Command::CloseTab { tab, reply }).await
    }

    /// Starts `command` as a backend job and streams it into `tab`. Resolves
    /// once the job is running, or with the start failure.
    pub async fn create_job_session(
        &self,
        tab: TabId,
        command: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Result<SessionId, DockError> {
        let command = command.into();
        let workspace = workspace.into();
        self.request(|reply| Command::CreateJob {
            tab,
            command,
            workspace,
            reply,
        })
        .await
    }

    /// Opens an interactive shell in `workspace`. Resolves once the create
    /// request is on the wire; the session stays `starting` until the
    /// backend acknowledges it.
    pub async fn create_terminal_session(
        &self,
        tab: TabId,
        workspace: impl Into<String>,
        command: Option<String>,
    ) -> Result<SessionId, DockError> {
        let workspace = workspace.into();
        self.request(|reply| Command::CreateTerminal {
            tab,
            workspace,
            command,
            reply,
        })
        .await
    }

    pub async fn attach(&self, tab: TabId, session: SessionId) -> Result<(), DockError> {
        self.request(|reply| Command::Attach {
            tab,
            session,
            reply,
        })
        .await
    }

    async fn control(&self, session: SessionId, control: Control) -> Result<(), DockError> {
        self.request(|reply| Command::Control {
            session,
            control,
            reply,
        })
        .await
    }

    pub async fn cancel(&self, session: SessionId) -> Result<(), DockError> {
        self.control(session, Control::Cancel).await
    }

    pub async fn kill(&self, session: SessionId) -> Result<(), DockError> {
        self.control(session, Control::Kill).await
    }

    pub async fn signal(
        &self,
        session: SessionId,
        signal: impl Into<String>,
    ) -> Result<(), DockError> {
        self.control(session, Control::Signal(signal.into())).await
    }

    pub async fn resize(&self, session: SessionId, rows: u16, cols: u16) -> Result<(), DockError> {
        self.control(session, Control::Resize { rows, cols }).await
    }

    pub async fn send_stdin(
        &self,
        session: SessionId,
        text: impl Into<String>,
    ) -> Result<(), DockError> {
        self.control(session, Control::Stdin(text.into())).await
    }

    pub async fn emit_media(
        &self,
        session: SessionId,
        kind: MediaKind,
        title: impl Into<String>,
        uri: Option<String>,
    ) -> Result<(), DockError> {
        let title = title.into();
        self.request(|reply| Command::EmitMedia {
            session,
            kind,
            title,
            uri,
            reply,
        })
        .await
    }

    pub async fn close(&self, session: SessionId) -> Result<(), DockError> {
        self.request(|reply| Command::Close { session, reply }).await
    }

    pub async fn session(&self, session: SessionId) -> Result<SessionSnapshot, DockError> {
        self.request(|reply| Command::Snapshot { session, reply })
            .await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, DockError> {
        self.request(|reply| Command::Sessions { reply }).await
    }

    pub async fn tab(&self, tab: TabId) -> Result<Tab, DockError> {
        self.request(|reply| Command::Tab { tab, reply }).await
    }

    pub async fn tabs(&self) -> Result<Vec<Tab>, DockError> {
        self.request(|reply| Command::Tabs { reply }).await
    }

    /// Stops the engine and closes every channel. Other handles start
    /// failing with [`DockError::EngineStopped`].
    pub async fn shutdown(&self) -> Result<(), DockError> {
        let (reply, done) = oneshot::channel();
        self.inbox
            .send(EngineEvent::Command(Command::Shutdown { reply: Some(reply) }))
            .map_err(|_| DockError::EngineStopped)?;
        done.await.map_err(|_| DockError::EngineStopped)
    }
}

impl std::fmt::Debug for DockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockHandle")
            .field("stopped", &self.inbox.is_closed())
            .finish()
    }
}
