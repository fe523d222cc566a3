//! The session engine: one task that owns every session.
//!
//! UI commands, channel events and the results of spawned I/O all arrive on
//! a single unbounded inbox and are applied in arrival order, so session
//! state needs no locking. Anything that waits on the network (job start,
//! channel opens, control-plane HTTP calls) runs in its own task and posts
//! its outcome back to the inbox.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::JobBackend;
use crate::config::DockConfig;
use crate::error::DockError;
use crate::protocol::{MediaEvent, MediaKind, OutboundFrame};
use crate::session::workspace::WorkspaceChannels;
use crate::session::{
    ChannelOwner, SessionId, SessionKind, SessionNotice, SessionRegistry, SessionSnapshot, Tab,
    TabId,
};
use crate::transport::{ChannelEvent, ChannelId, Connector, TransportChannel, TransportError};

mod handle;
mod jobs;
mod terminals;

pub use handle::DockHandle;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, DockError>>;

fn respond<T>(reply: Reply<T>, result: Result<T, DockError>) {
    // The caller may have stopped waiting.
    let _ = reply.send(result);
}

/// Fire-and-forget session controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Control {
    Cancel,
    Kill,
    Signal(String),
    Resize { rows: u16, cols: u16 },
    Stdin(String),
}

impl Control {
    fn name(&self) -> &'static str {
        match self {
            Control::Cancel => "cancel",
            Control::Kill => "kill",
            Control::Signal(_) => "signal",
            Control::Resize { .. } => "resize",
            Control::Stdin(_) => "send_stdin",
        }
    }
}

pub(crate) enum Command {
    OpenTab {
        title: String,
        reply: Reply<TabId>,
    },
    CloseTab {
        tab: TabId,
        reply: Reply<()>,
    },
    CreateJob {
        tab: TabId,
        command: String,
        workspace: String,
        reply: Reply<SessionId>,
    },
    CreateTerminal {
        tab: TabId,
        workspace: String,
        command: Option<String>,
        reply: Reply<SessionId>,
    },
    Attach {
        tab: TabId,
        session: SessionId,
        reply: Reply<()>,
    },
    Control {
        session: SessionId,
        control: Control,
        reply: Reply<()>,
    },
    EmitMedia {
        session: SessionId,
        kind: MediaKind,
        title: String,
        uri: Option<String>,
        reply: Reply<()>,
    },
    Close {
        session: SessionId,
        reply: Reply<()>,
    },
    Snapshot {
        session: SessionId,
        reply: Reply<SessionSnapshot>,
    },
    Sessions {
        reply: Reply<Vec<SessionSnapshot>>,
    },
    Tab {
        tab: TabId,
        reply: Reply<Tab>,
    },
    Tabs {
        reply: Reply<Vec<Tab>>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

pub(crate) enum EngineEvent {
    Command(Command),
    Channel(ChannelEvent),
    JobOpened {
        session: SessionId,
        job_id: String,
        stream: TransportChannel,
    },
    JobFailed {
        session: SessionId,
        error: DockError,
    },
    WorkspaceOpened {
        workspace: String,
        channels: (ChannelId, ChannelId),
        result: Result<(TransportChannel, TransportChannel), TransportError>,
    },
}

impl From<ChannelEvent> for EngineEvent {
    fn from(event: ChannelEvent) -> Self {
        EngineEvent::Channel(event)
    }
}

pub(crate) struct Engine {
    config: DockConfig,
    registry: SessionRegistry,
    connector: Arc<dyn Connector>,
    backend: Arc<dyn JobBackend>,
    inbox: mpsc::UnboundedSender<EngineEvent>,
    /// Create requests answered once the job stream is open.
    pending_jobs: HashMap<SessionId, Reply<SessionId>>,
    /// Create requests answered once the workspace channels are open.
    pending_terminals: HashMap<SessionId, Reply<SessionId>>,
}

impl Engine {
    pub fn new(
        config: DockConfig,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn JobBackend>,
        inbox: mpsc::UnboundedSender<EngineEvent>,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        let registry = SessionRegistry::new(config.media_event_cap(), notices);
        Self {
            config,
            registry,
            connector,
            backend,
            inbox,
            pending_jobs: HashMap::new(),
            pending_terminals: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        info!("session engine started");
        let mut stopped_by = None;
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Command(Command::Shutdown { reply }) => {
                    stopped_by = reply;
                    break;
                }
                EngineEvent::Command(command) => self.handle_command(command),
                EngineEvent::Channel(event) => self.handle_channel_event(event),
                EngineEvent::JobOpened {
                    session,
                    job_id,
                    stream,
                } => self.job_opened(session, job_id, stream),
                EngineEvent::JobFailed { session, error } => self.job_failed(session, error),
                EngineEvent::WorkspaceOpened {
                    workspace,
                    channels,
                    result,
                } => self.workspace_opened(workspace, channels, result),
            }
        }
        self.shutdown();
        if let Some(reply) = stopped_by {
            let _ = reply.send(());
        }
    }

    fn shutdown(&mut self) {
        self.registry.release_all();
        info!(sessions = self.registry.len(), "session engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::OpenTab { title, reply } => respond(reply, Ok(self.registry.open_tab(title))),
            Command::CloseTab { tab, reply } => {
                let result = self.close_tab(tab);
                respond(reply, result);
            }
            Command::CreateJob {
                tab,
                command,
                workspace,
                reply,
            } => self.create_job(tab, command, workspace, reply),
            Command::CreateTerminal {
                tab,
                workspace,
                command,
                reply,
            } => self.create_terminal(tab, workspace, command, reply),
            Command::Attach {
                tab,
                session,
                reply,
            } => {
                let result = self.attach(tab, session);
                respond(reply, result);
            }
            Command::Control {
                session,
                control,
                reply,
            } => {
                let result = self.control(session, control);
                respond(reply, result);
            }
            Command::EmitMedia {
                session,
                kind,
                title,
                uri,
                reply,
            } => {
                let result = self.emit_media(session, kind, title, uri);
                respond(reply, result);
            }
            Command::Close { session, reply } => {
                let result = self.close_session(session);
                respond(reply, result);
            }
            Command::Snapshot { session, reply } => respond(
                reply,
                self.registry
                    .snapshot(session)
                    .ok_or(DockError::NotFound(session)),
            ),
            Command::Sessions { reply } => respond(reply, Ok(self.registry.snapshots())),
            Command::Tab { tab, reply } => respond(
                reply,
                self.registry
                    .tab(tab)
                    .cloned()
                    .ok_or(DockError::TabNotFound(tab)),
            ),
            Command::Tabs { reply } => respond(reply, Ok(self.registry.tabs())),
            Command::Shutdown { .. } => {}
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        let channel = event.channel();
        let Some(owner) = self.registry.channel_owner(channel).cloned() else {
            debug!(%channel, "event for released channel");
            return;
        };
        match event {
            ChannelEvent::Message { text, .. } => self.registry.dispatch(channel, &text),
            ChannelEvent::Disconnected { reason, .. } => {
                info!(%channel, %reason, "channel disconnected; waiting for reconnect");
                match owner {
                    ChannelOwner::Job(session) => self.job_disconnected(session),
                    ChannelOwner::Terminal(workspace) => self.terminal_disconnected(&workspace),
                    ChannelOwner::Media(_) => {}
                }
            }
            ChannelEvent::Reconnected { .. } => match owner {
                ChannelOwner::Job(session) => self.job_reconnected(session),
                ChannelOwner::Terminal(workspace) => self.terminal_reconnected(&workspace),
                ChannelOwner::Media(workspace) => self.media_reconnected(&workspace),
            },
        }
    }

    /// Binds the tab and asks the backend to replay from the session's cursor.
    fn attach(&mut self, tab: TabId, session: SessionId) -> Result<(), DockError> {
        let Some(kind) = self.registry.session(session).map(|entry| entry.kind) else {
            return Err(DockError::NotFound(session));
        };
        self.registry.bind_tab(tab, session)?;
        match kind {
            SessionKind::Job => self.replay_job(session),
            SessionKind::Terminal => self.replay_terminal(session),
        }
        Ok(())
    }

    fn control(&mut self, session: SessionId, control: Control) -> Result<(), DockError> {
        let Some(entry) = self.registry.session(session) else {
            return Err(DockError::NotFound(session));
        };
        let kind = entry.kind;
        let status = entry.status;
        if kind == SessionKind::Job
            && matches!(control, Control::Signal(_) | Control::Resize { .. })
        {
            return Err(DockError::Unsupported {
                operation: control.name(),
                kind,
            });
        }
        if status.is_terminal() {
            debug!(%session, %status, operation = control.name(), "ignoring control on finished session");
            return Ok(());
        }
        match kind {
            SessionKind::Job => self.job_control(session, control),
            SessionKind::Terminal => self.terminal_control(session, control),
        }
        Ok(())
    }

    fn emit_media(
        &mut self,
        session: SessionId,
        kind: MediaKind,
        title: String,
        uri: Option<String>,
    ) -> Result<(), DockError> {
        let Some(entry) = self.registry.session(session) else {
            return Err(DockError::NotFound(session));
        };
        if entry.kind != SessionKind::Terminal {
            return Err(DockError::Unsupported {
                operation: "emit_media",
                kind: entry.kind,
            });
        }
        let Some(remote_id) = entry.remote_id.clone() else {
            return Err(DockError::NotReady(session));
        };
        let Some(WorkspaceChannels::Ready(pair)) = self.registry.workspace(&entry.workspace) else {
            return Err(DockError::NotReady(session));
        };
        pair.send_media(&OutboundFrame::Emit {
            event: MediaEvent {
                session_id: remote_id,
                kind,
                title,
                uri,
                mime: None,
                sequence: 0,
            },
        });
        Ok(())
    }

    /// Kills a live session, then removes it. The kill is queued before the
    /// session's channels are released.
    fn close_session(&mut self, session: SessionId) -> Result<(), DockError> {
        let Some(entry) = self.registry.session(session) else {
            return Err(DockError::NotFound(session));
        };
        if !entry.status.is_terminal() {
            self.control(session, Control::Kill)?;
        }
        if let Some(reply) = self.pending_jobs.remove(&session) {
            respond(reply, Err(DockError::NotFound(session)));
        }
        if let Some(reply) = self.pending_terminals.remove(&session) {
            respond(reply, Err(DockError::NotFound(session)));
        }
        self.registry.remove_session(session);
        Ok(())
    }

    fn close_tab(&mut self, tab: TabId) -> Result<(), DockError> {
        let Some(bound) = self.registry.tab(tab).map(|entry| entry.session) else {
            return Err(DockError::TabNotFound(tab));
        };
        if let Some(session) = bound {
            if let Err(err) = self.close_session(session) {
                warn!(%tab, %session, error = %err, "failed to close tab session");
            }
        }
        self.registry.remove_tab(tab);
        Ok(())
    }
}
