//! Terminal sessions multiplexed over per-workspace channel pairs.
//!
//! The first terminal on a workspace opens its terminal and media channels;
//! later creates either queue behind that open or go straight out on the
//! ready pair. The pair is released with the workspace's last session.

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Control, Engine, EngineEvent, Reply, respond};
use crate::error::DockError;
use crate::protocol::OutboundFrame;
use crate::session::workspace::{WorkspaceChannels, WorkspacePair};
use crate::session::{ChannelOwner, SessionId, SessionKind, SessionLink, SessionStatus, TabId};
use crate::transport::{ChannelId, ChannelOptions, TransportChannel, TransportError};

const INTERRUPT_SIGNAL: &str = "SIGINT";

impl Engine {
    pub(super) fn create_terminal(
        &mut self,
        tab: TabId,
        workspace: String,
        command: Option<String>,
        reply: Reply<SessionId>,
    ) {
        if !self.registry.contains_tab(tab) {
            respond(reply, Err(DockError::TabNotFound(tab)));
            return;
        }

        let ready = match self.registry.workspace(&workspace) {
            Some(WorkspaceChannels::Ready(_)) => true,
            Some(WorkspaceChannels::Opening { .. }) => false,
            None => {
                if let Err(err) = self.open_workspace(&workspace) {
                    respond(reply, Err(err));
                    return;
                }
                false
            }
        };

        let session = self.registry.insert_session(
            SessionKind::Terminal,
            command,
            workspace.clone(),
            SessionLink::Terminal {
                request_id: Uuid::new_v4().to_string(),
            },
        );
        if let Err(err) = self.registry.bind_tab(tab, session) {
            warn!(%session, error = %err, "failed to bind terminal to tab");
        }

        if ready {
            self.send_create(session);
            respond(reply, Ok(session));
        } else {
            if let Some(WorkspaceChannels::Opening { waiting, .. }) =
                self.registry.workspace_mut(&workspace)
            {
                waiting.push(session);
            }
            self.pending_terminals.insert(session, reply);
        }
    }

    /// Starts opening both workspace channels. Endpoints are resolved here so
    /// configuration errors reach the caller directly.
    fn open_workspace(&mut self, workspace: &str) -> Result<(), DockError> {
        let terminal_endpoint = self.config.terminal_endpoint(workspace)?;
        let media_endpoint = self.config.media_endpoint(workspace)?;
        let terminal = self
            .registry
            .allocate_channel(ChannelOwner::Terminal(workspace.to_string()));
        let media = self
            .registry
            .allocate_channel(ChannelOwner::Media(workspace.to_string()));
        self.registry.insert_workspace(
            workspace.to_string(),
            WorkspaceChannels::Opening {
                terminal,
                media,
                waiting: Vec::new(),
            },
        );

        info!(workspace, "opening workspace channels");
        let connector = self.connector.clone();
        let inbox = self.inbox.clone();
        let delay = self.config.reconnect_delay();
        let workspace = workspace.to_string();
        tokio::spawn(async move {
            let result = tokio::try_join!(
                TransportChannel::open(
                    terminal,
                    terminal_endpoint,
                    connector.clone(),
                    inbox.clone(),
                    ChannelOptions::new(delay),
                ),
                TransportChannel::open(
                    media,
                    media_endpoint,
                    connector,
                    inbox.clone(),
                    ChannelOptions::new(delay),
                ),
            );
            let _ = inbox.send(EngineEvent::WorkspaceOpened {
                workspace,
                channels: (terminal, media),
                result,
            });
        });
        Ok(())
    }

    pub(super) fn workspace_opened(
        &mut self,
        workspace: String,
        channels: (ChannelId, ChannelId),
        result: Result<(TransportChannel, TransportChannel), TransportError>,
    ) {
        let current = self
            .registry
            .workspace(&workspace)
            .map(WorkspaceChannels::channel_ids);
        if current != Some(channels) {
            debug!(%workspace, "discarding channels for released workspace");
            return;
        }

        let (terminal, media) = match result {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%workspace, error = %err, "failed to open workspace channels");
                let Some(WorkspaceChannels::Opening { waiting, .. }) =
                    self.registry.release_workspace(&workspace)
                else {
                    return;
                };
                for session in waiting {
                    self.registry.remove_session(session);
                    if let Some(reply) = self.pending_terminals.remove(&session) {
                        respond(reply, Err(DockError::Transport(err.clone())));
                    }
                }
                return;
            }
        };

        let waiting = match self.registry.workspace_mut(&workspace) {
            Some(WorkspaceChannels::Opening { waiting, .. }) => std::mem::take(waiting),
            _ => Vec::new(),
        };
        let pair = WorkspacePair::new(workspace.clone(), terminal, media);
        pair.send_media(&pair.media_subscribe());
        self.registry
            .insert_workspace(workspace.clone(), WorkspaceChannels::Ready(pair));
        info!(%workspace, pending = waiting.len(), "workspace channels ready");

        for session in waiting {
            self.send_create(session);
            if let Some(reply) = self.pending_terminals.remove(&session) {
                respond(reply, Ok(session));
            }
        }
        if self.registry.terminal_sessions_in(&workspace).is_empty() {
            self.registry.release_workspace(&workspace);
        }
    }

    fn send_create(&mut self, session: SessionId) {
        let Some((workspace, request_id, frame)) = self.create_frame(session) else {
            return;
        };
        let Some(WorkspaceChannels::Ready(pair)) = self.registry.workspace_mut(&workspace) else {
            return;
        };
        pair.expect_created(request_id, session);
        pair.send_terminal(&frame);
    }

    /// Builds the create frame for a terminal that has not ended, along with
    /// its workspace and request id.
    fn create_frame(&self, session: SessionId) -> Option<(String, String, OutboundFrame)> {
        let entry = self.registry.session(session)?;
        if entry.status.is_terminal() {
            debug!(%session, status = %entry.status, "not creating a terminal that already ended");
            return None;
        }
        let SessionLink::Terminal { request_id } = &entry.link else {
            return None;
        };
        let frame = OutboundFrame::Create {
            request_id: request_id.clone(),
            workspace: entry.workspace.clone(),
            command: entry.command.clone(),
        };
        Some((entry.workspace.clone(), request_id.clone(), frame))
    }

    /// Re-sends creates that went out on a link which dropped before the
    /// backend acknowledged them.
    fn resend_lost_creates(&mut self, workspace: &str) {
        let lost = match self.registry.workspace_mut(workspace) {
            Some(WorkspaceChannels::Ready(pair)) => pair.take_lost_creates(),
            _ => return,
        };
        for session in lost {
            let Some((_, request_id, frame)) = self.create_frame(session) else {
                continue;
            };
            debug!(%session, workspace, %request_id, "re-sending unacknowledged create");
            if let Some(WorkspaceChannels::Ready(pair)) = self.registry.workspace(workspace) {
                pair.send_terminal(&frame);
            }
        }
    }

    pub(super) fn terminal_control(&mut self, session: SessionId, control: Control) {
        let Some(entry) = self.registry.session(session) else {
            return;
        };
        let remote_id = entry.remote_id.clone();
        let workspace = entry.workspace.clone();

        if control == Control::Kill {
            self.registry.set_status(session, SessionStatus::Killed);
            if remote_id.is_none() {
                // Sent once the backend acknowledges the create.
                debug!(%session, "kill deferred until terminal is created");
                return;
            }
        }
        let Some(session_id) = remote_id else {
            debug!(%session, operation = control.name(), "terminal not created yet; ignoring");
            return;
        };
        let frame = match control {
            Control::Kill => OutboundFrame::Kill { session_id },
            Control::Cancel => OutboundFrame::Signal {
                session_id,
                signal: INTERRUPT_SIGNAL.to_string(),
            },
            Control::Signal(signal) => OutboundFrame::Signal { session_id, signal },
            Control::Resize { rows, cols } => OutboundFrame::Resize {
                session_id,
                rows,
                cols,
            },
            Control::Stdin(data) => OutboundFrame::Input { session_id, data },
        };
        match self.registry.workspace(&workspace) {
            Some(WorkspaceChannels::Ready(pair)) => pair.send_terminal(&frame),
            _ => warn!(%session, %workspace, "workspace channels are gone"),
        }
    }

    /// Re-attaches a created terminal from its cursor.
    pub(super) fn replay_terminal(&mut self, session: SessionId) {
        let Some(entry) = self.registry.session(session) else {
            return;
        };
        if entry.status.is_terminal() {
            return;
        }
        let Some(remote_id) = entry.remote_id.clone() else {
            return;
        };
        let frame = OutboundFrame::Attach {
            session_id: remote_id,
            from_sequence: entry.cursor.resume_from(),
        };
        if let Some(WorkspaceChannels::Ready(pair)) = self.registry.workspace(&entry.workspace) {
            pair.send_terminal(&frame);
        }
    }

    pub(super) fn terminal_disconnected(&mut self, workspace: &str) {
        if let Some(WorkspaceChannels::Ready(pair)) = self.registry.workspace_mut(workspace) {
            pair.mark_creates_lost();
        }
        for session in self.registry.terminal_sessions_in(workspace) {
            let running = self
                .registry
                .session(session)
                .is_some_and(|entry| entry.status == SessionStatus::Running);
            if running {
                self.registry
                    .set_status(session, SessionStatus::Reconnecting);
            }
        }
    }

    pub(super) fn terminal_reconnected(&mut self, workspace: &str) {
        self.resend_lost_creates(workspace);
        for session in self.registry.terminal_sessions_in(workspace) {
            self.replay_terminal(session);
            let reconnecting = self
                .registry
                .session(session)
                .is_some_and(|entry| entry.status == SessionStatus::Reconnecting);
            if reconnecting {
                self.registry.set_status(session, SessionStatus::Running);
            }
        }
    }

    pub(super) fn media_reconnected(&mut self, workspace: &str) {
        if let Some(WorkspaceChannels::Ready(pair)) = self.registry.workspace(workspace) {
            debug!(workspace, from = ?pair.media_cursor.last(), "resubscribing media channel");
            pair.send_media(&pair.media_subscribe());
        }
    }
}
