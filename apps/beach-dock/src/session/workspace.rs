//! Terminal and media channels shared by every terminal session of a workspace.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use super::SessionId;
use crate::protocol::OutboundFrame;
use crate::sequence::SequenceCursor;
use crate::transport::{ChannelId, TransportChannel};

pub(crate) enum WorkspaceChannels {
    /// Both channels are being opened. Creates issued meanwhile wait here.
    Opening {
        terminal: ChannelId,
        media: ChannelId,
        waiting: Vec<SessionId>,
    },
    Ready(WorkspacePair),
}

impl WorkspaceChannels {
    pub fn channel_ids(&self) -> (ChannelId, ChannelId) {
        match self {
            WorkspaceChannels::Opening {
                terminal, media, ..
            } => (*terminal, *media),
            WorkspaceChannels::Ready(pair) => (pair.terminal.id(), pair.media.id()),
        }
    }
}

/// A `created` acknowledgement the backend still owes us. `session` is
/// cleared when the session is closed before the ack arrives. `lost` marks a
/// create that went out on a link which has since dropped.
struct AwaitingCreated {
    request_id: String,
    session: Option<SessionId>,
    lost: bool,
}

pub(crate) struct WorkspacePair {
    pub workspace: String,
    pub terminal: TransportChannel,
    pub media: TransportChannel,
    pub media_cursor: SequenceCursor,
    awaiting_created: VecDeque<AwaitingCreated>,
    remote_sessions: HashMap<String, SessionId>,
}

impl WorkspacePair {
    pub fn new(workspace: String, terminal: TransportChannel, media: TransportChannel) -> Self {
        Self {
            workspace,
            terminal,
            media,
            media_cursor: SequenceCursor::new(),
            awaiting_created: VecDeque::new(),
            remote_sessions: HashMap::new(),
        }
    }

    pub fn expect_created(&mut self, request_id: String, session: SessionId) {
        self.awaiting_created.push_back(AwaitingCreated {
            request_id,
            session: Some(session),
            lost: false,
        });
    }

    /// Resolves a `created` ack: by request id when the backend echoes it,
    /// otherwise the oldest outstanding create. The inner `None` means the
    /// session was closed while it was starting.
    pub fn take_created(&mut self, request_id: Option<&str>) -> Option<Option<SessionId>> {
        let index = match request_id {
            Some(request_id) => self
                .awaiting_created
                .iter()
                .position(|entry| entry.request_id == request_id)?,
            None => 0,
        };
        self.awaiting_created
            .remove(index)
            .map(|entry| entry.session)
    }

    pub fn forget_pending(&mut self, session: SessionId) {
        for entry in self.awaiting_created.iter_mut() {
            if entry.session == Some(session) {
                entry.session = None;
            }
        }
    }

    /// Called when the terminal link drops. Creates queued after this point
    /// are flushed by the transport and are not marked.
    pub fn mark_creates_lost(&mut self) {
        for entry in self.awaiting_created.iter_mut() {
            entry.lost = true;
        }
    }

    /// Sessions whose create was lost with the old link, oldest first. They
    /// stay registered under the same request id.
    pub fn take_lost_creates(&mut self) -> Vec<SessionId> {
        self.awaiting_created
            .iter_mut()
            .filter_map(|entry| {
                if std::mem::take(&mut entry.lost) {
                    entry.session
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn bind_remote(&mut self, remote_id: String, session: SessionId) {
        self.remote_sessions.insert(remote_id, session);
    }

    pub fn unbind_remote(&mut self, remote_id: &str) {
        self.remote_sessions.remove(remote_id);
    }

    pub fn session_for(&self, remote_id: &str) -> Option<SessionId> {
        self.remote_sessions.get(remote_id).copied()
    }

    pub fn send_terminal(&self, frame: &OutboundFrame) {
        match self.terminal.send(frame) {
            Ok(()) => debug!(workspace = %self.workspace, ?frame, "terminal frame queued"),
            Err(err) => warn!(workspace = %self.workspace, error = %err, "failed to queue terminal frame"),
        }
    }

    pub fn send_media(&self, frame: &OutboundFrame) {
        if let Err(err) = self.media.send(frame) {
            warn!(workspace = %self.workspace, error = %err, "failed to queue media frame");
        }
    }

    /// Subscribe request for the media channel, resuming when the cursor has
    /// seen anything.
    pub fn media_subscribe(&self) -> OutboundFrame {
        OutboundFrame::Subscribe {
            job_id: None,
            from_sequence: self
                .media_cursor
                .last()
                .map(|_| self.media_cursor.resume_from()),
        }
    }

    pub fn close(&self) {
        self.terminal.close();
        self.media.close();
    }
}
