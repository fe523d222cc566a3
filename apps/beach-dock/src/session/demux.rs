//! Routes inbound frames to the session that owns them.
//!
//! Frames are applied strictly in arrival order per channel. The session's
//! [`SequenceCursor`](crate::sequence::SequenceCursor) is the only reordering
//! tolerance: replays at or below the cursor are discarded, nothing is
//! re-sorted. Frames that cannot be decoded or routed are logged and dropped
//! without touching any session.

use tracing::{debug, info, trace, warn};

use super::registry::{ChannelOwner, SessionRegistry};
use super::workspace::WorkspaceChannels;
use super::{SessionId, SessionNotice, SessionStatus};
use crate::protocol::{self, InboundFrame, MediaEvent, OutboundFrame};
use crate::transport::ChannelId;

impl SessionRegistry {
    pub fn dispatch(&mut self, channel: ChannelId, text: &str) {
        let Some(owner) = self.channels.get(&channel).cloned() else {
            debug!(%channel, "dropping frame for released channel");
            return;
        };
        let frame = match protocol::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%channel, error = %err, "dropping malformed frame");
                return;
            }
        };
        trace!(%channel, kind = frame.kind(), "frame received");
        match owner {
            ChannelOwner::Job(session) => self.dispatch_job(session, frame),
            ChannelOwner::Terminal(workspace) => self.dispatch_terminal(&workspace, frame),
            ChannelOwner::Media(workspace) => self.dispatch_media(&workspace, frame),
        }
    }

    fn dispatch_job(&mut self, session: SessionId, frame: InboundFrame) {
        match frame {
            InboundFrame::Output { sequence, data, .. } => {
                self.apply_output(session, sequence, data)
            }
            InboundFrame::Status {
                sequence,
                status,
                exit_code,
                ..
            } => self.apply_status(session, sequence, status.into(), exit_code),
            InboundFrame::Error {
                sequence, message, ..
            } => self.apply_error(session, sequence, message),
            InboundFrame::Ack { request, .. } => {
                trace!(%session, ?request, "job ack")
            }
            other => debug!(%session, kind = other.kind(), "unexpected frame on job stream"),
        }
    }

    fn dispatch_terminal(&mut self, workspace: &str, frame: InboundFrame) {
        match frame {
            InboundFrame::Created {
                session_id,
                request_id,
            } => self.apply_created(workspace, session_id, request_id),
            InboundFrame::Output {
                session_id: Some(remote),
                sequence,
                data,
            } => {
                if let Some(session) = self.resolve_terminal(workspace, &remote) {
                    self.apply_output(session, sequence, data);
                }
            }
            InboundFrame::Status {
                session_id: Some(remote),
                sequence,
                status,
                exit_code,
            } => {
                if let Some(session) = self.resolve_terminal(workspace, &remote) {
                    self.apply_status(session, sequence, status.into(), exit_code);
                }
            }
            InboundFrame::Error {
                session_id: Some(remote),
                sequence,
                message,
            } => {
                if let Some(session) = self.resolve_terminal(workspace, &remote) {
                    self.apply_error(session, sequence, message);
                }
            }
            InboundFrame::Error {
                session_id: None,
                message,
                ..
            } => warn!(workspace, %message, "terminal channel reported an error"),
            InboundFrame::Ack {
                session_id,
                request,
            } => trace!(workspace, ?session_id, ?request, "terminal ack"),
            other => debug!(
                workspace,
                kind = other.kind(),
                "dropping terminal frame without a session id"
            ),
        }
    }

    fn dispatch_media(&mut self, workspace: &str, frame: InboundFrame) {
        let (sequence, mut event) = match frame {
            InboundFrame::Event { sequence, event } => (sequence, event),
            other => {
                debug!(workspace, kind = other.kind(), "unexpected frame on media channel");
                return;
            }
        };
        let Some(WorkspaceChannels::Ready(pair)) = self.workspaces.get_mut(workspace) else {
            return;
        };
        if !pair.media_cursor.update(sequence) {
            trace!(workspace, sequence, "dropping replayed media event");
            return;
        }
        let Some(session) = pair.session_for(&event.session_id) else {
            debug!(workspace, remote = %event.session_id, "dropping media event for unknown session");
            return;
        };
        event.sequence = sequence;
        self.push_media(session, event);
    }

    fn resolve_terminal(&self, workspace: &str, remote: &str) -> Option<SessionId> {
        let session = match self.workspaces.get(workspace) {
            Some(WorkspaceChannels::Ready(pair)) => pair.session_for(remote),
            _ => None,
        };
        if session.is_none() {
            debug!(workspace, remote, "dropping frame for unknown terminal session");
        }
        session
    }

    fn apply_created(&mut self, workspace: &str, remote: String, request_id: Option<String>) {
        let Some(WorkspaceChannels::Ready(pair)) = self.workspaces.get_mut(workspace) else {
            return;
        };
        let Some(pending) = pair.take_created(request_id.as_deref()) else {
            warn!(workspace, %remote, ?request_id, "created ack matches no pending create");
            return;
        };
        let Some(session) = pending.and_then(|id| self.sessions.get_mut(&id)) else {
            info!(workspace, %remote, "terminal closed before it started; killing it");
            pair.send_terminal(&OutboundFrame::Kill { session_id: remote });
            return;
        };

        pair.bind_remote(remote.clone(), session.id);
        session.remote_id = Some(remote.clone());
        let id = session.id;
        debug!(session = %id, %remote, "terminal session created");
        let status = session.status;
        match status {
            SessionStatus::Killed => {
                pair.send_terminal(&OutboundFrame::Kill { session_id: remote });
            }
            SessionStatus::Starting => {
                self.set_status(id, SessionStatus::Running);
            }
            _ => {}
        }
    }

    fn apply_output(&mut self, id: SessionId, sequence: u64, data: String) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if !session.cursor.update(sequence) {
            trace!(session = %id, sequence, "dropping replayed output");
            return;
        }
        if session.status.is_terminal() {
            debug!(session = %id, sequence, status = %session.status, "output after terminal status");
        }
        session.output.push(data.clone());
        let promote = session.status == SessionStatus::Starting;
        let tab = session.tab;

        self.clear_waiting(tab);
        self.notify(SessionNotice::Output {
            session: id,
            sequence: Some(sequence),
            data,
        });
        if promote {
            self.set_status(id, SessionStatus::Running);
        }
    }

    fn apply_status(
        &mut self,
        id: SessionId,
        sequence: u64,
        status: SessionStatus,
        exit_code: Option<i32>,
    ) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if !session.cursor.update(sequence) {
            trace!(session = %id, sequence, "dropping replayed status");
            return;
        }
        let tab = session.tab;
        self.clear_waiting(tab);

        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.status.is_terminal() {
            debug!(session = %id, current = %session.status, reported = %status, "ignoring status after terminal state");
            return;
        }
        session.exit_code = exit_code.or(session.exit_code);
        if status == SessionStatus::Error {
            let line = match exit_code {
                Some(code) => format!("[process exited with code {code}]"),
                None => "[process exited with an error]".to_string(),
            };
            session.output.push(line.clone());
            self.notify(SessionNotice::Output {
                session: id,
                sequence: None,
                data: line,
            });
        }
        self.set_status(id, status);
    }

    fn apply_error(&mut self, id: SessionId, sequence: Option<u64>, message: String) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if let Some(sequence) = sequence {
            if !session.cursor.update(sequence) {
                trace!(session = %id, sequence, "dropping replayed error");
                return;
            }
        }
        warn!(session = %id, %message, "stream error");
        let line = format!("[stream error] {message}");
        session.output.push(line.clone());
        self.notify(SessionNotice::Output {
            session: id,
            sequence,
            data: line,
        });
        self.set_status(id, SessionStatus::Error);
    }

    fn push_media(&mut self, id: SessionId, event: MediaEvent) {
        let cap = self.media_event_cap;
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        while session.media_events.len() >= cap {
            session.media_events.pop_front();
        }
        session.media_events.push_back(event.clone());
        self.notify(SessionNotice::Media { session: id, event });
    }
}
