//! Session and tab state owned by the engine.
//!
//! A [`Session`] is one remote job run or one interactive shell. Jobs own a
//! stream channel each; terminal sessions share their workspace's terminal and
//! media channels (see [`workspace`]). The engine task is the only writer, so
//! nothing here is synchronized. Callers observe state through
//! [`SessionSnapshot`]s and the [`SessionNotice`] broadcast.

use std::collections::VecDeque;
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::protocol::MediaEvent;
use crate::sequence::SequenceCursor;
use crate::transport::{ChannelId, TransportChannel};

mod demux;
mod registry;
pub(crate) mod workspace;

pub(crate) use registry::{ChannelOwner, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(pub u64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Job,
    Terminal,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Job => "job",
            SessionKind::Terminal => "terminal",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Starting,
    Running,
    Reconnecting,
    Done,
    Error,
    Cancelled,
    Killed,
}

impl SessionStatus {
    /// Terminal statuses are final: nothing moves a session out of them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Done
                | SessionStatus::Error
                | SessionStatus::Cancelled
                | SessionStatus::Killed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::Done => "done",
            SessionStatus::Error => "error",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Killed => "killed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific connection state.
pub(crate) enum SessionLink {
    Job {
        channel: ChannelId,
        /// `None` until the stream has been opened, and again once it is closed.
        stream: Option<TransportChannel>,
        cancel: CancellationToken,
    },
    Terminal {
        request_id: String,
    },
}

pub(crate) struct Session {
    pub id: SessionId,
    pub kind: SessionKind,
    pub remote_id: Option<String>,
    pub status: SessionStatus,
    pub cursor: SequenceCursor,
    pub output: Vec<String>,
    pub command: Option<String>,
    pub workspace: String,
    pub exit_code: Option<i32>,
    pub media_events: VecDeque<MediaEvent>,
    pub tab: Option<TabId>,
    pub link: SessionLink,
}

impl Session {
    pub fn new(
        id: SessionId,
        kind: SessionKind,
        command: Option<String>,
        workspace: String,
        link: SessionLink,
    ) -> Self {
        Self {
            id,
            kind,
            remote_id: None,
            status: SessionStatus::Starting,
            cursor: SequenceCursor::new(),
            output: Vec::new(),
            command,
            workspace,
            exit_code: None,
            media_events: VecDeque::new(),
            tab: None,
            link,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            kind: self.kind,
            remote_id: self.remote_id.clone(),
            status: self.status,
            output: self.output.clone(),
            command: self.command.clone(),
            workspace: self.workspace.clone(),
            exit_code: self.exit_code,
            media_events: self.media_events.iter().cloned().collect(),
            last_sequence: self.cursor.last(),
            tab: self.tab,
        }
    }

    /// Closes the job stream, if any, so the transport stops reconnecting it.
    pub fn close_stream(&mut self) {
        if let SessionLink::Job { stream, .. } = &mut self.link {
            if let Some(channel) = stream.take() {
                channel.close();
            }
        }
    }
}

/// Read-only copy of a session handed to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub kind: SessionKind,
    pub remote_id: Option<String>,
    pub status: SessionStatus,
    pub output: Vec<String>,
    pub command: Option<String>,
    pub workspace: String,
    pub exit_code: Option<i32>,
    pub media_events: Vec<MediaEvent>,
    pub last_sequence: Option<u64>,
    pub tab: Option<TabId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tab {
    pub id: TabId,
    pub title: String,
    pub session: Option<SessionId>,
    /// Set while the bound session has not produced anything yet.
    pub waiting: bool,
}

/// Change notifications broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Created {
        session: SessionId,
        kind: SessionKind,
    },
    /// A line appended to the output buffer. Synthetic lines (stream errors,
    /// exit summaries) may carry no sequence.
    Output {
        session: SessionId,
        sequence: Option<u64>,
        data: String,
    },
    Status {
        session: SessionId,
        status: SessionStatus,
    },
    Media {
        session: SessionId,
        event: MediaEvent,
    },
    Removed {
        session: SessionId,
    },
}

impl SessionNotice {
    pub fn session(&self) -> SessionId {
        match self {
            SessionNotice::Created { session, .. }
            | SessionNotice::Output { session, .. }
            | SessionNotice::Status { session, .. }
            | SessionNotice::Media { session, .. }
            | SessionNotice::Removed { session } => *session,
        }
    }
}
