use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::workspace::WorkspaceChannels;
use super::{
    Session, SessionId, SessionKind, SessionLink, SessionNotice, SessionSnapshot, SessionStatus,
    Tab, TabId,
};
use crate::error::DockError;
use crate::transport::ChannelId;

/// Who inbound frames on a channel belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChannelOwner {
    Job(SessionId),
    Terminal(String),
    Media(String),
}

/// Authoritative table of sessions, tabs and the channels that feed them.
pub(crate) struct SessionRegistry {
    pub(super) sessions: BTreeMap<SessionId, Session>,
    tabs: BTreeMap<TabId, Tab>,
    pub(super) channels: HashMap<ChannelId, ChannelOwner>,
    pub(super) workspaces: HashMap<String, WorkspaceChannels>,
    next_session: u64,
    next_tab: u64,
    next_channel: u64,
    pub(super) media_event_cap: usize,
    pub(super) notices: broadcast::Sender<SessionNotice>,
}

impl SessionRegistry {
    pub fn new(media_event_cap: usize, notices: broadcast::Sender<SessionNotice>) -> Self {
        Self {
            sessions: BTreeMap::new(),
            tabs: BTreeMap::new(),
            channels: HashMap::new(),
            workspaces: HashMap::new(),
            next_session: 1,
            next_tab: 1,
            next_channel: 1,
            media_event_cap: media_event_cap.max(1),
            notices,
        }
    }

    pub fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    pub fn open_tab(&mut self, title: impl Into<String>) -> TabId {
        let id = TabId(self.next_tab);
        self.next_tab += 1;
        self.tabs.insert(
            id,
            Tab {
                id,
                title: title.into(),
                session: None,
                waiting: false,
            },
        );
        id
    }

    pub fn tab(&self, id: TabId) -> Option<&Tab> {
        self.tabs.get(&id)
    }

    pub fn tabs(&self) -> Vec<Tab> {
        self.tabs.values().cloned().collect()
    }

    pub fn contains_tab(&self, id: TabId) -> bool {
        self.tabs.contains_key(&id)
    }

    /// Points `tab` at `session`. The tab's previous session and the
    /// session's previous tab are detached but otherwise untouched.
    pub fn bind_tab(&mut self, tab: TabId, session: SessionId) -> Result<(), DockError> {
        if !self.tabs.contains_key(&tab) {
            return Err(DockError::TabNotFound(tab));
        }
        let Some(target) = self.sessions.get(&session) else {
            return Err(DockError::NotFound(session));
        };
        let waiting = target.status == SessionStatus::Starting && target.output.is_empty();
        let previous_tab = target.tab;

        if let Some(previous_tab) = previous_tab.filter(|previous| *previous != tab) {
            if let Some(previous) = self.tabs.get_mut(&previous_tab) {
                previous.session = None;
                previous.waiting = false;
            }
        }
        let previous_session = self.tabs.get(&tab).and_then(|entry| entry.session);
        if let Some(previous_session) = previous_session.filter(|previous| *previous != session) {
            if let Some(previous) = self.sessions.get_mut(&previous_session) {
                previous.tab = None;
            }
        }

        if let Some(entry) = self.tabs.get_mut(&tab) {
            entry.session = Some(session);
            entry.waiting = waiting;
        }
        if let Some(target) = self.sessions.get_mut(&session) {
            target.tab = Some(tab);
        }
        Ok(())
    }

    pub fn remove_tab(&mut self, id: TabId) -> Option<Tab> {
        let tab = self.tabs.remove(&id)?;
        if let Some(session) = tab.session.and_then(|session| self.sessions.get_mut(&session)) {
            session.tab = None;
        }
        Some(tab)
    }

    pub fn clear_waiting(&mut self, tab: Option<TabId>) {
        if let Some(tab) = tab.and_then(|tab| self.tabs.get_mut(&tab)) {
            tab.waiting = false;
        }
    }

    pub fn insert_session(
        &mut self,
        kind: SessionKind,
        command: Option<String>,
        workspace: String,
        link: SessionLink,
    ) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.sessions
            .insert(id, Session::new(id, kind, command, workspace, link));
        debug!(session = %id, kind = kind.as_str(), "session created");
        self.notify(SessionNotice::Created { session: id, kind });
        id
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.sessions.get(&id).map(Session::snapshot)
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions.values().map(Session::snapshot).collect()
    }

    /// Moves a session to `status`. Terminal statuses are sticky; returns
    /// whether anything changed.
    pub fn set_status(&mut self, id: SessionId, status: SessionStatus) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if session.status == status {
            return false;
        }
        if session.status.is_terminal() {
            trace!(session = %id, current = %session.status, requested = %status, "terminal status is final");
            return false;
        }
        debug!(session = %id, from = %session.status, to = %status, "status changed");
        session.status = status;
        if status.is_terminal() {
            session.close_stream();
        }
        self.notify(SessionNotice::Status {
            session: id,
            status,
        });
        true
    }

    /// Hands out a channel id before its owner is known, so frames arriving
    /// on a channel that is still opening can already be routed.
    pub fn reserve_channel(&mut self) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel += 1;
        id
    }

    pub fn register_channel(&mut self, id: ChannelId, owner: ChannelOwner) {
        self.channels.insert(id, owner);
    }

    pub fn allocate_channel(&mut self, owner: ChannelOwner) -> ChannelId {
        let id = self.reserve_channel();
        self.register_channel(id, owner);
        id
    }

    pub fn channel_owner(&self, id: ChannelId) -> Option<&ChannelOwner> {
        self.channels.get(&id)
    }

    pub fn workspace(&self, workspace: &str) -> Option<&WorkspaceChannels> {
        self.workspaces.get(workspace)
    }

    pub fn workspace_mut(&mut self, workspace: &str) -> Option<&mut WorkspaceChannels> {
        self.workspaces.get_mut(workspace)
    }

    pub fn insert_workspace(&mut self, workspace: String, channels: WorkspaceChannels) {
        self.workspaces.insert(workspace, channels);
    }

    /// Drops a workspace's channel pair and its channel ownership. Frames
    /// already queued on the terminal channel are still flushed.
    pub fn release_workspace(&mut self, workspace: &str) -> Option<WorkspaceChannels> {
        let channels = self.workspaces.remove(workspace)?;
        let (terminal, media) = channels.channel_ids();
        self.channels.remove(&terminal);
        self.channels.remove(&media);
        if let WorkspaceChannels::Ready(pair) = &channels {
            pair.close();
        }
        debug!(workspace, "workspace channels released");
        Some(channels)
    }

    /// Closes every channel the registry holds. Sessions stay readable.
    pub fn release_all(&mut self) {
        let workspaces: Vec<String> = self.workspaces.keys().cloned().collect();
        for workspace in workspaces {
            self.release_workspace(&workspace);
        }
        for session in self.sessions.values_mut() {
            session.close_stream();
        }
    }

    pub fn terminal_sessions_in(&self, workspace: &str) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|session| session.kind == SessionKind::Terminal && session.workspace == workspace)
            .map(|session| session.id)
            .collect()
    }

    /// Removes a session and releases whatever only it was using.
    pub fn remove_session(&mut self, id: SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        if let Some(tab) = session.tab.and_then(|tab| self.tabs.get_mut(&tab)) {
            tab.session = None;
            tab.waiting = false;
        }

        match &session.link {
            SessionLink::Job { channel, .. } => {
                self.channels.remove(channel);
            }
            SessionLink::Terminal { .. } => {
                match self.workspaces.get_mut(&session.workspace) {
                    Some(WorkspaceChannels::Ready(pair)) => {
                        match &session.remote_id {
                            Some(remote_id) => pair.unbind_remote(remote_id),
                            None => pair.forget_pending(id),
                        }
                    }
                    Some(WorkspaceChannels::Opening { waiting, .. }) => {
                        waiting.retain(|pending| *pending != id);
                    }
                    None => {}
                }
                if self.terminal_sessions_in(&session.workspace).is_empty() {
                    self.release_workspace(&session.workspace);
                }
            }
        }
        session.close_stream();

        debug!(session = %id, "session removed");
        self.notify(SessionNotice::Removed { session: id });
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn registry() -> (SessionRegistry, broadcast::Receiver<SessionNotice>) {
        let (tx, rx) = broadcast::channel(64);
        (SessionRegistry::new(4, tx), rx)
    }

    fn job(registry: &mut SessionRegistry) -> SessionId {
        let channel = ChannelId(99);
        let id = registry.insert_session(
            SessionKind::Job,
            Some("make test".into()),
            "/srv".into(),
            SessionLink::Job {
                channel,
                stream: None,
                cancel: CancellationToken::new(),
            },
        );
        registry.register_channel(channel, ChannelOwner::Job(id));
        id
    }

    #[test]
    fn binding_unknown_ids_leaves_registry_untouched() {
        let (mut registry, _rx) = registry();
        let tab = registry.open_tab("main");
        let err = registry.bind_tab(tab, SessionId(42)).unwrap_err();
        assert!(matches!(err, DockError::NotFound(SessionId(42))));
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.tab(tab).unwrap().session, None);

        let session = job(&mut registry);
        let err = registry.bind_tab(TabId(7), session).unwrap_err();
        assert!(matches!(err, DockError::TabNotFound(TabId(7))));
        assert_eq!(registry.session(session).unwrap().tab, None);
    }

    #[test]
    fn rebinding_moves_the_session_between_tabs() {
        let (mut registry, _rx) = registry();
        let first = registry.open_tab("one");
        let second = registry.open_tab("two");
        let session = job(&mut registry);

        registry.bind_tab(first, session).unwrap();
        assert!(registry.tab(first).unwrap().waiting);

        registry.bind_tab(second, session).unwrap();
        assert_eq!(registry.tab(first).unwrap().session, None);
        assert_eq!(registry.tab(second).unwrap().session, Some(session));
        assert_eq!(registry.session(session).unwrap().tab, Some(second));
    }

    #[test]
    fn terminal_statuses_are_sticky() {
        let (mut registry, mut rx) = registry();
        let session = job(&mut registry);
        assert!(matches!(rx.try_recv(), Ok(SessionNotice::Created { .. })));

        assert!(registry.set_status(session, SessionStatus::Running));
        assert!(registry.set_status(session, SessionStatus::Cancelled));
        assert!(!registry.set_status(session, SessionStatus::Done));
        assert!(!registry.set_status(session, SessionStatus::Running));
        assert_eq!(
            registry.session(session).unwrap().status,
            SessionStatus::Cancelled
        );

        let statuses: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            statuses,
            vec![
                SessionNotice::Status {
                    session,
                    status: SessionStatus::Running
                },
                SessionNotice::Status {
                    session,
                    status: SessionStatus::Cancelled
                },
            ]
        );
    }

    #[test]
    fn removing_a_job_unbinds_its_tab_and_channel() {
        let (mut registry, _rx) = registry();
        let tab = registry.open_tab("build");
        let session = job(&mut registry);
        registry.bind_tab(tab, session).unwrap();

        let removed = registry.remove_session(session).unwrap();
        assert_eq!(removed.id, session);
        assert!(!registry.contains(session));
        assert_eq!(registry.tab(tab).unwrap().session, None);
        assert_eq!(registry.channel_owner(ChannelId(99)), None);
        assert!(registry.remove_session(session).is_none());
    }
}
