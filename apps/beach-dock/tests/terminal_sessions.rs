mod support;

use beach_dock::transport::ChannelRole;
use beach_dock::transport::memory::MemoryPeer;
use beach_dock::{DockError, DockHandle, MediaKind, SessionId, SessionStatus, TabId};
use serde_json::{Value, json};
use support::{Harness, harness, wait_for};

const WORKSPACE: &str = "/srv/app";

struct Workspace {
    terminal: MemoryPeer,
    media: MemoryPeer,
}

/// Creates the first terminal of a workspace and acknowledges it as `remote`.
async fn first_terminal(h: &Harness, tab: TabId, remote: &str) -> (SessionId, Workspace) {
    let dock = h.dock.clone();
    let create =
        tokio::spawn(async move { dock.create_terminal_session(tab, WORKSPACE, None).await });
    let terminal = h.connector.accept(ChannelRole::Terminal).await;
    let mut media = h.connector.accept(ChannelRole::Media).await;
    let session = create.await.unwrap().unwrap();
    assert_eq!(media.recv_json().await.unwrap(), json!({"type": "subscribe"}));

    let mut workspace = Workspace { terminal, media };
    acknowledge(&h.dock, &mut workspace, session, remote).await;
    (session, workspace)
}

/// Answers the next create frame on the terminal channel.
async fn acknowledge(dock: &DockHandle, workspace: &mut Workspace, session: SessionId, remote: &str) {
    let create = workspace.terminal.recv_json().await.unwrap();
    assert_eq!(create["type"], "create");
    assert_eq!(create["workspace"], WORKSPACE);
    workspace.terminal.send_json(json!({
        "type": "created",
        "session_id": remote,
        "request_id": create["request_id"],
    }));
    wait_for(dock, session, |s| s.status == SessionStatus::Running).await;
}

#[test_timeout::tokio_timeout_test]
async fn media_events_reach_only_their_terminal() {
    let h = harness();
    let tab_a = h.dock.open_tab("a").await.unwrap();
    let tab_b = h.dock.open_tab("b").await.unwrap();
    let (a, mut workspace) = first_terminal(&h, tab_a, "pty-a").await;

    let b = h
        .dock
        .create_terminal_session(tab_b, WORKSPACE, Some("bash".into()))
        .await
        .unwrap();
    acknowledge(&h.dock, &mut workspace, b, "pty-b").await;

    workspace.media.send_json(json!({
        "type": "event",
        "sequence": 1,
        "event": {"session_id": "pty-b", "kind": "image", "title": "plot.png", "uri": "file:///tmp/plot.png"},
    }));
    let snapshot = wait_for(&h.dock, b, |s| !s.media_events.is_empty()).await;
    assert_eq!(snapshot.media_events.len(), 1);
    assert_eq!(snapshot.media_events[0].kind, MediaKind::Image);
    assert_eq!(snapshot.media_events[0].title, "plot.png");
    assert_eq!(snapshot.media_events[0].sequence, 1);
    assert_eq!(snapshot.command.as_deref(), Some("bash"));

    assert!(h.dock.session(a).await.unwrap().media_events.is_empty());
    assert_eq!(h.connector.connect_attempts(ChannelRole::Terminal), 1);
    assert_eq!(h.connector.connect_attempts(ChannelRole::Media), 1);
}

#[test_timeout::tokio_timeout_test]
async fn output_is_routed_by_backend_session_id() {
    let h = harness();
    let tab_a = h.dock.open_tab("a").await.unwrap();
    let tab_b = h.dock.open_tab("b").await.unwrap();
    let (a, mut workspace) = first_terminal(&h, tab_a, "pty-a").await;
    let b = h
        .dock
        .create_terminal_session(tab_b, WORKSPACE, None)
        .await
        .unwrap();
    acknowledge(&h.dock, &mut workspace, b, "pty-b").await;

    let terminal = &workspace.terminal;
    terminal.send_json(json!({"type": "output", "session_id": "pty-b", "sequence": 0, "data": "$ "}));
    terminal.send_json(json!({"type": "output", "session_id": "pty-a", "sequence": 0, "data": "# "}));
    terminal.send_json(json!({"type": "output", "session_id": "pty-x", "sequence": 1, "data": "lost"}));
    terminal.send_json(json!({"type": "status", "session_id": "pty-b", "sequence": 1, "status": "completed", "exit_code": 0}));

    let b_snapshot = wait_for(&h.dock, b, |s| s.status.is_terminal()).await;
    assert_eq!(b_snapshot.status, SessionStatus::Done);
    assert_eq!(b_snapshot.output, vec!["$ ".to_string()]);
    let a_snapshot = h.dock.session(a).await.unwrap();
    assert_eq!(a_snapshot.output, vec!["# ".to_string()]);
    assert_eq!(a_snapshot.status, SessionStatus::Running);
}

#[test_timeout::tokio_timeout_test]
async fn creates_issued_while_opening_share_one_channel_pair() {
    let h = harness();
    let tab_a = h.dock.open_tab("a").await.unwrap();
    let tab_b = h.dock.open_tab("b").await.unwrap();

    let (a, b) = tokio::join!(
        h.dock.create_terminal_session(tab_a, WORKSPACE, None),
        h.dock.create_terminal_session(tab_b, WORKSPACE, None),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    let mut workspace = Workspace {
        terminal: h.connector.accept(ChannelRole::Terminal).await,
        media: h.connector.accept(ChannelRole::Media).await,
    };
    acknowledge(&h.dock, &mut workspace, a, "pty-a").await;
    acknowledge(&h.dock, &mut workspace, b, "pty-b").await;

    assert_eq!(h.connector.connect_attempts(ChannelRole::Terminal), 1);
    assert_eq!(h.connector.connect_attempts(ChannelRole::Media), 1);
    assert_eq!(h.connector.peak_live(), 1);
    assert_eq!(
        h.dock.session(a).await.unwrap().remote_id.as_deref(),
        Some("pty-a")
    );
}

#[test_timeout::tokio_timeout_test]
async fn closing_the_tab_kills_the_terminal_once_and_releases_the_workspace() {
    let h = harness();
    let tab = h.dock.open_tab("shell").await.unwrap();
    let (session, mut workspace) = first_terminal(&h, tab, "pty-a").await;

    h.dock.close_tab(tab).await.unwrap();

    assert_eq!(
        workspace.terminal.recv_json().await.unwrap(),
        json!({"type": "kill", "session_id": "pty-a"})
    );
    assert_eq!(workspace.terminal.recv_text().await, None);
    assert_eq!(workspace.media.recv_text().await, None);
    assert!(matches!(
        h.dock.session(session).await,
        Err(DockError::NotFound(_))
    ));
    assert!(h.dock.tabs().await.unwrap().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn workspace_stays_open_until_its_last_terminal_closes() {
    let h = harness();
    let tab_a = h.dock.open_tab("a").await.unwrap();
    let tab_b = h.dock.open_tab("b").await.unwrap();
    let (a, mut workspace) = first_terminal(&h, tab_a, "pty-a").await;
    let b = h
        .dock
        .create_terminal_session(tab_b, WORKSPACE, None)
        .await
        .unwrap();
    acknowledge(&h.dock, &mut workspace, b, "pty-b").await;
    let endpoint = workspace.terminal.endpoint.clone();

    h.dock.close(a).await.unwrap();
    assert_eq!(
        workspace.terminal.recv_json().await.unwrap(),
        json!({"type": "kill", "session_id": "pty-a"})
    );
    assert_eq!(h.connector.live_links(&endpoint), 1);
    assert_eq!(h.dock.tab(tab_a).await.unwrap().session, None);

    h.dock.close(b).await.unwrap();
    assert_eq!(
        workspace.terminal.recv_json().await.unwrap(),
        json!({"type": "kill", "session_id": "pty-b"})
    );
    assert_eq!(workspace.terminal.recv_text().await, None);
    let connector = h.connector.clone();
    support::eventually(|| connector.live_links(&endpoint) == 0).await;
}

#[test_timeout::tokio_timeout_test]
async fn terminal_closed_before_created_is_killed_on_ack() {
    let h = harness();
    let tab_a = h.dock.open_tab("a").await.unwrap();
    let tab_b = h.dock.open_tab("b").await.unwrap();
    let (_a, mut workspace) = first_terminal(&h, tab_a, "pty-a").await;

    let b = h
        .dock
        .create_terminal_session(tab_b, WORKSPACE, None)
        .await
        .unwrap();
    let create = workspace.terminal.recv_json().await.unwrap();
    h.dock.close(b).await.unwrap();
    assert!(matches!(h.dock.session(b).await, Err(DockError::NotFound(_))));

    workspace.terminal.send_json(json!({
        "type": "created",
        "session_id": "pty-b",
        "request_id": create["request_id"],
    }));
    assert_eq!(
        workspace.terminal.recv_json().await.unwrap(),
        json!({"type": "kill", "session_id": "pty-b"})
    );
    assert_eq!(h.dock.sessions().await.unwrap().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn controls_become_terminal_frames() {
    let h = harness();
    let tab = h.dock.open_tab("shell").await.unwrap();
    let (session, mut workspace) = first_terminal(&h, tab, "pty-a").await;

    h.dock.resize(session, 40, 120).await.unwrap();
    h.dock.send_stdin(session, "ls\n").await.unwrap();
    h.dock.signal(session, "SIGTSTP").await.unwrap();
    h.dock.cancel(session).await.unwrap();

    let mut frames: Vec<Value> = Vec::new();
    for _ in 0..4 {
        frames.push(workspace.terminal.recv_json().await.unwrap());
    }
    assert_eq!(
        frames,
        vec![
            json!({"type": "resize", "session_id": "pty-a", "rows": 40, "cols": 120}),
            json!({"type": "input", "session_id": "pty-a", "data": "ls\n"}),
            json!({"type": "signal", "session_id": "pty-a", "signal": "SIGTSTP"}),
            json!({"type": "signal", "session_id": "pty-a", "signal": "SIGINT"}),
        ]
    );
    // Interrupting a shell does not end the session.
    assert_eq!(
        h.dock.session(session).await.unwrap().status,
        SessionStatus::Running
    );

    h.dock
        .emit_media(
            session,
            MediaKind::File,
            "report.pdf",
            Some("file:///tmp/report.pdf".into()),
        )
        .await
        .unwrap();
    assert_eq!(
        workspace.media.recv_json().await.unwrap(),
        json!({
            "type": "emit",
            "event": {"session_id": "pty-a", "kind": "file", "title": "report.pdf", "uri": "file:///tmp/report.pdf"},
        })
    );
}

#[test_timeout::tokio_timeout_test]
async fn failed_workspace_open_fails_waiting_creates() {
    let h = harness();
    h.connector.refuse(ChannelRole::Media, "ticket rejected");
    let tab = h.dock.open_tab("shell").await.unwrap();

    let err = h
        .dock
        .create_terminal_session(tab, WORKSPACE, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DockError::Transport(_)), "unexpected error: {err}");
    assert!(h.dock.sessions().await.unwrap().is_empty());
    assert_eq!(h.dock.tab(tab).await.unwrap().session, None);

    // The half-open terminal channel is released with the failed pair.
    let mut stale = h.connector.accept(ChannelRole::Terminal).await;
    assert_eq!(stale.recv_text().await, None);

    h.connector.allow(ChannelRole::Media);
    let (session, _workspace) = first_terminal(&h, tab, "pty-a").await;
    assert_eq!(
        h.dock.session(session).await.unwrap().status,
        SessionStatus::Running
    );
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn reconnect_reattaches_terminals_and_resumes_media() {
    let h = harness();
    let tab = h.dock.open_tab("shell").await.unwrap();
    let (session, workspace) = first_terminal(&h, tab, "pty-a").await;
    let Workspace { terminal, media } = workspace;

    for sequence in 0..=2 {
        terminal.send_json(json!({"type": "output", "session_id": "pty-a", "sequence": sequence, "data": format!("{sequence}")}));
    }
    media.send_json(json!({
        "type": "event",
        "sequence": 1,
        "event": {"session_id": "pty-a", "kind": "video", "title": "demo.mp4"},
    }));
    wait_for(&h.dock, session, |s| {
        s.last_sequence == Some(2) && s.media_events.len() == 1
    })
    .await;

    drop(terminal);
    wait_for(&h.dock, session, |s| s.status == SessionStatus::Reconnecting).await;
    let mut terminal = h.connector.accept(ChannelRole::Terminal).await;
    assert_eq!(
        terminal.recv_json().await.unwrap(),
        json!({"type": "attach", "session_id": "pty-a", "from_sequence": 2})
    );
    wait_for(&h.dock, session, |s| s.status == SessionStatus::Running).await;

    drop(media);
    let mut media = h.connector.accept(ChannelRole::Media).await;
    assert_eq!(
        media.recv_json().await.unwrap(),
        json!({"type": "subscribe", "from_sequence": 1})
    );
    media.send_json(json!({
        "type": "event",
        "sequence": 1,
        "event": {"session_id": "pty-a", "kind": "video", "title": "demo.mp4"},
    }));
    terminal.send_json(json!({"type": "output", "session_id": "pty-a", "sequence": 2, "data": "2"}));
    terminal.send_json(json!({"type": "output", "session_id": "pty-a", "sequence": 3, "data": "3"}));

    let snapshot = wait_for(&h.dock, session, |s| s.last_sequence == Some(3)).await;
    assert_eq!(snapshot.output, vec!["0", "1", "2", "3"]);
    assert_eq!(snapshot.media_events.len(), 1);
    assert_eq!(h.connector.peak_live(), 1);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn unacknowledged_create_is_resent_after_reconnect() {
    let h = harness();
    let tab_a = h.dock.open_tab("a").await.unwrap();
    let tab_b = h.dock.open_tab("b").await.unwrap();
    let (a, workspace) = first_terminal(&h, tab_a, "pty-a").await;
    let Workspace { mut terminal, media } = workspace;

    let b = h
        .dock
        .create_terminal_session(tab_b, WORKSPACE, None)
        .await
        .unwrap();
    let create = terminal.recv_json().await.unwrap();
    assert_eq!(create["type"], "create");

    // The channel drops before the backend acknowledges b.
    drop(terminal);
    wait_for(&h.dock, a, |s| s.status == SessionStatus::Reconnecting).await;
    let mut workspace = Workspace {
        terminal: h.connector.accept(ChannelRole::Terminal).await,
        media,
    };
    let resent = workspace.terminal.recv_json().await.unwrap();
    assert_eq!(resent, create);
    assert_eq!(
        workspace.terminal.recv_json().await.unwrap(),
        json!({"type": "attach", "session_id": "pty-a", "from_sequence": 0})
    );

    workspace.terminal.send_json(json!({
        "type": "created",
        "session_id": "pty-b",
        "request_id": create["request_id"],
    }));
    let snapshot = wait_for(&h.dock, b, |s| s.status == SessionStatus::Running).await;
    assert_eq!(snapshot.remote_id.as_deref(), Some("pty-b"));
}
