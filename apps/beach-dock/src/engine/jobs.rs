//! Job sessions: one backend job and one stream channel each.
//!
//! `starting` until the backend hands out a job id and the stream is open,
//! then `running` until a terminal status arrives or the job is cancelled or
//! killed locally. Cancellation trips the session's token, which closes the
//! stream channel and with it any in-flight read or reconnect.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Control, Engine, EngineEvent, Reply, respond};
use crate::backend::{JobBackend, StartJobRequest};
use crate::config::DockConfig;
use crate::error::DockError;
use crate::protocol::OutboundFrame;
use crate::session::{ChannelOwner, SessionId, SessionKind, SessionLink, SessionStatus, TabId};
use crate::transport::{ChannelId, ChannelOptions, Connector, TransportChannel};

impl Engine {
    pub(super) fn create_job(
        &mut self,
        tab: TabId,
        command: String,
        workspace: String,
        reply: Reply<SessionId>,
    ) {
        if !self.registry.contains_tab(tab) {
            respond(reply, Err(DockError::TabNotFound(tab)));
            return;
        }
        let channel = self.registry.reserve_channel();
        let cancel = CancellationToken::new();
        let session = self.registry.insert_session(
            SessionKind::Job,
            Some(command.clone()),
            workspace.clone(),
            SessionLink::Job {
                channel,
                stream: None,
                cancel: cancel.clone(),
            },
        );
        self.registry
            .register_channel(channel, ChannelOwner::Job(session));
        if let Err(err) = self.registry.bind_tab(tab, session) {
            warn!(%session, error = %err, "failed to bind job to tab");
        }
        self.pending_jobs.insert(session, reply);

        info!(%session, %command, %workspace, "starting job");
        tokio::spawn(start_job_stream(JobStart {
            session,
            channel,
            request: StartJobRequest { workspace, command },
            config: self.config.clone(),
            connector: self.connector.clone(),
            backend: self.backend.clone(),
            inbox: self.inbox.clone(),
            cancel,
        }));
    }

    pub(super) fn job_opened(&mut self, session: SessionId, job_id: String, stream: TransportChannel) {
        let Some(entry) = self.registry.session_mut(session) else {
            debug!(%session, %job_id, "job session closed while starting");
            stream.close();
            self.spawn_cancel(job_id);
            return;
        };
        entry.remote_id = Some(job_id.clone());
        if entry.status.is_terminal() {
            debug!(%session, %job_id, status = %entry.status, "job stopped while starting");
            stream.close();
            self.spawn_cancel(job_id);
        } else {
            let subscribe = OutboundFrame::Subscribe {
                job_id: Some(job_id.clone()),
                from_sequence: Some(entry.cursor.resume_from()),
            };
            if let Err(err) = stream.send(&subscribe) {
                warn!(%session, error = %err, "failed to subscribe to job stream");
            }
            if let SessionLink::Job { stream: slot, .. } = &mut entry.link {
                *slot = Some(stream);
            }
            info!(%session, %job_id, "job running");
            self.registry.set_status(session, SessionStatus::Running);
        }
        if let Some(reply) = self.pending_jobs.remove(&session) {
            respond(reply, Ok(session));
        }
    }

    pub(super) fn job_failed(&mut self, session: SessionId, error: DockError) {
        let reply = self.pending_jobs.remove(&session);
        let stopped_locally = self
            .registry
            .session(session)
            .map(|entry| entry.status.is_terminal());
        match stopped_locally {
            // Cancelled or killed before it ever ran; keep it readable.
            Some(true) => {
                debug!(%session, error = %error, "job start abandoned");
                if let Some(reply) = reply {
                    respond(reply, Ok(session));
                }
            }
            Some(false) => {
                warn!(%session, error = %error, "job failed to start");
                self.registry.remove_session(session);
                if let Some(reply) = reply {
                    respond(reply, Err(error));
                }
            }
            None => debug!(%session, error = %error, "job start failed after close"),
        }
    }

    pub(super) fn job_control(&mut self, session: SessionId, control: Control) {
        let Some(entry) = self.registry.session(session) else {
            return;
        };
        let remote_id = entry.remote_id.clone();
        let status = entry.status;
        match control {
            Control::Cancel => self.stop_job(session, remote_id, SessionStatus::Cancelled),
            Control::Kill => self.stop_job(session, remote_id, SessionStatus::Killed),
            Control::Stdin(text) => match remote_id {
                Some(job_id) if status == SessionStatus::Running => {
                    let backend = self.backend.clone();
                    tokio::spawn(async move {
                        if let Err(err) = backend.send_stdin(&job_id, &text).await {
                            warn!(%job_id, error = %err, "failed to forward stdin");
                        }
                    });
                }
                _ => debug!(%session, %status, "ignoring stdin for job that is not running"),
            },
            Control::Signal(_) | Control::Resize { .. } => {}
        }
    }

    /// Trips the job's token, which closes its stream, and asks the backend
    /// to stop it. The local status changes immediately.
    fn stop_job(&mut self, session: SessionId, remote_id: Option<String>, status: SessionStatus) {
        if let Some(SessionLink::Job { cancel, .. }) =
            self.registry.session(session).map(|entry| &entry.link)
        {
            cancel.cancel();
        }
        self.registry.set_status(session, status);
        match remote_id {
            Some(job_id) => self.spawn_cancel(job_id),
            // The start task cancels the job once it learns the id.
            None => debug!(%session, "job stopped before it started"),
        }
    }

    /// Requests a replay from the cursor on the job's current stream.
    pub(super) fn replay_job(&mut self, session: SessionId) {
        let Some(entry) = self.registry.session(session) else {
            return;
        };
        if entry.status.is_terminal() {
            return;
        }
        let (Some(job_id), SessionLink::Job {
            stream: Some(stream),
            ..
        }) = (&entry.remote_id, &entry.link)
        else {
            return;
        };
        let subscribe = OutboundFrame::Subscribe {
            job_id: Some(job_id.clone()),
            from_sequence: Some(entry.cursor.resume_from()),
        };
        if let Err(err) = stream.send(&subscribe) {
            warn!(%session, error = %err, "failed to resubscribe job stream");
        }
    }

    pub(super) fn job_disconnected(&mut self, session: SessionId) {
        let running = self
            .registry
            .session(session)
            .is_some_and(|entry| entry.status == SessionStatus::Running);
        if running {
            self.registry
                .set_status(session, SessionStatus::Reconnecting);
        }
    }

    pub(super) fn job_reconnected(&mut self, session: SessionId) {
        self.replay_job(session);
        let reconnecting = self
            .registry
            .session(session)
            .is_some_and(|entry| entry.status == SessionStatus::Reconnecting);
        if reconnecting {
            self.registry.set_status(session, SessionStatus::Running);
        }
    }

    fn spawn_cancel(&self, job_id: String) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(err) = backend.cancel_job(&job_id).await {
                warn!(%job_id, error = %err, "failed to cancel job");
            }
        });
    }
}

struct JobStart {
    session: SessionId,
    channel: ChannelId,
    request: StartJobRequest,
    config: DockConfig,
    connector: Arc<dyn Connector>,
    backend: Arc<dyn JobBackend>,
    inbox: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
}

/// Starts the job and opens its stream, then reports back to the engine.
async fn start_job_stream(start: JobStart) {
    let JobStart {
        session,
        channel,
        request,
        config,
        connector,
        backend,
        inbox,
        cancel,
    } = start;

    let started = match backend.start_job(&request).await {
        Ok(started) => started,
        Err(err) => {
            let _ = inbox.send(EngineEvent::JobFailed {
                session,
                error: err.into(),
            });
            return;
        }
    };
    let job_id = started.job_id;

    let opened = match config.job_stream_endpoint(&job_id) {
        Ok(endpoint) => {
            let options =
                ChannelOptions::new(config.reconnect_delay()).with_shutdown(cancel.clone());
            TransportChannel::open(channel, endpoint, connector, inbox.clone(), options)
                .await
                .map_err(DockError::from)
        }
        Err(err) => Err(DockError::from(err)),
    };

    let event = match opened {
        Ok(stream) => EngineEvent::JobOpened {
            session,
            job_id,
            stream,
        },
        Err(error) => {
            // The job exists on the backend but nobody can watch it.
            if let Err(err) = backend.cancel_job(&job_id).await {
                warn!(%job_id, error = %err, "failed to cancel unreachable job");
            }
            EngineEvent::JobFailed { session, error }
        }
    };
    let _ = inbox.send(event);
}
