#![allow(dead_code)]

use async_trait::async_trait;
use beach_dock::backend::{BackendError, JobBackend, StartJobRequest, StartJobResponse};
use beach_dock::config::DockConfig;
use beach_dock::transport::memory::MemoryConnector;
use beach_dock::{DockHandle, SessionId, SessionSnapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Records every control-plane call and hands out `job-1`, `job-2`, ...
#[derive(Default)]
pub struct RecordingBackend {
    started: Mutex<Vec<StartJobRequest>>,
    cancelled: Mutex<Vec<String>>,
    stdin: Mutex<Vec<(String, String)>>,
    refuse_next: Mutex<Option<String>>,
}

impl RecordingBackend {
    pub fn refuse_next_start(&self, reason: impl Into<String>) {
        *self.refuse_next.lock() = Some(reason.into());
    }

    pub fn started(&self) -> Vec<StartJobRequest> {
        self.started.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    pub fn stdin(&self) -> Vec<(String, String)> {
        self.stdin.lock().clone()
    }
}

#[async_trait]
impl JobBackend for RecordingBackend {
    async fn start_job(&self, request: &StartJobRequest) -> Result<StartJobResponse, BackendError> {
        if let Some(reason) = self.refuse_next.lock().take() {
            return Err(BackendError::Rejected(reason));
        }
        let mut started = self.started.lock();
        started.push(request.clone());
        Ok(StartJobResponse {
            job_id: format!("job-{}", started.len()),
        })
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), BackendError> {
        self.cancelled.lock().push(job_id.to_string());
        Ok(())
    }

    async fn send_stdin(&self, job_id: &str, text: &str) -> Result<(), BackendError> {
        self.stdin
            .lock()
            .push((job_id.to_string(), text.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub dock: DockHandle,
    pub connector: MemoryConnector,
    pub backend: Arc<RecordingBackend>,
}

pub fn harness() -> Harness {
    harness_with(|config| config)
}

pub fn harness_with(configure: impl FnOnce(DockConfig) -> DockConfig) -> Harness {
    let config = DockConfig::new("http://dock.test")
        .expect("valid test config")
        .with_reconnect_delay(RECONNECT_DELAY);
    let connector = MemoryConnector::new();
    let backend = Arc::new(RecordingBackend::default());
    let dock = DockHandle::spawn(
        configure(config),
        Arc::new(connector.clone()),
        backend.clone(),
    );
    Harness {
        dock,
        connector,
        backend,
    }
}

/// Polls the session until `ready` holds.
pub async fn wait_for(
    dock: &DockHandle,
    session: SessionId,
    mut ready: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    loop {
        let snapshot = dock.session(session).await.expect("session exists");
        if ready(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Polls until `check` holds; for state that lives outside the engine.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
