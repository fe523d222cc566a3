//! HTTP client for the job execution backend.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::DockConfig;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("invalid backend configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartJobRequest {
    pub workspace: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StartJobResponse {
    #[serde(alias = "jobId")]
    pub job_id: String,
}

#[derive(Debug, Serialize)]
struct StdinRequest<'a> {
    text: &'a str,
}

/// Control-plane operations on remote jobs. Output never flows through here;
/// it arrives on the job's stream channel.
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn start_job(&self, request: &StartJobRequest) -> Result<StartJobResponse, BackendError>;

    async fn cancel_job(&self, job_id: &str) -> Result<(), BackendError>;

    async fn send_stdin(&self, job_id: &str, text: &str) -> Result<(), BackendError>;
}

pub struct HttpJobBackend {
    client: reqwest::Client,
    config: DockConfig,
}

impl HttpJobBackend {
    pub fn new(config: &DockConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn post(&self, segments: &[&str]) -> Result<reqwest::RequestBuilder, BackendError> {
        let endpoint = self
            .config
            .api_url(segments)
            .map_err(|err| BackendError::InvalidConfig(err.to_string()))?;
        let request = self.client.post(endpoint);
        Ok(match self.config.ticket() {
            Some(ticket) => request.bearer_auth(ticket),
            None => request,
        })
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.is_client_error() {
        let body = response.text().await.unwrap_or_default();
        let body = body.trim();
        if !body.is_empty() {
            return Err(BackendError::Rejected(format!("{status}: {body}")));
        }
    }
    Err(BackendError::HttpStatus(status))
}

#[async_trait]
impl JobBackend for HttpJobBackend {
    async fn start_job(&self, request: &StartJobRequest) -> Result<StartJobResponse, BackendError> {
        let response = self.post(&["jobs"])?.json(request).send().await?;
        let response = ensure_success(response).await?;
        let payload = response.json::<StartJobResponse>().await?;
        if payload.job_id.trim().is_empty() {
            return Err(BackendError::InvalidResponse("empty job id".into()));
        }
        debug!(job_id = %payload.job_id, command = %request.command, "job started");
        Ok(payload)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), BackendError> {
        let response = self.post(&["jobs", job_id, "cancel"])?.send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn send_stdin(&self, job_id: &str, text: &str) -> Result<(), BackendError> {
        let response = self
            .post(&["jobs", job_id, "stdin"])?
            .json(&StdinRequest { text })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::post;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorded {
        calls: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
    }

    fn bearer(headers: &HeaderMap) -> Option<String> {
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    async fn start(
        State(recorded): State<Recorded>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Result<Json<Value>, (AxumStatus, String)> {
        if body["command"] == "forbidden" {
            return Err((AxumStatus::FORBIDDEN, "command not allowed".into()));
        }
        recorded
            .calls
            .lock()
            .await
            .push(("start".into(), bearer(&headers), body));
        Ok(Json(json!({"jobId": "job-42"})))
    }

    async fn cancel(
        State(recorded): State<Recorded>,
        Path(id): Path<String>,
        headers: HeaderMap,
    ) -> Json<Value> {
        recorded
            .calls
            .lock()
            .await
            .push((format!("cancel {id}"), bearer(&headers), Value::Null));
        Json(json!({"ok": true}))
    }

    async fn stdin(
        State(recorded): State<Recorded>,
        Path(id): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        recorded
            .calls
            .lock()
            .await
            .push((format!("stdin {id}"), bearer(&headers), body));
        Json(json!({"ok": true}))
    }

    async fn serve() -> (String, Recorded) {
        let recorded = Recorded::default();
        let app = Router::new()
            .route("/jobs", post(start))
            .route("/jobs/:id/cancel", post(cancel))
            .route("/jobs/:id/stdin", post(stdin))
            .with_state(recorded.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), recorded)
    }

    #[tokio::test]
    async fn job_calls_hit_the_expected_routes_with_ticket() {
        let (base, recorded) = serve().await;
        let config = DockConfig::new(&base).unwrap().with_ticket("secret");
        let backend = HttpJobBackend::new(&config).unwrap();

        let started = backend
            .start_job(&StartJobRequest {
                workspace: "/srv/app".into(),
                command: "echo hello".into(),
            })
            .await
            .unwrap();
        assert_eq!(started.job_id, "job-42");
        backend.send_stdin("job-42", "y\n").await.unwrap();
        backend.cancel_job("job-42").await.unwrap();

        let calls = recorded.calls.lock().await.clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].0, "start");
        assert_eq!(calls[0].1.as_deref(), Some("Bearer secret"));
        assert_eq!(
            calls[0].2,
            json!({"workspace": "/srv/app", "command": "echo hello"})
        );
        assert_eq!(calls[1].0, "stdin job-42");
        assert_eq!(calls[1].2, json!({"text": "y\n"}));
        assert_eq!(calls[2].0, "cancel job-42");
    }

    #[tokio::test]
    async fn rejected_start_carries_the_server_message() {
        let (base, _recorded) = serve().await;
        let backend = HttpJobBackend::new(&DockConfig::new(&base).unwrap()).unwrap();
        let err = backend
            .start_job(&StartJobRequest {
                workspace: "/".into(),
                command: "forbidden".into(),
            })
            .await
            .unwrap_err();
        match err {
            BackendError::Rejected(message) => assert!(message.contains("command not allowed")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
