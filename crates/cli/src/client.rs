//! HTTP client for the daemon's control endpoint.
//!
//! Also owns the auto-launch handshake: when no daemon answers, the client
//! spawns `portaged` detached and polls the readiness endpoint with backoff
//! before retrying. The daemon core knows nothing about this.

use portage_daemon::server::{
    EnqueueRequest, EnqueueResponse, ErrorResponse, FlushRequest, OkResponse, ProgressResponse,
    QueuesResponse, SelectRequest, StatusResponse,
};
use portage_daemon::FlushOutcome;
use serde::de::DeserializeOwned;
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;

const LAUNCH_POLL_INTERVAL_MS: u64 = 250;
const LAUNCH_POLL_ATTEMPTS: u32 = 40;

/// Error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0} (is the daemon running?)")]
    Http(#[from] reqwest::Error),

    #[error("daemon rejected request: {0}")]
    Rejected(String),

    #[error("failed to launch daemon: {0}")]
    Launch(std::io::Error),

    #[error("timed out waiting for daemon to become ready")]
    LaunchTimeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client for one daemon instance on localhost.
pub struct DaemonClient {
    base: String,
    port: u16,
    http: reqwest::Client,
}

impl DaemonClient {
    pub fn new(port: u16) -> Self {
        Self {
            base: format!("http://127.0.0.1:{}", port),
            port,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let error = response
                .json::<ErrorResponse>()
                .await
                .map(|e| e.error)
                .unwrap_or_else(|_| "unknown error".to_string());
            Err(ClientError::Rejected(error))
        }
    }

    async fn post_empty(&self, path: &str) -> Result<OkResponse, ClientError> {
        let response = self.http.post(self.url(path)).send().await?;
        self.decode(response).await
    }

    /// True when a daemon answers the readiness endpoint.
    pub async fn ping(&self) -> bool {
        self.http
            .get(self.url("/ping"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Make sure a daemon is reachable, launching one when necessary.
    pub async fn ensure_daemon(&self) -> Result<(), ClientError> {
        if self.ping().await {
            return Ok(());
        }

        Command::new("portaged")
            .arg("--port")
            .arg(self.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(ClientError::Launch)?;

        for _ in 0..LAUNCH_POLL_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(LAUNCH_POLL_INTERVAL_MS)).await;
            if self.ping().await {
                return Ok(());
            }
        }
        Err(ClientError::LaunchTimeout)
    }

    pub async fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueResponse, ClientError> {
        let response = self
            .http
            .post(self.url("/enqueue"))
            .json(request)
            .send()
            .await?;
        self.decode(response).await
    }

    pub async fn start(&self) -> Result<OkResponse, ClientError> {
        self.post_empty("/queue/start").await
    }

    pub async fn pause(&self) -> Result<OkResponse, ClientError> {
        self.post_empty("/queue/pause").await
    }

    pub async fn stop(&self) -> Result<OkResponse, ClientError> {
        self.post_empty("/queue/stop").await
    }

    pub async fn shutdown(&self) -> Result<OkResponse, ClientError> {
        self.post_empty("/shutdown").await
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        let response = self.http.get(self.url("/status")).send().await?;
        self.decode(response).await
    }

    pub async fn progress(&self) -> Result<ProgressResponse, ClientError> {
        let response = self.http.get(self.url("/progress")).send().await?;
        self.decode(response).await
    }

    pub async fn flush(&self, request: &FlushRequest) -> Result<FlushOutcome, ClientError> {
        let response = self
            .http
            .post(self.url("/queue/flush"))
            .json(request)
            .send()
            .await?;
        self.decode(response).await
    }

    pub async fn select_queue(&self, name: String) -> Result<OkResponse, ClientError> {
        let response = self
            .http
            .post(self.url("/queue/select"))
            .json(&SelectRequest { name })
            .send()
            .await?;
        self.decode(response).await
    }

    pub async fn queues(&self) -> Result<QueuesResponse, ClientError> {
        let response = self.http.get(self.url("/queues")).send().await?;
        self.decode(response).await
    }
}
