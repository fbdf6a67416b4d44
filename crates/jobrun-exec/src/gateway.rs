use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ExecError, Result};

/// Options passed to the gateway when spawning a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOptions {
    /// Shown in the gateway's session list; set to the job id.
    pub label: String,
    pub thinking: String,
    pub run_timeout_seconds: u64,
}

/// Identity of a spawned session.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedSession {
    pub session_key: String,
    pub run_id: String,
}

/// Token accounting returned once a session completes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub total_tokens: i64,
    pub model: String,
    #[serde(default)]
    pub transcript_path: Option<String>,
}

/// Client interface to the remote agent host that runs session jobs.
///
/// The runner only needs three calls: spawn, poll, and final accounting.
/// The trait keeps the gateway swappable (and trivially mockable in tests).
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn spawn_session(&self, prompt: &str, opts: &SpawnOptions) -> Result<SpawnedSession>;

    /// A session is complete when its latest message is from the assistant
    /// and carries a non-null stop reason.
    async fn is_session_complete(&self, session_key: &str) -> Result<bool>;

    /// `None` when the gateway no longer knows the session; callers treat
    /// that as "no token accounting available".
    async fn get_session_info(&self, session_key: &str) -> Result<Option<SessionInfo>>;
}

/// HTTP implementation of [`GatewayClient`].
pub struct HttpGatewayClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestMessage {
    role: String,
    #[serde(default)]
    stop_reason: Option<String>,
}

impl HttpGatewayClient {
    /// Build a client against `base_url`, reading the bearer token from
    /// `token_path` when given. A missing token file downgrades to
    /// unauthenticated calls with a warning.
    pub fn new(base_url: &str, token_path: Option<&str>) -> Self {
        let token = token_path.and_then(|path| match std::fs::read_to_string(path) {
            Ok(raw) => Some(raw.trim().to_string()),
            Err(e) => {
                warn!(path, "failed to read gateway token: {e}");
                None
            }
        });
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn spawn_session(&self, prompt: &str, opts: &SpawnOptions) -> Result<SpawnedSession> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct SpawnBody<'a> {
            prompt: &'a str,
            #[serde(flatten)]
            opts: &'a SpawnOptions,
        }

        let response = self
            .request(reqwest::Method::POST, "/api/sessions")
            .json(&SpawnBody { prompt, opts })
            .send()
            .await
            .map_err(|e| ExecError::Gateway(format!("spawn request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ExecError::Gateway(format!(
                "spawn rejected with status {}",
                response.status()
            )));
        }

        let session: SpawnedSession = response
            .json()
            .await
            .map_err(|e| ExecError::Gateway(format!("bad spawn response: {e}")))?;
        debug!(session_key = %session.session_key, "session spawned");
        Ok(session)
    }

    async fn is_session_complete(&self, session_key: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/sessions/{session_key}/latest-message"),
            )
            .send()
            .await
            .map_err(|e| ExecError::Gateway(format!("poll request failed: {e}")))?;

        // No message yet — the session is still warming up.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(ExecError::Gateway(format!(
                "poll rejected with status {}",
                response.status()
            )));
        }

        let latest: LatestMessage = response
            .json()
            .await
            .map_err(|e| ExecError::Gateway(format!("bad poll response: {e}")))?;
        Ok(latest.role == "assistant" && latest.stop_reason.is_some())
    }

    async fn get_session_info(&self, session_key: &str) -> Result<Option<SessionInfo>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/api/sessions/{session_key}"))
            .send()
            .await
            .map_err(|e| ExecError::Gateway(format!("info request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ExecError::Gateway(format!(
                "info rejected with status {}",
                response.status()
            )));
        }

        let info: SessionInfo = response
            .json()
            .await
            .map_err(|e| ExecError::Gateway(format!("bad info response: {e}")))?;
        Ok(Some(info))
    }
}
