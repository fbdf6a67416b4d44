use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{format_failure, format_success, Notifier, NotifyError, Result};

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Slack `chat.postMessage` notifier.
///
/// Built from a token file path so the secret never sits in the config
/// document itself. Without a token every send degrades to a single logged
/// warning — an unconfigured notifier must not fail runs.
pub struct SlackNotifier {
    token: Option<String>,
    http: reqwest::Client,
    missing_token_warned: AtomicBool,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackNotifier {
    pub fn from_token_path(token_path: Option<&str>) -> Self {
        let token = token_path.and_then(|path| match std::fs::read_to_string(path) {
            Ok(raw) => Some(raw.trim().to_string()),
            Err(e) => {
                warn!(path, "failed to read Slack token: {e}");
                None
            }
        });
        Self {
            token,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            missing_token_warned: AtomicBool::new(false),
        }
    }

    async fn post(&self, channel: &str, text: &str) -> Result<()> {
        let Some(token) = &self.token else {
            if !self.missing_token_warned.swap(true, Ordering::Relaxed) {
                warn!("no Slack token configured — notifications will be dropped");
            }
            return Ok(());
        };

        let response = self
            .http
            .post(POST_MESSAGE_URL)
            .bearer_auth(token)
            .json(&serde_json::json!({ "channel": channel, "text": text }))
            .send()
            .await
            .map_err(|e| NotifyError::Send(e.to_string()))?;

        let body: PostMessageResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::Send(format!("bad Slack response: {e}")))?;

        if !body.ok {
            return Err(NotifyError::Send(format!(
                "Slack rejected the message: {}",
                body.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        debug!(channel, "notification delivered");
        Ok(())
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify_success(&self, job_name: &str, duration_ms: i64, channel: &str) -> Result<()> {
        self.post(channel, &format_success(job_name, duration_ms)).await
    }

    async fn notify_failure(
        &self,
        job_name: &str,
        duration_ms: i64,
        error: Option<&str>,
        channel: &str,
    ) -> Result<()> {
        self.post(channel, &format_failure(job_name, duration_ms, error)).await
    }
}
