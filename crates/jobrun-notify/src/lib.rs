//! `jobrun-notify` — run outcome notifications.
//!
//! The run controller talks to a two-method [`Notifier`] interface; the
//! Slack implementation behind it is deliberately boring. Notification
//! failures are never allowed to affect a run — callers catch and log.

pub mod slack;

use async_trait::async_trait;
use thiserror::Error;

pub use slack::SlackNotifier;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification failed: {0}")]
    Send(String),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

/// Delivery interface for run outcome messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_success(&self, job_name: &str, duration_ms: i64, channel: &str) -> Result<()>;

    async fn notify_failure(
        &self,
        job_name: &str,
        duration_ms: i64,
        error: Option<&str>,
        channel: &str,
    ) -> Result<()>;
}

fn duration_secs(duration_ms: i64) -> i64 {
    (duration_ms as f64 / 1000.0).round() as i64
}

/// `✅ *<jobName>* completed (<durationSec>s)`
pub fn format_success(job_name: &str, duration_ms: i64) -> String {
    format!("✅ *{job_name}* completed ({}s)", duration_secs(duration_ms))
}

/// `⚠️ *<jobName>* failed (<durationSec>s)[: <error>]`
pub fn format_failure(job_name: &str, duration_ms: i64, error: Option<&str>) -> String {
    let mut message = format!("⚠️ *{job_name}* failed ({}s)", duration_secs(duration_ms));
    if let Some(error) = error {
        message.push_str(": ");
        message.push_str(error);
    }
    message
}
