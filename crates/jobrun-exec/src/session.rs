use std::path::Path;
use std::time::{Duration, Instant};

use jobrun_core::{ExecutionResult, RunStatus};
use tracing::{debug, warn};

use crate::error::{ExecError, Result};
use crate::gateway::{GatewayClient, SpawnOptions};

/// Default wall-clock budget for a session job.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 300_000;
/// First completion poll happens after this long.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

const POLL_BACKOFF_FACTOR: f64 = 1.2;
const POLL_INTERVAL_CAP_MS: u64 = 15_000;

/// Input to [`run_session`].
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Prompt text, or a path to a `.md`/`.txt` prompt file.
    pub script: String,
    pub job_id: String,
    pub timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

/// Turn the job's script value into the prompt sent to the gateway.
///
/// `.md`/`.txt` are read from disk; executable-looking extensions are a
/// configuration error (that job should be script-type); anything else is
/// taken as the prompt text verbatim.
pub fn resolve_prompt(script: &str) -> Result<String> {
    let ext = Path::new(script)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "md" | "txt" => std::fs::read_to_string(script)
            .map_err(|e| ExecError::Config(format!("failed to read prompt file '{script}': {e}"))),
        "js" | "mjs" | "cjs" | "ps1" | "cmd" | "bat" => Err(ExecError::Config(format!(
            "'{script}' names an executable script; use a script job instead"
        ))),
        _ => Ok(script.to_string()),
    }
}

fn next_poll_interval(current: Duration) -> Duration {
    let grown = (current.as_millis() as f64 * POLL_BACKOFF_FACTOR) as u64;
    Duration::from_millis(grown.min(POLL_INTERVAL_CAP_MS))
}

/// Run a session job: spawn on the gateway, poll until the assistant
/// finishes, collect token accounting.
///
/// Like the script variant, all failure modes reduce to a terminal
/// [`ExecutionResult`].
pub async fn run_session(req: &SessionRequest, client: &dyn GatewayClient) -> ExecutionResult {
    let started = Instant::now();
    let timeout_ms = req.timeout_ms.unwrap_or(DEFAULT_SESSION_TIMEOUT_MS);

    let prompt = match resolve_prompt(&req.script) {
        Ok(prompt) => prompt,
        Err(e) => return session_error(started, e.to_string()),
    };

    let opts = SpawnOptions {
        label: req.job_id.clone(),
        thinking: "low".to_string(),
        run_timeout_seconds: timeout_ms / 1000,
    };
    let session = match client.spawn_session(&prompt, &opts).await {
        Ok(session) => session,
        Err(e) => return session_error(started, e.to_string()),
    };
    debug!(job_id = %req.job_id, session_key = %session.session_key, "session spawned");

    let mut interval =
        Duration::from_millis(req.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS));
    loop {
        if started.elapsed() >= Duration::from_millis(timeout_ms) {
            return ExecutionResult {
                status: RunStatus::Timeout,
                duration_ms: started.elapsed().as_millis() as i64,
                exit_code: None,
                tokens: None,
                result_meta: Some(session.session_key.clone()),
                error: Some(format!("Session timed out after {timeout_ms}ms")),
                stdout_tail: None,
                stderr_tail: None,
            };
        }

        tokio::time::sleep(interval).await;
        match client.is_session_complete(&session.session_key).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => return session_error(started, e.to_string()),
        }
        interval = next_poll_interval(interval);
    }

    let tokens = match client.get_session_info(&session.session_key).await {
        Ok(Some(info)) => {
            debug!(
                session_key = %session.session_key,
                tokens = info.total_tokens,
                model = %info.model,
                "session accounting retrieved"
            );
            Some(info.total_tokens)
        }
        Ok(None) => {
            warn!(session_key = %session.session_key, "session info unavailable");
            None
        }
        Err(e) => return session_error(started, e.to_string()),
    };

    ExecutionResult {
        status: RunStatus::Ok,
        duration_ms: started.elapsed().as_millis() as i64,
        exit_code: None,
        tokens,
        result_meta: Some(session.session_key.clone()),
        error: None,
        stdout_tail: Some(format!("Session completed: {}", session.session_key)),
        stderr_tail: None,
    }
}

fn session_error(started: Instant, message: String) -> ExecutionResult {
    ExecutionResult {
        status: RunStatus::Error,
        duration_ms: started.elapsed().as_millis() as i64,
        exit_code: None,
        tokens: None,
        result_meta: None,
        error: Some(message.clone()),
        stdout_tail: None,
        stderr_tail: Some(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{SessionInfo, SpawnedSession};
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Scripted gateway: completes after a fixed number of polls.
    struct FakeGateway {
        polls_until_complete: u64,
        polls_seen: AtomicU64,
        info: Option<SessionInfo>,
        spawn_opts: Mutex<Option<SpawnOptions>>,
    }

    impl FakeGateway {
        fn completing_after(polls: u64, tokens: Option<i64>) -> Self {
            Self {
                polls_until_complete: polls,
                polls_seen: AtomicU64::new(0),
                info: tokens.map(|total_tokens| SessionInfo {
                    total_tokens,
                    model: "test-model".to_string(),
                    transcript_path: None,
                }),
                spawn_opts: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl GatewayClient for FakeGateway {
        async fn spawn_session(
            &self,
            _prompt: &str,
            opts: &SpawnOptions,
        ) -> crate::Result<SpawnedSession> {
            *self.spawn_opts.lock().unwrap() = Some(opts.clone());
            Ok(SpawnedSession {
                session_key: "sess-1".to_string(),
                run_id: "r-1".to_string(),
            })
        }

        async fn is_session_complete(&self, _session_key: &str) -> crate::Result<bool> {
            let seen = self.polls_seen.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(seen >= self.polls_until_complete)
        }

        async fn get_session_info(&self, _session_key: &str) -> crate::Result<Option<SessionInfo>> {
            Ok(self.info.clone())
        }
    }

    fn request(script: &str) -> SessionRequest {
        SessionRequest {
            script: script.to_string(),
            job_id: "digest".to_string(),
            timeout_ms: Some(10_000),
            poll_interval_ms: Some(10),
        }
    }

    #[test]
    fn prompt_resolution_rules() {
        assert_eq!(
            resolve_prompt("Summarize yesterday's runs").unwrap(),
            "Summarize yesterday's runs"
        );
        for script in ["job.js", "job.mjs", "job.cjs", "job.ps1", "job.cmd", "job.bat"] {
            assert!(
                matches!(resolve_prompt(script), Err(ExecError::Config(_))),
                "{script} should be rejected"
            );
        }
        assert!(matches!(
            resolve_prompt("/missing/prompt.md"),
            Err(ExecError::Config(_))
        ));
    }

    #[test]
    fn prompt_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.md");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "# Do the thing").unwrap();
        assert_eq!(resolve_prompt(path.to_str().unwrap()).unwrap(), "# Do the thing");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut interval = Duration::from_millis(5_000);
        interval = next_poll_interval(interval);
        assert_eq!(interval, Duration::from_millis(6_000));
        for _ in 0..20 {
            interval = next_poll_interval(interval);
        }
        assert_eq!(interval, Duration::from_millis(POLL_INTERVAL_CAP_MS));
    }

    #[tokio::test]
    async fn completed_session_reports_tokens_and_key() {
        let gateway = FakeGateway::completing_after(3, Some(1234));
        let result = run_session(&request("do it"), &gateway).await;

        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.tokens, Some(1234));
        assert_eq!(result.result_meta.as_deref(), Some("sess-1"));
        assert_eq!(result.stdout_tail.as_deref(), Some("Session completed: sess-1"));

        let opts = gateway.spawn_opts.lock().unwrap().clone().unwrap();
        assert_eq!(opts.label, "digest");
        assert_eq!(opts.thinking, "low");
        assert_eq!(opts.run_timeout_seconds, 10);
    }

    #[tokio::test]
    async fn missing_session_info_is_tolerated() {
        let gateway = FakeGateway::completing_after(1, None);
        let result = run_session(&request("do it"), &gateway).await;
        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.tokens, None);
    }

    #[tokio::test]
    async fn slow_session_times_out() {
        let gateway = FakeGateway::completing_after(u64::MAX, None);
        let mut req = request("do it");
        req.timeout_ms = Some(50);
        let result = run_session(&req, &gateway).await;

        assert_eq!(result.status, RunStatus::Timeout);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn executable_script_value_fails_the_run() {
        let gateway = FakeGateway::completing_after(1, None);
        let result = run_session(&request("deploy.js"), &gateway).await;
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.stderr_tail.as_deref().unwrap().contains("script job"));
    }
}
