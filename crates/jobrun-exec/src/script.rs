use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jobrun_core::{ExecutionResult, RunStatus};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::tail::LineTail;

/// Environment variables injected into every script child process.
pub const ENV_DB_PATH: &str = "JR_DB_PATH";
pub const ENV_JOB_ID: &str = "JR_JOB_ID";
pub const ENV_RUN_ID: &str = "JR_RUN_ID";

const RESULT_MARKER_PREFIX: &str = "JR_RESULT:";

/// How long a timed-out child gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long the stream readers may lag behind child exit. Guards against
/// grandchildren that inherit the pipes and never close them.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Input to [`run_script`].
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    /// Path to the executable entity to launch.
    pub script: String,
    /// Database path exported to the child.
    pub db_path: String,
    pub job_id: String,
    pub run_id: i64,
    /// Wall-clock budget; `None` means unlimited.
    pub timeout_ms: Option<u64>,
}

/// Map a script path to the (command, args) pair that launches it.
///
/// Extension matching is case-insensitive. Unknown extensions (and none at
/// all) run the path directly as a host binary.
pub fn resolve_command(script: &str) -> (String, Vec<String>) {
    let ext = Path::new(script)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "ps1" => (
            "powershell".to_string(),
            vec!["-NoProfile".to_string(), "-File".to_string(), script.to_string()],
        ),
        "cmd" | "bat" => ("cmd".to_string(), vec!["/C".to_string(), script.to_string()]),
        "sh" => ("sh".to_string(), vec![script.to_string()]),
        _ => (script.to_string(), Vec::new()),
    }
}

/// Structured metadata a script reports via `JR_RESULT:` stdout lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ResultMarker {
    tokens: Option<i64>,
    meta: Option<String>,
}

/// Parse one stdout line as a result marker, if it is a valid one.
fn parse_result_marker(line: &str) -> Option<ResultMarker> {
    let rest = line.strip_prefix(RESULT_MARKER_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(rest).ok()?;
    let obj = value.as_object()?;
    Some(ResultMarker {
        tokens: obj.get("tokens").and_then(|v| v.as_i64()),
        meta: obj.get("meta").and_then(|v| v.as_str()).map(str::to_string),
    })
}

/// Run a script job to completion and reduce it to an [`ExecutionResult`].
///
/// Never returns an error: spawn failures, non-zero exits, and timeouts all
/// become terminal results for the run record.
pub async fn run_script(req: &ScriptRequest) -> ExecutionResult {
    let (program, args) = resolve_command(&req.script);
    debug!(job_id = %req.job_id, run_id = req.run_id, %program, "spawning script");

    let started = Instant::now();
    let spawned = Command::new(&program)
        .args(&args)
        .env(ENV_DB_PATH, &req.db_path)
        .env(ENV_JOB_ID, &req.job_id)
        .env(ENV_RUN_ID, req.run_id.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            return ExecutionResult::failed(started.elapsed().as_millis() as i64, e.to_string())
        }
    };

    // Both streams are drained concurrently into shared ring buffers so a
    // chatty child never fills a pipe and deadlocks against our wait().
    let stdout_capture: Arc<Mutex<(LineTail, Option<ResultMarker>)>> = Arc::default();
    let stderr_capture: Arc<Mutex<LineTail>> = Arc::default();

    let mut stdout_task = spawn_stdout_reader(child.stdout.take(), Arc::clone(&stdout_capture));
    let mut stderr_task = spawn_tail_reader(child.stderr.take(), Arc::clone(&stderr_capture));

    let (wait_result, timed_out) = wait_with_timeout(&mut child, req.timeout_ms).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    drain_reader(&mut stdout_task).await;
    drain_reader(&mut stderr_task).await;

    let (stdout_lines, marker) = std::mem::take(&mut *stdout_capture.lock().unwrap());
    let stdout_tail = stdout_lines.into_joined();
    let stderr_tail = std::mem::take(&mut *stderr_capture.lock().unwrap()).into_joined();

    if timed_out {
        let budget = req.timeout_ms.unwrap_or_default();
        return ExecutionResult {
            status: RunStatus::Timeout,
            duration_ms,
            exit_code: None,
            tokens: None,
            result_meta: None,
            error: Some(format!("Job timed out after {budget}ms")),
            stdout_tail,
            stderr_tail,
        };
    }

    match wait_result {
        Ok(status) => match status.code() {
            Some(0) => {
                let marker = marker.unwrap_or_default();
                ExecutionResult {
                    status: RunStatus::Ok,
                    duration_ms,
                    exit_code: Some(0),
                    tokens: marker.tokens,
                    result_meta: marker.meta,
                    error: None,
                    stdout_tail,
                    stderr_tail,
                }
            }
            Some(code) => {
                let error = stderr_tail
                    .clone()
                    .unwrap_or_else(|| format!("Exit code {code}"));
                ExecutionResult {
                    status: RunStatus::Error,
                    duration_ms,
                    exit_code: Some(code as i64),
                    tokens: None,
                    result_meta: None,
                    error: Some(error),
                    stdout_tail,
                    stderr_tail,
                }
            }
            None => ExecutionResult {
                status: RunStatus::Error,
                duration_ms,
                exit_code: None,
                tokens: None,
                result_meta: None,
                error: Some(
                    stderr_tail
                        .clone()
                        .unwrap_or_else(|| "Process terminated by signal".to_string()),
                ),
                stdout_tail,
                stderr_tail,
            },
        },
        Err(e) => ExecutionResult {
            status: RunStatus::Error,
            duration_ms,
            exit_code: None,
            tokens: None,
            result_meta: None,
            error: Some(e.to_string()),
            stdout_tail,
            stderr_tail,
        },
    }
}

fn spawn_stdout_reader<R>(
    pipe: Option<R>,
    capture: Arc<Mutex<(LineTail, Option<ResultMarker>)>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(pipe) = pipe else { return };
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut guard = capture.lock().unwrap();
            if let Some(marker) = parse_result_marker(&line) {
                // Last valid marker wins.
                guard.1 = Some(marker);
            }
            guard.0.push(&line);
        }
    })
}

fn spawn_tail_reader<R>(pipe: Option<R>, capture: Arc<Mutex<LineTail>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(pipe) = pipe else { return };
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            capture.lock().unwrap().push(&line);
        }
    })
}

/// Wait for the reader to hit EOF, but only for [`READER_GRACE`]: a
/// grandchild holding the inherited pipe open must not stall run
/// completion.
async fn drain_reader(task: &mut JoinHandle<()>) {
    if tokio::time::timeout(READER_GRACE, &mut *task).await.is_err() {
        task.abort();
    }
}

async fn wait_with_timeout(
    child: &mut Child,
    timeout_ms: Option<u64>,
) -> (std::io::Result<std::process::ExitStatus>, bool) {
    let Some(ms) = timeout_ms else {
        return (child.wait().await, false);
    };
    match tokio::time::timeout(Duration::from_millis(ms), child.wait()).await {
        Ok(status) => (status, false),
        Err(_) => (terminate(child).await, true),
    }
}

/// Graceful-then-forced termination: SIGTERM, then SIGKILL after
/// [`KILL_GRACE`] if the child is still alive.
async fn terminate(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Safety: pid is our direct, still-running child.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
            return status;
        }
        warn!(pid, "child survived SIGTERM grace period, sending SIGKILL");
    }
    child.kill().await?;
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn command_resolution_by_extension() {
        let (cmd, args) = resolve_command("C:/jobs/report.PS1");
        assert_eq!(cmd, "powershell");
        assert_eq!(args, vec!["-NoProfile", "-File", "C:/jobs/report.PS1"]);

        let (cmd, args) = resolve_command("build.cmd");
        assert_eq!((cmd.as_str(), args.len()), ("cmd", 2));
        let (cmd, _) = resolve_command("build.BAT");
        assert_eq!(cmd, "cmd");

        let (cmd, args) = resolve_command("/opt/jobs/sync.sh");
        assert_eq!(cmd, "sh");
        assert_eq!(args, vec!["/opt/jobs/sync.sh"]);

        let (cmd, args) = resolve_command("/opt/jobs/sync");
        assert_eq!(cmd, "/opt/jobs/sync");
        assert!(args.is_empty());
    }

    #[test]
    fn marker_parsing() {
        let m = parse_result_marker(r#"JR_RESULT:{"tokens": 42, "meta": "done"}"#).unwrap();
        assert_eq!(m.tokens, Some(42));
        assert_eq!(m.meta.as_deref(), Some("done"));

        // Either field may be absent.
        let m = parse_result_marker(r#"JR_RESULT:{"meta": "only"}"#).unwrap();
        assert_eq!(m.tokens, None);

        assert!(parse_result_marker("JR_RESULT:").is_none());
        assert!(parse_result_marker("JR_RESULT:not json").is_none());
        assert!(parse_result_marker(r#"JR_RESULT:["array"]"#).is_none());
        assert!(parse_result_marker("plain output").is_none());
    }

    fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{body}").unwrap();
        path.to_str().unwrap().to_string()
    }

    fn request(script: String, timeout_ms: Option<u64>) -> ScriptRequest {
        ScriptRequest {
            script,
            db_path: "/tmp/runner.sqlite".to_string(),
            job_id: "test-job".to_string(),
            run_id: 7,
            timeout_ms,
        }
    }

    #[tokio::test]
    async fn successful_run_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "ok.sh", "echo hello");
        let result = run_script(&request(script, None)).await;

        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout_tail.as_deref().unwrap().contains("hello"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn environment_is_injected() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "env.sh",
            r#"echo "$JR_JOB_ID/$JR_RUN_ID/$JR_DB_PATH""#,
        );
        let result = run_script(&request(script, None)).await;
        assert_eq!(
            result.stdout_tail.as_deref(),
            Some("test-job/7//tmp/runner.sqlite")
        );
    }

    #[tokio::test]
    async fn last_valid_marker_wins() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "marker.sh",
            concat!(
                "echo 'JR_RESULT:{\"tokens\": 1, \"meta\": \"first\"}'\n",
                "echo 'JR_RESULT:not json'\n",
                "echo 'JR_RESULT:{\"tokens\": 99, \"meta\": \"last\"}'",
            ),
        );
        let result = run_script(&request(script, None)).await;
        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.tokens, Some(99));
        assert_eq!(result.result_meta.as_deref(), Some("last"));
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_error_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "fail.sh", "echo 'went wrong' >&2; exit 3");
        let result = run_script(&request(script, None)).await;

        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.error.as_deref(), Some("went wrong"));
    }

    #[tokio::test]
    async fn nonzero_exit_without_stderr_reports_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "silent.sh", "exit 2");
        let result = run_script(&request(script, None)).await;
        assert_eq!(result.error.as_deref(), Some("Exit code 2"));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_terminal_result() {
        let result = run_script(&request("/does/not/exist".to_string(), None)).await;
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(result.exit_code, None);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn timeout_terminates_the_child() {
        let dir = tempfile::tempdir().unwrap();
        // exec replaces sh so the signal lands on sleep itself.
        let script = write_script(&dir, "slow.sh", "exec sleep 30");
        let started = Instant::now();
        let result = run_script(&request(script, Some(300))).await;

        assert_eq!(result.status, RunStatus::Timeout);
        assert_eq!(result.exit_code, None);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
        // SIGTERM must cut the run well short of the 30 s sleep.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn long_output_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "chatty.sh", "seq 1 500");
        let result = run_script(&request(script, None)).await;

        let tail = result.stdout_tail.unwrap();
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), crate::tail::MAX_TAIL_LINES);
        assert_eq!(lines.first().copied(), Some("401"));
        assert_eq!(lines.last().copied(), Some("500"));
    }
}
