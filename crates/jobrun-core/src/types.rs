use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// All persisted timestamps use this representation so retention math is
/// plain integer arithmetic.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// How a job is executed when its schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// The `script` field names a host-OS executable; run it as a child process.
    Script,
    /// The `script` field names or contains a prompt; delegate to the session gateway.
    Session,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobType::Script => "script",
            JobType::Session => "session",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "script" => Ok(JobType::Script),
            "session" => Ok(JobType::Session),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Rule applied when a scheduled fire would start a job that is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop the fire and log it.
    Skip,
    /// Accepted in the schema; runs as `skip` at runtime.
    Queue,
    /// Start a second concurrent run.
    Allow,
}

impl std::fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OverlapPolicy::Skip => "skip",
            OverlapPolicy::Queue => "queue",
            OverlapPolicy::Allow => "allow",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(OverlapPolicy::Skip),
            "queue" => Ok(OverlapPolicy::Queue),
            "allow" => Ok(OverlapPolicy::Allow),
            other => Err(format!("unknown overlap policy: {other}")),
        }
    }
}

/// Terminal and in-flight states of a run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Ok,
    Error,
    Timeout,
    Skipped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
            RunStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "ok" => Ok(RunStatus::Ok),
            "error" => Ok(RunStatus::Error),
            "timeout" => Ok(RunStatus::Timeout),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What caused a run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Schedule,
    Manual,
    Retry,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::Schedule => "schedule",
            Trigger::Manual => "manual",
            Trigger::Retry => "retry",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(Trigger::Schedule),
            "manual" => Ok(Trigger::Manual),
            "retry" => Ok(Trigger::Retry),
            other => Err(format!("unknown trigger: {other}")),
        }
    }
}

/// A persisted job declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable caller-supplied id — primary key.
    pub id: String,
    /// Human-readable label used in notifications.
    pub name: String,
    /// Cron token with 5 or 6 fields (6 = leading seconds field).
    pub schedule: String,
    /// Executable path (script jobs) or prompt text / prompt file (session jobs).
    pub script: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub description: Option<String>,
    pub enabled: bool,
    /// Per-run wall-clock budget in milliseconds; `None` means unlimited.
    pub timeout_ms: Option<i64>,
    pub overlap_policy: OverlapPolicy,
    /// Notification channel for failed runs, if any.
    pub on_failure: Option<String>,
    /// Notification channel for successful runs, if any.
    pub on_success: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One recorded execution attempt of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub job_id: String,
    pub status: RunStatus,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i64>,
    /// Token usage reported by session jobs or result markers.
    pub tokens: Option<i64>,
    pub result_meta: Option<String>,
    pub error: Option<String>,
    pub stdout_tail: Option<String>,
    pub stderr_tail: Option<String>,
    pub trigger: Trigger,
}

/// What an executor hands back to the run controller.
///
/// The controller copies this verbatim into the run row; executors never
/// touch the database themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: RunStatus,
    pub duration_ms: i64,
    pub exit_code: Option<i64>,
    pub tokens: Option<i64>,
    pub result_meta: Option<String>,
    pub error: Option<String>,
    pub stdout_tail: Option<String>,
    pub stderr_tail: Option<String>,
}

impl ExecutionResult {
    /// A terminal error result with no captured output.
    pub fn failed(duration_ms: i64, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            duration_ms,
            exit_code: None,
            tokens: None,
            result_meta: None,
            error: Some(error.into()),
            stdout_tail: None,
            stderr_tail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_round_trip() {
        for s in ["script", "session"] {
            let t: JobType = s.parse().expect("parse failed");
            assert_eq!(t.to_string(), s);
        }
        assert!("shell".parse::<JobType>().is_err());
    }

    #[test]
    fn overlap_policy_round_trip() {
        for s in ["skip", "queue", "allow"] {
            let p: OverlapPolicy = s.parse().expect("parse failed");
            assert_eq!(p.to_string(), s);
        }
        assert!("defer".parse::<OverlapPolicy>().is_err());
    }

    #[test]
    fn run_status_round_trip() {
        for s in ["pending", "running", "ok", "error", "timeout", "skipped"] {
            let st: RunStatus = s.parse().expect("parse failed");
            assert_eq!(st.to_string(), s);
        }
    }

    #[test]
    fn job_serializes_type_field_name() {
        let job = Job {
            id: "j1".into(),
            name: "Job 1".into(),
            schedule: "* * * * *".into(),
            script: "/bin/true".into(),
            job_type: JobType::Script,
            description: None,
            enabled: true,
            timeout_ms: None,
            overlap_policy: OverlapPolicy::Skip,
            on_failure: None,
            on_success: None,
            created_at: 0,
            updated_at: 0,
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains(r#""type":"script""#));
        assert!(json.contains(r#""overlap_policy":"skip""#));
    }
}
