use jobrun_core::{now_ms, Job, JobType, OverlapPolicy, RunStatus};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::store::Store;

/// Input for creating a job declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub id: String,
    pub name: String,
    pub schedule: String,
    pub script: String,
    #[serde(rename = "type", default = "default_job_type")]
    pub job_type: JobType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    #[serde(default = "default_overlap_policy")]
    pub overlap_policy: OverlapPolicy,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub on_success: Option<String>,
}

fn default_job_type() -> JobType {
    JobType::Script
}
fn default_enabled() -> bool {
    true
}
fn default_overlap_policy() -> OverlapPolicy {
    OverlapPolicy::Skip
}

/// A job row joined with its most recent run, as served by `GET /jobs`.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    #[serde(flatten)]
    pub job: Job,
    pub last_status: Option<RunStatus>,
    pub last_run: Option<i64>,
}

/// Accessor for the `jobs` table.
pub struct Jobs<'a> {
    store: &'a Store,
}

impl<'a> Jobs<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Insert a new job declaration. Fails if the id is already taken.
    pub fn insert(&self, new: &NewJob) -> Result<Job> {
        let now = now_ms();
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO jobs
             (id, name, schedule, script, job_type, description, enabled,
              timeout_ms, overlap_policy, on_failure, on_success, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?12)",
            rusqlite::params![
                new.id,
                new.name,
                new.schedule,
                new.script,
                new.job_type.to_string(),
                new.description,
                new.enabled,
                new.timeout_ms,
                new.overlap_policy.to_string(),
                new.on_failure,
                new.on_success,
                now,
            ],
        )?;
        info!(job_id = %new.id, name = %new.name, "job added");
        Ok(Job {
            id: new.id.clone(),
            name: new.name.clone(),
            schedule: new.schedule.clone(),
            script: new.script.clone(),
            job_type: new.job_type,
            description: new.description.clone(),
            enabled: new.enabled,
            timeout_ms: new.timeout_ms,
            overlap_policy: new.overlap_policy,
            on_failure: new.on_failure.clone(),
            on_success: new.on_success.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch a job by id.
    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.store.conn();
        match conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            row_to_job,
        ) {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a job only if it is currently enabled.
    ///
    /// Used by the cron fire path so live disables and edits take effect
    /// without a restart.
    pub fn get_enabled(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.store.conn();
        match conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1 AND enabled = 1"),
            [id],
            row_to_job,
        ) {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Result<Vec<Job>> {
        let conn = self.store.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at"))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// All enabled jobs, oldest first.
    pub fn list_enabled(&self) -> Result<Vec<Job>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE enabled = 1 ORDER BY created_at"
        ))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// All jobs joined with the status and start time of their latest run.
    pub fn list_with_last_run(&self) -> Result<Vec<JobSummary>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS_PREFIXED}, r.status, r.started_at
             FROM jobs j
             LEFT JOIN runs r ON r.id = (
                 SELECT id FROM runs WHERE job_id = j.id
                 ORDER BY started_at DESC, id DESC LIMIT 1
             )
             ORDER BY j.created_at"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                let job = row_to_job(row)?;
                let last_status: Option<String> = row.get(13)?;
                let last_run: Option<i64> = row.get(14)?;
                Ok(JobSummary {
                    job,
                    last_status: last_status.and_then(|s| s.parse().ok()),
                    last_run,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Flip the enabled flag. Returns false when the job does not exist.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let conn = self.store.conn();
        let changed = conn.execute(
            "UPDATE jobs SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![enabled, now_ms(), id],
        )?;
        if changed > 0 {
            info!(job_id = %id, enabled, "job enabled flag updated");
        }
        Ok(changed > 0)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.store.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?)
    }
}

const JOB_COLUMNS: &str = "id, name, schedule, script, job_type, description, enabled, \
     timeout_ms, overlap_policy, on_failure, on_success, created_at, updated_at";

const JOB_COLUMNS_PREFIXED: &str =
    "j.id, j.name, j.schedule, j.script, j.job_type, j.description, j.enabled, \
     j.timeout_ms, j.overlap_policy, j.on_failure, j.on_success, j.created_at, j.updated_at";

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let job_type: String = row.get(4)?;
    let overlap_policy: String = row.get(8)?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        schedule: row.get(2)?,
        script: row.get(3)?,
        job_type: job_type.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
        })?,
        description: row.get(5)?,
        enabled: row.get(6)?,
        timeout_ms: row.get(7)?,
        overlap_policy: overlap_policy.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, e.into())
        })?,
        on_failure: row.get(9)?,
        on_success: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

#[cfg(test)]
pub(crate) fn sample_job(id: &str) -> NewJob {
    NewJob {
        id: id.to_string(),
        name: format!("Job {id}"),
        schedule: "*/5 * * * * *".to_string(),
        script: "/bin/true".to_string(),
        job_type: JobType::Script,
        description: None,
        enabled: true,
        timeout_ms: None,
        overlap_policy: OverlapPolicy::Skip,
        on_failure: None,
        on_success: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrun_core::Trigger;

    #[test]
    fn insert_and_get_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let new = sample_job("hello");
        store.jobs().insert(&new).unwrap();

        let job = store.jobs().get("hello").unwrap().expect("job missing");
        assert_eq!(job.name, "Job hello");
        assert_eq!(job.job_type, JobType::Script);
        assert_eq!(job.overlap_policy, OverlapPolicy::Skip);
        assert!(job.enabled);
        assert!(store.jobs().get("nope").unwrap().is_none());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.jobs().insert(&sample_job("dup")).unwrap();
        assert!(store.jobs().insert(&sample_job("dup")).is_err());
    }

    #[test]
    fn get_enabled_respects_flag() {
        let store = Store::open_in_memory().unwrap();
        store.jobs().insert(&sample_job("j1")).unwrap();
        assert!(store.jobs().get_enabled("j1").unwrap().is_some());

        assert!(store.jobs().set_enabled("j1", false).unwrap());
        assert!(store.jobs().get_enabled("j1").unwrap().is_none());
        assert!(store.jobs().get("j1").unwrap().is_some());

        assert!(!store.jobs().set_enabled("ghost", false).unwrap());
    }

    #[test]
    fn list_enabled_filters() {
        let store = Store::open_in_memory().unwrap();
        store.jobs().insert(&sample_job("a")).unwrap();
        store.jobs().insert(&sample_job("b")).unwrap();
        store.jobs().set_enabled("a", false).unwrap();

        let enabled = store.jobs().list_enabled().unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "b");
        assert_eq!(store.jobs().list().unwrap().len(), 2);
    }

    #[test]
    fn summary_carries_latest_run() {
        let store = Store::open_in_memory().unwrap();
        store.jobs().insert(&sample_job("j1")).unwrap();

        let summaries = store.jobs().list_with_last_run().unwrap();
        assert!(summaries[0].last_status.is_none());

        let run_id = store.runs().open("j1", Trigger::Manual).unwrap();
        store
            .runs()
            .close(
                run_id,
                &jobrun_core::ExecutionResult {
                    status: RunStatus::Ok,
                    duration_ms: 5,
                    exit_code: Some(0),
                    tokens: None,
                    result_meta: None,
                    error: None,
                    stdout_tail: None,
                    stderr_tail: None,
                },
            )
            .unwrap();

        let summaries = store.jobs().list_with_last_run().unwrap();
        assert_eq!(summaries[0].last_status, Some(RunStatus::Ok));
        assert!(summaries[0].last_run.is_some());
    }
}
