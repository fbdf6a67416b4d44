use jobrun_core::{now_ms, ExecutionResult, Run, RunStatus, Trigger};
use rusqlite::Row;

use crate::error::Result;
use crate::store::Store;

/// Accessor for the `runs` table.
///
/// A run is inserted with status `running` when the controller dispatches a
/// job and updated exactly once with the terminal result.
pub struct Runs<'a> {
    store: &'a Store,
}

impl<'a> Runs<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Open a run record at dispatch time. Returns the new run id.
    pub fn open(&self, job_id: &str, trigger: Trigger) -> Result<i64> {
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO runs (job_id, status, started_at, trigger) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                job_id,
                RunStatus::Running.to_string(),
                now_ms(),
                trigger.to_string()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Close a run record with the executor's terminal result.
    pub fn close(&self, run_id: i64, result: &ExecutionResult) -> Result<()> {
        let conn = self.store.conn();
        conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, duration_ms = ?3,
                exit_code = ?4, tokens = ?5, result_meta = ?6, error = ?7,
                stdout_tail = ?8, stderr_tail = ?9
             WHERE id = ?10",
            rusqlite::params![
                result.status.to_string(),
                now_ms(),
                result.duration_ms,
                result.exit_code,
                result.tokens,
                result.result_meta,
                result.error,
                result.stdout_tail,
                result.stderr_tail,
                run_id,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs for a job, newest first.
    pub fn list_for_job(&self, job_id: &str, limit: usize) -> Result<Vec<Run>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, status, started_at, finished_at, duration_ms, exit_code,
                    tokens, result_meta, error, stdout_tail, stderr_tail, trigger
             FROM runs WHERE job_id = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(rusqlite::params![job_id, limit as i64], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Fetch one run by id.
    pub fn get(&self, run_id: i64) -> Result<Option<Run>> {
        let conn = self.store.conn();
        match conn.query_row(
            "SELECT id, job_id, status, started_at, finished_at, duration_ms, exit_code,
                    tokens, result_meta, error, stdout_tail, stderr_tail, trigger
             FROM runs WHERE id = ?1",
            [run_id],
            row_to_run,
        ) {
            Ok(run) => Ok(Some(run)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Count runs finished since `cutoff`, split into (ok, errored).
    ///
    /// Feeds the `/stats` endpoint; `timeout` counts as an error.
    pub fn counts_since(&self, cutoff: i64) -> Result<(i64, i64)> {
        let conn = self.store.conn();
        let ok: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE finished_at >= ?1 AND status = 'ok'",
            [cutoff],
            |row| row.get(0),
        )?;
        let errors: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs
             WHERE finished_at >= ?1 AND status IN ('error', 'timeout')",
            [cutoff],
            |row| row.get(0),
        )?;
        Ok((ok, errors))
    }

    /// Retention sweep: delete runs started before `cutoff`.
    pub fn delete_started_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.store.conn();
        Ok(conn.execute("DELETE FROM runs WHERE started_at < ?1", [cutoff])?)
    }
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(2)?;
    let trigger: String = row.get(12)?;
    Ok(Run {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        duration_ms: row.get(5)?,
        exit_code: row.get(6)?,
        tokens: row.get(7)?,
        result_meta: row.get(8)?,
        error: row.get(9)?,
        stdout_tail: row.get(10)?,
        stderr_tail: row.get(11)?,
        trigger: trigger.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, e.into())
        })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::sample_job;

    fn ok_result(duration_ms: i64) -> ExecutionResult {
        ExecutionResult {
            status: RunStatus::Ok,
            duration_ms,
            exit_code: Some(0),
            tokens: Some(120),
            result_meta: Some("done".into()),
            error: None,
            stdout_tail: Some("hello".into()),
            stderr_tail: None,
        }
    }

    #[test]
    fn open_then_close_updates_once() {
        let store = Store::open_in_memory().unwrap();
        store.jobs().insert(&sample_job("j1")).unwrap();

        let id = store.runs().open("j1", Trigger::Schedule).unwrap();
        let run = store.runs().get(id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());

        store.runs().close(id, &ok_result(42)).unwrap();
        let run = store.runs().get(id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(run.duration_ms, Some(42));
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.tokens, Some(120));
        assert_eq!(run.stdout_tail.as_deref(), Some("hello"));
        assert!(run.finished_at.is_some());
        assert_eq!(run.trigger, Trigger::Schedule);
    }

    #[test]
    fn list_is_newest_first_and_limited() {
        let store = Store::open_in_memory().unwrap();
        store.jobs().insert(&sample_job("j1")).unwrap();

        let mut last = 0;
        for _ in 0..5 {
            last = store.runs().open("j1", Trigger::Manual).unwrap();
        }
        let runs = store.runs().list_for_job("j1", 3).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].id, last);
    }

    #[test]
    fn counts_since_splits_ok_and_errors() {
        let store = Store::open_in_memory().unwrap();
        store.jobs().insert(&sample_job("j1")).unwrap();

        let ok_id = store.runs().open("j1", Trigger::Schedule).unwrap();
        store.runs().close(ok_id, &ok_result(1)).unwrap();

        let err_id = store.runs().open("j1", Trigger::Schedule).unwrap();
        let mut failed = ok_result(1);
        failed.status = RunStatus::Timeout;
        store.runs().close(err_id, &failed).unwrap();

        let (ok, errors) = store.runs().counts_since(0).unwrap();
        assert_eq!((ok, errors), (1, 1));

        let (ok, errors) = store.runs().counts_since(i64::MAX).unwrap();
        assert_eq!((ok, errors), (0, 0));
    }

    #[test]
    fn retention_deletes_old_rows_only() {
        let store = Store::open_in_memory().unwrap();
        store.jobs().insert(&sample_job("j1")).unwrap();

        let old = store.runs().open("j1", Trigger::Schedule).unwrap();
        let fresh = store.runs().open("j1", Trigger::Schedule).unwrap();
        store
            .execute_raw("UPDATE runs SET started_at = 1000 WHERE id = ?1", &[&old])
            .unwrap();

        let deleted = store.runs().delete_started_before(2000).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.runs().get(old).unwrap().is_none());
        assert!(store.runs().get(fresh).unwrap().is_some());
    }
}
