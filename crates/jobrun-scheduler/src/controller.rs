use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jobrun_core::{ExecutionResult, Job, JobType, OverlapPolicy, RunStatus, Trigger};
use jobrun_exec::{run_script, run_session, GatewayClient, ScriptRequest, SessionRequest};
use jobrun_notify::Notifier;
use jobrun_store::Store;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::registry::{CronRegistry, ReconcileSummary};

/// Capacity of the registry → controller fire channel.
const FIRE_CHANNEL_CAPACITY: usize = 64;
/// Shutdown polls the running set at this cadence.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Controller knobs, lifted from the runner configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub db_path: String,
    pub max_concurrency: usize,
    pub shutdown_grace_ms: u64,
    /// 0 disables periodic reconciliation.
    pub reconcile_interval_ms: u64,
    pub default_on_failure: Option<String>,
    pub default_on_success: Option<String>,
}

/// The glue between cron fires and everything else: admission control,
/// overlap policy, run record lifecycle, executor dispatch, notifications.
#[derive(Clone)]
pub struct RunController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    registry: CronRegistry,
    notifier: Arc<dyn Notifier>,
    gateway: Arc<dyn GatewayClient>,
    cfg: SchedulerConfig,
    /// Job ids with a run in flight. Scheduled fires consult this for the
    /// overlap policy; admission consults its size for the concurrency cap.
    running: Mutex<HashSet<String>>,
    fired_rx: Mutex<Option<mpsc::Receiver<Job>>>,
    reconcile_stop: Mutex<Option<watch::Sender<bool>>>,
}

impl RunController {
    pub fn new(
        store: Store,
        notifier: Arc<dyn Notifier>,
        gateway: Arc<dyn GatewayClient>,
        cfg: SchedulerConfig,
    ) -> Self {
        let (fired_tx, fired_rx) = mpsc::channel(FIRE_CHANNEL_CAPACITY);
        let registry = CronRegistry::new(store.clone(), fired_tx);
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                notifier,
                gateway,
                cfg,
                running: Mutex::new(HashSet::new()),
                fired_rx: Mutex::new(Some(fired_rx)),
                reconcile_stop: Mutex::new(None),
            }),
        }
    }

    /// Reconcile the registry, start consuming cron fires, and kick off
    /// periodic reconciliation.
    ///
    /// When registrations failed and a default failure channel is
    /// configured, one summary notification is sent.
    pub async fn start(&self) -> Result<ReconcileSummary> {
        let summary = self.inner.registry.reconcile()?;
        info!(
            total_enabled = summary.total_enabled,
            failed = summary.failed_ids.len(),
            "scheduler started"
        );

        if !summary.failed_ids.is_empty() {
            if let Some(channel) = self.inner.cfg.default_on_failure.clone() {
                let detail = format!(
                    "{} schedule registration(s) failed: {}",
                    summary.failed_ids.len(),
                    summary.failed_ids.join(", ")
                );
                if let Err(e) = self
                    .inner
                    .notifier
                    .notify_failure("schedule registration", 0, Some(&detail), &channel)
                    .await
                {
                    warn!(error = %e, "startup failure notification could not be sent");
                }
            }
        }

        if let Some(mut fired_rx) = self.inner.fired_rx.lock().unwrap().take() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                while let Some(job) = fired_rx.recv().await {
                    // Each fire runs in its own task so one bad job can
                    // never suppress other fires.
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        inner.on_scheduled_run(job).await;
                    });
                }
            });
        }

        if self.inner.cfg.reconcile_interval_ms > 0 {
            let (stop_tx, mut stop_rx) = watch::channel(false);
            *self.inner.reconcile_stop.lock().unwrap() = Some(stop_tx);
            let inner = Arc::clone(&self.inner);
            let period = Duration::from_millis(self.inner.cfg.reconcile_interval_ms);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // the immediate first tick
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = inner.registry.reconcile() {
                                error!(error = %e, "periodic reconcile failed");
                            }
                        }
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        Ok(summary)
    }

    /// Cooperative shutdown: stop new fires, then wait for in-flight runs
    /// up to the configured grace period. No cancellation signal is sent to
    /// executors.
    pub async fn stop(&self) {
        if let Some(stop) = self.inner.reconcile_stop.lock().unwrap().take() {
            let _ = stop.send(true);
        }
        self.inner.registry.stop_all();

        let grace = Duration::from_millis(self.inner.cfg.shutdown_grace_ms);
        let started = Instant::now();
        loop {
            let remaining = self.inner.running.lock().unwrap().len();
            if remaining == 0 {
                break;
            }
            if started.elapsed() >= grace {
                warn!(remaining, "shutdown grace elapsed with runs still in flight");
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        info!("scheduler stopped");
    }

    /// Synchronous registry re-alignment; called when jobs are enabled or
    /// disabled through the API.
    pub fn reconcile_now(&self) -> Result<ReconcileSummary> {
        self.inner.registry.reconcile()
    }

    /// Manually trigger a job by id. Bypasses the overlap policy but not
    /// the concurrency cap.
    pub async fn trigger_job(&self, id: &str) -> Result<ExecutionResult> {
        let job = self
            .inner
            .store
            .jobs()
            .get(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        self.inner.run_job(&job, Trigger::Manual).await
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.lock().unwrap().len()
    }

    pub fn failed_registrations(&self) -> Vec<String> {
        self.inner.registry.failed_registrations()
    }

    /// Scheduled entry path, exposed for tests that simulate cron fires.
    pub async fn on_scheduled_run(&self, job: Job) {
        self.inner.on_scheduled_run(job).await;
    }
}

/// What the admission gate decided for a fire.
enum Admission {
    Admitted,
    Skipped,
}

impl Inner {
    /// Scheduled entry path: errors are logged and swallowed here —
    /// backpressure included.
    async fn on_scheduled_run(&self, job: Job) {
        match self.run_job(&job, Trigger::Schedule).await {
            Ok(_) => {}
            Err(SchedulerError::Backpressure { .. }) => {} // logged at admission
            Err(e) => error!(job_id = %job.id, error = %e, "scheduled run failed"),
        }
    }

    /// Overlap policy and the concurrency cap are decided under one lock:
    /// two concurrent fires of the same job id must never both pass the
    /// `contains` check before either inserts.
    fn admit(&self, job: &Job, trigger: Trigger) -> Result<Admission> {
        let mut running = self.running.lock().unwrap();

        // Overlap applies to scheduled fires only, so manual triggers can
        // start an allow-policy job alongside a running one.
        if trigger == Trigger::Schedule && running.contains(&job.id) {
            match job.overlap_policy {
                OverlapPolicy::Skip => {
                    info!(job_id = %job.id, "previous run still active — skipping fire");
                    return Ok(Admission::Skipped);
                }
                OverlapPolicy::Queue => {
                    info!(job_id = %job.id, "previous run still active — queue policy runs as skip");
                    return Ok(Admission::Skipped);
                }
                OverlapPolicy::Allow => {}
            }
        }

        if running.len() >= self.cfg.max_concurrency {
            warn!(
                job_id = %job.id,
                running = running.len(),
                max = self.cfg.max_concurrency,
                "concurrency cap reached — rejecting trigger"
            );
            return Err(SchedulerError::Backpressure {
                running: running.len(),
                max: self.cfg.max_concurrency,
            });
        }
        running.insert(job.id.clone());
        Ok(Admission::Admitted)
    }

    async fn run_job(&self, job: &Job, trigger: Trigger) -> Result<ExecutionResult> {
        if let Admission::Skipped = self.admit(job, trigger)? {
            return Ok(skipped_result());
        }

        let outcome = self.execute_run(job, trigger).await;
        self.running.lock().unwrap().remove(&job.id);
        outcome
    }

    async fn execute_run(&self, job: &Job, trigger: Trigger) -> Result<ExecutionResult> {
        let run_id = self.store.runs().open(&job.id, trigger)?;
        info!(job_id = %job.id, run_id, %trigger, "run started");

        let result = self.dispatch(job, run_id).await;

        if let Err(e) = self.store.runs().close(run_id, &result) {
            error!(job_id = %job.id, run_id, error = %e, "failed to close run record");
        }
        info!(
            job_id = %job.id,
            run_id,
            status = %result.status,
            duration_ms = result.duration_ms,
            "run finished"
        );

        self.dispatch_notifications(job, &result).await;
        Ok(result)
    }

    async fn dispatch(&self, job: &Job, run_id: i64) -> ExecutionResult {
        match job.job_type {
            JobType::Script => {
                run_script(&ScriptRequest {
                    script: job.script.clone(),
                    db_path: self.cfg.db_path.clone(),
                    job_id: job.id.clone(),
                    run_id,
                    timeout_ms: job.timeout_ms.map(|ms| ms as u64),
                })
                .await
            }
            JobType::Session => {
                run_session(
                    &SessionRequest {
                        script: job.script.clone(),
                        job_id: job.id.clone(),
                        timeout_ms: job.timeout_ms.map(|ms| ms as u64),
                        poll_interval_ms: None,
                    },
                    self.gateway.as_ref(),
                )
                .await
            }
        }
    }

    /// Notification failures are caught and logged; they never change a
    /// run's outcome.
    async fn dispatch_notifications(&self, job: &Job, result: &ExecutionResult) {
        if result.status == RunStatus::Ok {
            let channel = job
                .on_success
                .clone()
                .or_else(|| self.cfg.default_on_success.clone());
            if let Some(channel) = channel {
                if let Err(e) = self
                    .notifier
                    .notify_success(&job.name, result.duration_ms, &channel)
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "success notification failed");
                }
            }
        } else {
            let channel = job
                .on_failure
                .clone()
                .or_else(|| self.cfg.default_on_failure.clone());
            if let Some(channel) = channel {
                if let Err(e) = self
                    .notifier
                    .notify_failure(
                        &job.name,
                        result.duration_ms,
                        result.error.as_deref(),
                        &channel,
                    )
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "failure notification failed");
                }
            }
        }
    }
}

/// Result handed back for a fire the overlap policy dropped. Never
/// persisted: skipped fires do not open a run record.
fn skipped_result() -> ExecutionResult {
    ExecutionResult {
        status: RunStatus::Skipped,
        duration_ms: 0,
        exit_code: None,
        tokens: None,
        result_meta: None,
        error: None,
        stdout_tail: None,
        stderr_tail: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobrun_exec::{SessionInfo, SpawnOptions, SpawnedSession};
    use jobrun_notify::NotifyError;
    use jobrun_store::NewJob;
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    /// Records every delivery instead of talking to Slack.
    #[derive(Default)]
    struct RecordingNotifier {
        messages: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_success(
            &self,
            job_name: &str,
            _duration_ms: i64,
            channel: &str,
        ) -> jobrun_notify::Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((channel.to_string(), format!("ok:{job_name}")));
            Ok(())
        }

        async fn notify_failure(
            &self,
            job_name: &str,
            _duration_ms: i64,
            _error: Option<&str>,
            channel: &str,
        ) -> jobrun_notify::Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((channel.to_string(), format!("fail:{job_name}")));
            Ok(())
        }
    }

    /// Always-failing notifier, to prove delivery faults are isolated.
    struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        async fn notify_success(
            &self,
            _job_name: &str,
            _duration_ms: i64,
            _channel: &str,
        ) -> jobrun_notify::Result<()> {
            Err(NotifyError::Send("wire down".into()))
        }

        async fn notify_failure(
            &self,
            _job_name: &str,
            _duration_ms: i64,
            _error: Option<&str>,
            _channel: &str,
        ) -> jobrun_notify::Result<()> {
            Err(NotifyError::Send("wire down".into()))
        }
    }

    /// Gateway that must never be reached from script jobs.
    struct UnreachableGateway;

    #[async_trait]
    impl GatewayClient for UnreachableGateway {
        async fn spawn_session(
            &self,
            _prompt: &str,
            _opts: &SpawnOptions,
        ) -> jobrun_exec::Result<SpawnedSession> {
            Err(jobrun_exec::ExecError::Gateway("gateway offline".into()))
        }

        async fn is_session_complete(&self, _session_key: &str) -> jobrun_exec::Result<bool> {
            Err(jobrun_exec::ExecError::Gateway("gateway offline".into()))
        }

        async fn get_session_info(
            &self,
            _session_key: &str,
        ) -> jobrun_exec::Result<Option<SessionInfo>> {
            Err(jobrun_exec::ExecError::Gateway("gateway offline".into()))
        }
    }

    struct Harness {
        store: Store,
        controller: RunController,
        notifier: Arc<RecordingNotifier>,
        _dir: tempfile::TempDir,
    }

    fn harness(max_concurrency: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("runner.sqlite");
        let store = Store::open(db_path.to_str().unwrap()).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = RunController::new(
            store.clone(),
            notifier.clone(),
            Arc::new(UnreachableGateway),
            SchedulerConfig {
                db_path: db_path.to_str().unwrap().to_string(),
                max_concurrency,
                shutdown_grace_ms: 2_000,
                reconcile_interval_ms: 0,
                default_on_failure: None,
                default_on_success: None,
            },
        );
        Harness {
            store,
            controller,
            notifier,
            _dir: dir,
        }
    }

    fn script_job(h: &Harness, id: &str, body: &str, overlap: OverlapPolicy) -> Job {
        let path = h._dir.path().join(format!("{id}.sh"));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        h.store
            .jobs()
            .insert(&NewJob {
                id: id.to_string(),
                name: id.to_string(),
                schedule: "* * * * * *".to_string(),
                script: path.to_str().unwrap().to_string(),
                job_type: JobType::Script,
                description: None,
                enabled: true,
                timeout_ms: None,
                overlap_policy: overlap,
                on_failure: Some("C-fail".to_string()),
                on_success: Some("C-ok".to_string()),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn manual_trigger_records_a_run_and_notifies() {
        let h = harness(4);
        script_job(&h, "hello", "echo hello", OverlapPolicy::Skip);

        let result = h.controller.trigger_job("hello").await.unwrap();
        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.exit_code, Some(0));

        let runs = h.store.runs().list_for_job("hello", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Ok);
        assert_eq!(runs[0].trigger, Trigger::Manual);
        assert!(runs[0].stdout_tail.as_deref().unwrap().contains("hello"));

        let messages = h.notifier.messages.lock().unwrap().clone();
        assert_eq!(messages, vec![("C-ok".to_string(), "ok:hello".to_string())]);
        assert_eq!(h.controller.running_count(), 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let h = harness(4);
        let err = h.controller.trigger_job("ghost").await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn failed_run_dispatches_failure_notification() {
        let h = harness(4);
        script_job(&h, "broken", "exit 9", OverlapPolicy::Skip);

        let result = h.controller.trigger_job("broken").await.unwrap();
        assert_eq!(result.status, RunStatus::Error);

        let messages = h.notifier.messages.lock().unwrap().clone();
        assert_eq!(messages, vec![("C-fail".to_string(), "fail:broken".to_string())]);
    }

    #[tokio::test]
    async fn overlap_skip_allows_only_one_concurrent_run() {
        let h = harness(4);
        let job = script_job(&h, "slow", "sleep 1", OverlapPolicy::Skip);

        let first = {
            let controller = h.controller.clone();
            let job = job.clone();
            tokio::spawn(async move { controller.on_scheduled_run(job).await })
        };
        // Let the first fire claim the running slot before the second lands.
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.controller.on_scheduled_run(job.clone()).await;
        first.await.unwrap();

        let runs = h.store.runs().list_for_job("slow", 10).unwrap();
        assert_eq!(runs.len(), 1, "overlapping fire must be skipped");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simultaneous_fires_of_skip_job_admit_exactly_one() {
        let h = harness(8);
        let job = script_job(&h, "racy", "sleep 1", OverlapPolicy::Skip);

        // Both fires are spawned before either is awaited, so their
        // contains-check and insert genuinely race across worker threads.
        let fires: Vec<_> = (0..2)
            .map(|_| {
                let controller = h.controller.clone();
                let job = job.clone();
                tokio::spawn(async move { controller.on_scheduled_run(job).await })
            })
            .collect();
        for fire in fires {
            fire.await.unwrap();
        }

        let runs = h.store.runs().list_for_job("racy", 10).unwrap();
        assert_eq!(runs.len(), 1, "racing fires must admit exactly one run");
    }

    #[tokio::test]
    async fn overlap_allow_runs_concurrently() {
        let h = harness(4);
        let job = script_job(&h, "par", "sleep 1", OverlapPolicy::Allow);

        let first = {
            let controller = h.controller.clone();
            let job = job.clone();
            tokio::spawn(async move { controller.on_scheduled_run(job).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.controller.on_scheduled_run(job.clone()).await;
        first.await.unwrap();

        let runs = h.store.runs().list_for_job("par", 10).unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn concurrency_cap_surfaces_backpressure_on_manual_trigger() {
        let h = harness(1);
        script_job(&h, "holder", "sleep 2", OverlapPolicy::Skip);
        script_job(&h, "waiter", "echo hi", OverlapPolicy::Skip);

        let holder = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.trigger_job("holder").await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.controller.running_count(), 1);

        let err = h.controller.trigger_job("waiter").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Backpressure { .. }));

        holder.await.unwrap().unwrap();
        // The rejected trigger never opened a run record.
        assert!(h.store.runs().list_for_job("waiter", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn notification_failures_do_not_change_run_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("runner.sqlite");
        let store = Store::open(db_path.to_str().unwrap()).unwrap();
        let controller = RunController::new(
            store.clone(),
            Arc::new(BrokenNotifier),
            Arc::new(UnreachableGateway),
            SchedulerConfig {
                db_path: db_path.to_str().unwrap().to_string(),
                max_concurrency: 4,
                shutdown_grace_ms: 1_000,
                reconcile_interval_ms: 0,
                default_on_failure: None,
                default_on_success: Some("C-ok".to_string()),
            },
        );

        let script = dir.path().join("ok.sh");
        std::fs::write(&script, "#!/bin/sh\necho fine\n").unwrap();
        store
            .jobs()
            .insert(&NewJob {
                id: "ok".into(),
                name: "ok".into(),
                schedule: "* * * * * *".into(),
                script: script.to_str().unwrap().into(),
                job_type: JobType::Script,
                description: None,
                enabled: true,
                timeout_ms: None,
                overlap_policy: OverlapPolicy::Skip,
                on_failure: None,
                on_success: None,
            })
            .unwrap();

        let result = controller.trigger_job("ok").await.unwrap();
        assert_eq!(result.status, RunStatus::Ok);
        let runs = store.runs().list_for_job("ok", 1).unwrap();
        assert_eq!(runs[0].status, RunStatus::Ok);
    }

    #[tokio::test]
    async fn session_job_routes_to_the_gateway() {
        let h = harness(4);
        h.store
            .jobs()
            .insert(&NewJob {
                id: "sess".into(),
                name: "sess".into(),
                schedule: "* * * * * *".into(),
                script: "Summarize the runs".into(),
                job_type: JobType::Session,
                description: None,
                enabled: true,
                timeout_ms: Some(5_000),
                overlap_policy: OverlapPolicy::Skip,
                on_failure: None,
                on_success: None,
            })
            .unwrap();

        // The offline gateway turns the run into a terminal error record.
        let result = h.controller.trigger_job("sess").await.unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.error.as_deref().unwrap().contains("gateway offline"));

        let runs = h.store.runs().list_for_job("sess", 1).unwrap();
        assert_eq!(runs[0].status, RunStatus::Error);
    }

    #[tokio::test]
    async fn scheduled_fire_produces_a_run() {
        let h = harness(4);
        script_job(&h, "ticker", "echo tick", OverlapPolicy::Skip);

        let summary = h.controller.start().await.unwrap();
        assert_eq!(summary.total_enabled, 1);
        assert!(summary.failed_ids.is_empty());

        // The every-second schedule must land a completed run shortly.
        let mut runs = Vec::new();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            runs = h.store.runs().list_for_job("ticker", 10).unwrap();
            if runs.iter().any(|r| r.status == RunStatus::Ok) {
                break;
            }
        }
        let run = runs
            .iter()
            .find(|r| r.status == RunStatus::Ok)
            .expect("no scheduled run completed within 4s");
        assert_eq!(run.trigger, Trigger::Schedule);
        assert!(run.stdout_tail.as_deref().unwrap().contains("tick"));

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_runs() {
        let h = harness(4);
        script_job(&h, "tail", "sleep 1", OverlapPolicy::Skip);

        let running = {
            let controller = h.controller.clone();
            tokio::spawn(async move { controller.trigger_job("tail").await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.controller.running_count(), 1);

        h.controller.stop().await;
        assert_eq!(h.controller.running_count(), 0);
        running.await.unwrap().unwrap();
    }
}
