use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use jobrun_core::Job;
use jobrun_store::Store;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::schedule::{next_fire, parse_schedule};

/// One live registration: the schedule token it was built from plus the
/// stop signal for its timer task.
struct Registration {
    token: String,
    stop: watch::Sender<bool>,
}

/// Outcome of a [`CronRegistry::reconcile`] sweep.
#[derive(Debug, Clone)]
pub struct ReconcileSummary {
    pub total_enabled: usize,
    pub failed_ids: Vec<String>,
}

/// In-memory cron registry, reconciled against the `jobs` table.
///
/// Every enabled job gets a timer task that sleeps until the next cron
/// occurrence and then forwards the job over the fire channel. The task
/// holds no job state beyond the id: the row is re-read at fire time, so
/// edits and disables in the store win over anything captured at
/// registration.
pub struct CronRegistry {
    store: Store,
    fired_tx: mpsc::Sender<Job>,
    registered: Mutex<HashMap<String, Registration>>,
    failed: Mutex<HashSet<String>>,
}

impl CronRegistry {
    pub fn new(store: Store, fired_tx: mpsc::Sender<Job>) -> Self {
        Self {
            store,
            fired_tx,
            registered: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        }
    }

    /// Align the registry with the store: drop registrations for jobs that
    /// vanished or were disabled, (re-)register new jobs and jobs whose
    /// schedule token changed.
    ///
    /// A job with an unparseable schedule is recorded in the failed set and
    /// never aborts the sweep.
    pub fn reconcile(&self) -> Result<ReconcileSummary> {
        let jobs = self.store.jobs().list_enabled()?;
        let live: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();

        let mut registered = self.registered.lock().unwrap();
        let mut failed = self.failed.lock().unwrap();

        let stale: Vec<String> = registered
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(reg) = registered.remove(&id) {
                let _ = reg.stop.send(true);
                info!(job_id = %id, "schedule unregistered");
            }
        }
        failed.retain(|id| live.contains(id.as_str()));

        for job in &jobs {
            match registered.get(&job.id) {
                Some(reg) if reg.token == job.schedule => continue,
                Some(_) => {
                    // Token changed under us — restart the timer task.
                    if let Some(reg) = registered.remove(&job.id) {
                        let _ = reg.stop.send(true);
                    }
                    info!(job_id = %job.id, schedule = %job.schedule, "schedule changed, re-registering");
                }
                None => {}
            }

            match self.register(job) {
                Ok(reg) => {
                    registered.insert(job.id.clone(), reg);
                    failed.remove(&job.id);
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "schedule registration failed");
                    failed.insert(job.id.clone());
                }
            }
        }

        let mut failed_ids: Vec<String> = failed.iter().cloned().collect();
        failed_ids.sort();
        Ok(ReconcileSummary {
            total_enabled: jobs.len(),
            failed_ids,
        })
    }

    /// Stop every timer task and forget all registrations.
    pub fn stop_all(&self) {
        let mut registered = self.registered.lock().unwrap();
        for (id, reg) in registered.drain() {
            let _ = reg.stop.send(true);
            debug!(job_id = %id, "schedule stopped");
        }
    }

    /// Job ids whose last registration attempt failed schedule parsing.
    pub fn failed_registrations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.failed.lock().unwrap().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of jobs with a live timer task.
    pub fn registered_count(&self) -> usize {
        self.registered.lock().unwrap().len()
    }

    fn register(&self, job: &Job) -> Result<Registration> {
        let schedule = parse_schedule(&job.schedule)?;
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let store = self.store.clone();
        let fired_tx = self.fired_tx.clone();
        let job_id = job.id.clone();

        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = next_fire(&schedule, now) else {
                    info!(job_id = %job_id, "schedule exhausted");
                    break;
                };
                let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                // Re-read the row so live edits take effect and a disable
                // between registration and fire is honored.
                match store.jobs().get_enabled(&job_id) {
                    Ok(Some(job)) => {
                        if fired_tx.send(job).await.is_err() {
                            debug!(job_id = %job_id, "fire channel closed, stopping timer");
                            break;
                        }
                    }
                    Ok(None) => {
                        info!(job_id = %job_id, "job missing or disabled at fire time, skipping");
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "failed to reload job at fire time");
                    }
                }
            }
        });

        info!(job_id = %job.id, schedule = %job.schedule, "schedule registered");
        Ok(Registration {
            token: job.schedule.clone(),
            stop: stop_tx,
        })
    }
}
