use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobrun_core::now_ms;
use jobrun_store::{Store, DEFAULT_RETENTION_DAYS};
use tokio::sync::watch;
use tracing::{info, warn};

const MS_PER_DAY: i64 = 86_400_000;

/// Periodic retention controller.
///
/// Three sweeps run immediately on `start` and then on every interval:
/// old runs, expired state rows, and finished queue items past their
/// per-queue retention. Sweep failures are logged and retried on the next
/// tick; they never take the runner down.
pub struct Maintenance {
    store: Store,
    run_retention_days: i64,
    interval_ms: u64,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl Maintenance {
    pub fn new(store: Store, run_retention_days: i64, interval_ms: u64) -> Self {
        Self {
            store,
            run_retention_days,
            interval_ms,
            stop: Mutex::new(None),
        }
    }

    /// Run all three sweeps once.
    pub fn run_now(&self) {
        let now = now_ms();

        match self
            .store
            .runs()
            .delete_started_before(now - self.run_retention_days * MS_PER_DAY)
        {
            Ok(deleted) if deleted > 0 => info!(deleted, "pruned old runs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "run retention sweep failed"),
        }

        match self.store.state().delete_expired(now) {
            Ok(deleted) if deleted > 0 => info!(deleted, "pruned expired state rows"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "state expiry sweep failed"),
        }

        match self.store.queue().delete_finished(now, DEFAULT_RETENTION_DAYS) {
            Ok(deleted) if deleted > 0 => info!(deleted, "pruned finished queue items"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "queue retention sweep failed"),
        }
    }

    /// Spawn the periodic loop. The first sweep happens right away.
    pub fn start(self: &Arc<Self>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop.lock().unwrap() = Some(stop_tx);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(this.interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => this.run_now(),
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        info!(interval_ms = self.interval_ms, "maintenance started");
    }

    pub fn stop(&self) {
        if let Some(stop) = self.stop.lock().unwrap().take() {
            let _ = stop.send(true);
        }
    }
}
