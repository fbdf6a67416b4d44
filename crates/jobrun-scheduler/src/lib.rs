//! `jobrun-scheduler` — cron registry, run controller, and maintenance.
//!
//! The [`registry::CronRegistry`] keeps one timer task per enabled job and
//! reconciles that in-memory picture against the store. Fires are handed to
//! the [`controller::RunController`] over a channel; the controller applies
//! the concurrency cap and overlap policy, opens/closes run records, picks
//! the executor for the job type, and dispatches notifications. The
//! [`maintenance::Maintenance`] task periodically prunes old runs, expired
//! state, and finished queue items.

pub mod controller;
pub mod error;
pub mod maintenance;
pub mod registry;
pub mod schedule;

pub use controller::{RunController, SchedulerConfig};
pub use error::{Result, SchedulerError};
pub use maintenance::Maintenance;
pub use registry::{CronRegistry, ReconcileSummary};
pub use schedule::parse_schedule;
