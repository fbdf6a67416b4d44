//! `jobrun-core` — shared types, configuration, and error taxonomy.
//!
//! Everything here is plain data: the job/run model used across the
//! workspace, the runner configuration document, and the core error type.
//! Subsystems with real machinery (store, executors, scheduler, server)
//! live in their own crates and depend on this one.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{CoreError, Result};
pub use types::{
    now_ms, ExecutionResult, Job, JobType, OverlapPolicy, Run, RunStatus, Trigger,
};
