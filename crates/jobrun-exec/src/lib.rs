//! `jobrun-exec` — the two execution pipelines behind a run.
//!
//! Script jobs spawn a child process resolved from the script's file
//! extension, with the runner's identity injected through environment
//! variables and stdout/stderr captured into bounded tails. Session jobs
//! delegate to a remote agent gateway through the [`gateway::GatewayClient`]
//! trait and poll for completion with capped exponential backoff.
//!
//! Executors never touch the database: both variants reduce to an
//! [`jobrun_core::ExecutionResult`] that the run controller persists.

pub mod error;
pub mod gateway;
pub mod script;
pub mod session;
pub mod tail;

pub use error::{ExecError, Result};
pub use gateway::{GatewayClient, HttpGatewayClient, SessionInfo, SpawnOptions, SpawnedSession};
pub use script::{resolve_command, run_script, ScriptRequest};
pub use session::{resolve_prompt, run_session, SessionRequest};
