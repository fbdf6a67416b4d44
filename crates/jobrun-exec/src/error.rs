use thiserror::Error;

/// Errors raised by the execution pipelines.
///
/// Failures *inside* a run (non-zero exit, gateway fault, timeout) are not
/// errors at this level — they become a terminal
/// [`jobrun_core::ExecutionResult`]. This type covers misconfiguration and
/// transport faults surfaced to callers directly.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The job's script value is not usable for its job type.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session gateway rejected or failed a call.
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecError>;
