use sable_host::{EvalError, HostError};
use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Error, Debug)]
pub enum DebugError {
    /// Malformed or unsupported single request. The session is unaffected.
    #[error("invalid request: {0}")]
    Protocol(String),
    #[error("a breakpoint already exists at this location")]
    DuplicateBreakpoint,
    #[error("breakpoint condition did not compile: {0}")]
    InvalidCondition(String),
    #[error("invalid data watch target: {0}")]
    InvalidTarget(String),
    /// Expired handle, frame id, or variables reference. Treated as
    /// not-found; the client must re-fetch.
    #[error("stale reference {0}")]
    StaleReference(i64),
    #[error("evaluation failed: {0}")]
    Evaluation(#[from] EvalError),
    #[error("host: {0}")]
    Host(#[from] HostError),
    /// Only this variant tears the whole session down.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}
