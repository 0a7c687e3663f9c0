//! Engine error types
//!
//! The taxonomy follows the recovery policy, not the failure site:
//! client protocol errors and timeouts are returned to the caller, hardware
//! errors and admission failures are recovered inside the thread loop, and
//! invariant violations abort (they are modeling bugs, not runtime
//! conditions - those are `panic!`s, never variants here).

use thiserror::Error;

/// Errors surfaced by engine operations
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Bad arguments to a track-creation or config call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No fast-track slot left while a fast track is mandatory
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// A blocking config-event wait exceeded its deadline
    #[error("config event timed out")]
    Timeout,

    /// Hardware stream I/O failure (forces standby, never kills the loop)
    #[error("hardware stream error: {0}")]
    Hardware(String),

    /// Operation is not supported by this thread role or stream capability
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The owning thread is exiting or already gone
    #[error("thread is dead")]
    Dead,

    /// The track is not in a state that permits the operation
    #[error("invalid state for operation: {0}")]
    InvalidState(&'static str),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
