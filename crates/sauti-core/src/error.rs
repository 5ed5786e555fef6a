//! Error types for the dispatch engine.
//!
//! The taxonomy follows the caller-visible contract: caller errors are never
//! retried, saturation and worker faults are retried by the dispatcher only,
//! deadline errors are always terminal.

use crate::envelope::Capability;
use crate::worker::WorkerId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes surfaced by the engine.
///
/// Every terminal error is typed; callers can always distinguish "try again
/// later" from "this request is broken" from "this capability doesn't exist".
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No pool is registered for the requested capability. Never retried.
    #[error("no pool registered for capability '{0}'")]
    UnknownCapability(Capability),

    /// The worker rejected the payload as malformed. Never retried.
    #[error("payload rejected by worker: {0}")]
    InvalidPayload(String),

    /// The pool's pending queue is at `max_queue_depth`. Backpressure signal,
    /// retried by the dispatcher with backoff.
    #[error("queue for '{capability}' is full ({depth} pending)")]
    QueueFull { capability: Capability, depth: usize },

    /// The caller's time budget ran out before a result was produced.
    /// Always terminal.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The pool has not yet seen its first worker become ready. Retried by
    /// the dispatcher with a longer backoff than mid-traffic faults.
    #[error("pool for '{0}' is still warming up")]
    PoolWarmingUp(Capability),

    /// Retry attempts exhausted. Carries the last underlying cause.
    #[error("service unavailable after {attempts} attempt(s): {last}")]
    ServiceUnavailable { attempts: u32, last: Box<Error> },

    /// No response frame arrived within the task's execution timeout.
    #[error("worker {worker} timed out after {timeout_ms}ms")]
    WorkerTimeout { worker: WorkerId, timeout_ms: u64 },

    /// The worker process exited while a task was in flight.
    #[error("worker {worker} crashed: {detail}")]
    WorkerCrashed { worker: WorkerId, detail: String },

    /// The worker reported an internal failure executing the task. The
    /// process stays up; the task is recoverable on another worker.
    #[error("worker {worker} failed the task: {detail}")]
    WorkerError { worker: WorkerId, detail: String },

    /// The worker broke the one-request-one-response contract (unknown or
    /// duplicate correlation id). The worker is replaced.
    #[error("worker {worker} violated the framing protocol: {detail}")]
    ProtocolViolation { worker: WorkerId, detail: String },

    /// The worker process exited or stayed silent past the startup timeout.
    #[error("worker failed to start: {0}")]
    StartupError(String),

    /// The worker process could not be spawned at all.
    #[error("failed to spawn worker process: {0}")]
    SpawnError(String),

    /// The engine is shutting down and no longer accepts work.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Malformed frame or transport failure on a worker channel.
    #[error("wire protocol error: {0}")]
    WireError(String),

    /// Invalid engine or pool configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Whether the dispatcher may retry this failure on a fresh attempt.
    ///
    /// Saturation errors and worker faults are recoverable; caller errors
    /// and deadline errors are not. `ServiceUnavailable` is itself terminal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::QueueFull { .. }
                | Error::PoolWarmingUp(_)
                | Error::WorkerTimeout { .. }
                | Error::WorkerCrashed { .. }
                | Error::WorkerError { .. }
                | Error::ProtocolViolation { .. }
        )
    }

    /// Whether this failure means the pool has not finished warming up.
    /// The dispatcher applies a longer backoff to this condition.
    pub fn is_warming_up(&self) -> bool {
        matches!(self, Error::PoolWarmingUp(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::WireError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let queue_full = Error::QueueFull {
            capability: Capability::Synthesis,
            depth: 8,
        };
        assert!(queue_full.is_recoverable());
        assert!(Error::PoolWarmingUp(Capability::Chat).is_recoverable());
        assert!(!Error::DeadlineExceeded.is_recoverable());
        assert!(!Error::InvalidPayload("bad".into()).is_recoverable());
        assert!(!Error::UnknownCapability(Capability::Transcription).is_recoverable());
    }

    #[test]
    fn test_exhaustion_is_terminal() {
        let terminal = Error::ServiceUnavailable {
            attempts: 3,
            last: Box::new(Error::WorkerCrashed {
                worker: "synthesis-1".into(),
                detail: "exit status 1".into(),
            }),
        };
        assert!(!terminal.is_recoverable());
    }

    #[test]
    fn test_warming_up_is_distinct() {
        assert!(Error::PoolWarmingUp(Capability::Synthesis).is_warming_up());
        let crashed = Error::WorkerCrashed {
            worker: "chat-2".into(),
            detail: "eof".into(),
        };
        assert!(!crashed.is_warming_up());
    }
}
