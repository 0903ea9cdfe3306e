//! Typed error taxonomy for the engine (see spec §7).
//!
//! Every public method on [`crate::scheduler::Scheduler`] and the
//! repositories returns [`Result<T>`] with this error type. Validation and
//! ownership errors never mutate state; transport errors are safe to retry
//! at the caller's layer.

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input: bad command, invalid priority, invalid URL, empty
    /// commands list, invalid ttl, oversized payload, etc.
    #[error("validation failed for field `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },

    /// Task, result, or subscription id unknown.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Ownership check failed on a mutating worker-side operation.
    #[error("task {task_id} is not owned by worker `{worker_id}`")]
    NotOwner { task_id: Uuid, worker_id: String },

    /// Attempt to re-terminate, heartbeat, or nack a terminal task.
    #[error("task {task_id} is already in terminal status `{status}`")]
    AlreadyTerminal { task_id: Uuid, status: &'static str },

    /// A genuine conflict surfaced for observability (idempotency
    /// collisions are NOT errors — see `TaskRepository::enqueue`).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store I/O failure. Propagated unchanged; safe to retry.
    #[error("store transport error: {0}")]
    Transport(#[from] redis::RedisError),

    /// Cancellation token fired before the operation completed.
    #[error("operation canceled")]
    Canceled,

    /// Startup check detected a legacy LIST-shaped `inprog`/`dlq` layout.
    #[error("incompatible store layout: {0}")]
    IncompatibleLayout(String),

    /// Catch-all for store-backend-internal invariant violations that are
    /// not cleanly one of the above (e.g. a corrupted task record that
    /// fails to deserialize).
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
