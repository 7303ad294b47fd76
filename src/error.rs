//! error kinds the engine distinguishes, and their process exit codes.

use crate::types::states::JobState;

/// Errors surfaced by the queue engine.
///
/// Job-level failures (non-zero exits, timeouts, spawn errors) are not
/// errors at this level: they are [`Outcome`](crate::types::outcome::Outcome)
/// values recovered by the retry policy. This enum covers everything the
/// admin surface and the engine itself can report to a caller.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The enqueue spec is malformed: missing/blank id or command,
    /// non-positive timeout, or an unparseable timestamp.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    /// A job with this id already exists.
    #[error("job already exists: {0}")]
    Duplicate(String),

    /// The targeted job does not exist.
    #[error("no such job: {0}")]
    NotFound(String),

    /// The targeted job is not in the state the operation requires.
    #[error("job {id} is {actual}, expected {expected}")]
    StateMismatch {
        id: String,
        expected: JobState,
        actual: JobState,
    },

    /// The store's write lock could not be taken within the wait budget.
    /// Transient; callers may retry.
    #[error("store is busy")]
    Busy,

    /// An unknown configuration key was supplied.
    #[error("unknown config key: {0} (recognized: max_retries, backoff_base)")]
    UnknownConfigKey(String),

    /// A supervised fleet is already running under the given parent PID.
    #[error("a worker fleet is already running (parent pid {0})")]
    AlreadyRunning(u32),

    /// `stop` was requested but no liveness file exists.
    #[error("no worker fleet is running")]
    NoFleet,

    /// The store failed in a way that is not lock contention.
    #[error("store error: {0}")]
    Storage(rusqlite::Error),

    /// Filesystem-level failure (liveness file, log sinks).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy)
            | Some(rusqlite::ErrorCode::DatabaseLocked) => QueueError::Busy,
            _ => QueueError::Storage(e),
        }
    }
}

impl QueueError {
    /// Process exit code for the admin surface: 1 for input errors, 2 for
    /// runtime errors, 3 for state violations.
    pub fn exit_code(&self) -> u8 {
        use QueueError::*;

        match self {
            InvalidSpec(_) | Duplicate(_) | UnknownConfigKey(_) => 1,
            Busy | Storage(_) | Io(_) => 2,
            NotFound(_) | StateMismatch { .. } | AlreadyRunning(_)
            | NoFleet => 3,
        }
    }
}
