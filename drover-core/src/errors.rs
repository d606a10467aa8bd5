//! Error taxonomy for the orchestrator.
//!
//! External collaborators fail in free-form ways (subprocess stderr, provider
//! messages), so classification works on message text. The worker retry loop
//! and the router both match on [`ErrorKind`]; typed failures that originate
//! inside this crate are raised as [`OrchestratorError`] so callers can
//! downcast instead of string-matching.

use std::fmt;

use thiserror::Error;

/// Failure classes with distinct recovery policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network errors, rate limits, transient subprocess failures. Retried
    /// at the worker with exponential backoff; surfaced to the planner only
    /// after five consecutive failures.
    TransientExternal,
    /// Authentication, permissions, missing files, tool-level compile or
    /// syntax errors. Never retried; the worker clears the task.
    PermanentExternal,
    /// The requested action is not permitted in the current state. Surfaced
    /// to the caller; not retried within the call.
    LogicalConflict,
    /// No worker available below the pool maximum. The planner retries on
    /// the next cycle.
    ResourceExhaustion,
    /// Unparseable state file or a record pointing at a missing directory.
    /// Self-heals by discarding the stale record.
    CorruptState,
    /// A git lock was held beyond its deadline.
    LockTimeout,
}

impl ErrorKind {
    /// Whether the worker should retry after a failure of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientExternal | Self::ResourceExhaustion)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransientExternal => "transient-external",
            Self::PermanentExternal => "permanent-external",
            Self::LogicalConflict => "logical-conflict",
            Self::ResourceExhaustion => "resource-exhaustion",
            Self::CorruptState => "corrupt-state",
            Self::LockTimeout => "lock-timeout",
        };
        f.write_str(s)
    }
}

const PERMANENT_MARKERS: &[&str] = &[
    "permission denied",
    "authentication failed",
    "invalid credentials",
    "file not found",
    "no such file or directory",
    "compilation failed",
    "syntax error",
    "command not found",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timeout",
    "timed out",
    "service unavailable",
    "internal server error",
    "rate limit",
    "temporarily unavailable",
    "network",
    "could not resolve host",
];

/// Classify a failure message into an [`ErrorKind`].
///
/// Permanent markers win over transient ones ("authentication failed due to
/// network policy" must not be retried forever). Unrecognized messages are
/// treated as transient so the worker's bounded retry/quarantine path decides,
/// rather than dropping the task on first contact.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("lock timeout") || lower.contains("lock held beyond") {
        return ErrorKind::LockTimeout;
    }
    for marker in PERMANENT_MARKERS {
        if lower.contains(marker) {
            return ErrorKind::PermanentExternal;
        }
    }
    for marker in TRANSIENT_MARKERS {
        if lower.contains(marker) {
            return ErrorKind::TransientExternal;
        }
    }
    ErrorKind::TransientExternal
}

/// Classify an error chain, preferring a typed [`OrchestratorError`] if one
/// is present anywhere in the chain.
pub fn classify_error(err: &anyhow::Error) -> ErrorKind {
    for cause in err.chain() {
        if let Some(typed) = cause.downcast_ref::<OrchestratorError>() {
            return typed.kind();
        }
    }
    classify_message(&format!("{err:#}"))
}

/// Typed failures raised by the orchestration engine itself.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("state store busy: could not acquire {0}")]
    ResourceBusy(String),

    #[error("git lock timeout: {repository} held beyond {seconds}s during {operation}")]
    LockTimeout {
        repository: String,
        operation: String,
        seconds: u64,
    },

    #[error("invalid worker transition: {action} not permitted from {status}")]
    InvalidTransition { status: String, action: String },

    #[error("no worker available for task {0}")]
    NoWorkerAvailable(String),

    #[error("task {0} has no workspace to resume from")]
    NoWorkspaceToResume(String),

    #[error("corrupt state: {0}")]
    CorruptState(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceBusy(_) => ErrorKind::TransientExternal,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::InvalidTransition { .. } => ErrorKind::LogicalConflict,
            Self::NoWorkerAvailable(_) => ErrorKind::ResourceExhaustion,
            Self::NoWorkspaceToResume(_) => ErrorKind::LogicalConflict,
            Self::CorruptState(_) => ErrorKind::CorruptState,
        }
    }
}
