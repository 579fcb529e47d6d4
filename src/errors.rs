//! Typed error hierarchy for coderun.
//!
//! One enum per subsystem:
//! - `RunError`: run state machine and phase execution failures
//! - `ServiceError`: reasoning service failures, categorized for users
//! - `DiffError`: diff parsing and path policy failures
//! - `CheckpointError`: git checkpoint failures
//! - `QueueError`: job queue failures

use std::path::PathBuf;

use thiserror::Error;

use crate::runs::models::RunStatus;

/// Errors from the run state machine and the phase executors.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Repo {id} not found")]
    RepoNotFound { id: i64 },

    /// A phase guard was violated. Nothing was mutated.
    #[error("Run {run_id} is {status}: {message}")]
    Conflict {
        run_id: i64,
        status: RunStatus,
        message: String,
    },

    /// The repo policy forbids the operation (read-only or maintenance-locked).
    #[error("Repo {repo_id} rejects writes: {reason}")]
    RepoPolicy { repo_id: i64, reason: String },

    /// Another apply or rollback holds the repo lock.
    #[error("Repo {repo_id} is busy with another apply or rollback")]
    RepoBusy { repo_id: i64 },

    #[error(transparent)]
    Reasoning(#[from] ServiceError),

    #[error("Checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Apply failed for run {run_id}: {message}")]
    ApplyFailed { run_id: i64, message: String },

    /// Restoring the pre-apply checkpoint failed. The repository needs a human.
    #[error("Rollback failed for run {run_id}, repository may be inconsistent: {message}")]
    RollbackFailed { run_id: i64, message: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunError {
    pub fn conflict(run_id: i64, status: RunStatus, message: impl Into<String>) -> Self {
        Self::Conflict {
            run_id,
            status,
            message: message.into(),
        }
    }

    /// Whether a queued job that hit this error should be retried with backoff.
    ///
    /// Only errors raised before the run was touched qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RepoBusy { .. } | Self::Database(_))
    }

    /// Precondition violations: the request was rejected without side effects.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::RepoPolicy { .. } | Self::RepoBusy { .. }
        )
    }
}

/// Failure category of a reasoning service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    Offline,
    Timeout,
    Auth,
    InvalidResponse,
    Other,
}

/// Error returned by a `ReasoningService` call.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn offline(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Offline, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Timeout, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Auth, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::InvalidResponse, message)
    }

    /// Message suitable for showing to the person who requested the run.
    pub fn user_message(&self) -> String {
        match self.kind {
            ServiceErrorKind::Offline => {
                format!("Reasoning service is offline or unreachable: {}", self.message)
            }
            ServiceErrorKind::Timeout => {
                format!("Reasoning service timed out: {}", self.message)
            }
            ServiceErrorKind::Auth => format!(
                "Reasoning service rejected the credentials, check the API key or login: {}",
                self.message
            ),
            ServiceErrorKind::InvalidResponse => {
                format!("Reasoning service returned an unusable response: {}", self.message)
            }
            ServiceErrorKind::Other => format!("Reasoning service failed: {}", self.message),
        }
    }
}

/// Errors from diff parsing and application.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("Malformed diff at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Path '{path}' rejected: {reason}")]
    PathRejected { path: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from git checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Job {id} has an invalid payload: {message}")]
    InvalidPayload { id: i64, message: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_conflict_carries_status() {
        let err = RunError::conflict(7, RunStatus::Ready, "plan requires pending");
        match &err {
            RunError::Conflict { run_id, status, .. } => {
                assert_eq!(*run_id, 7);
                assert_eq!(*status, RunStatus::Ready);
            }
            _ => panic!("Expected Conflict"),
        }
        assert!(err.to_string().contains("ready"));
        assert!(err.is_precondition());
        assert!(!err.is_retryable());
    }

    #[test]
    fn repo_busy_is_retryable() {
        let err = RunError::RepoBusy { repo_id: 3 };
        assert!(err.is_retryable());
        assert!(err.is_precondition());
    }

    #[test]
    fn reasoning_errors_are_not_retryable() {
        let err: RunError = ServiceError::timeout("60s elapsed").into();
        assert!(!err.is_retryable());
        assert!(!err.is_precondition());
    }

    #[test]
    fn rollback_failed_is_distinct_from_apply_failed() {
        let apply = RunError::ApplyFailed {
            run_id: 1,
            message: "hunk mismatch".into(),
        };
        let rollback = RunError::RollbackFailed {
            run_id: 1,
            message: "reset failed".into(),
        };
        assert!(matches!(apply, RunError::ApplyFailed { .. }));
        assert!(!matches!(rollback, RunError::ApplyFailed { .. }));
        assert!(rollback.to_string().contains("inconsistent"));
    }

    #[test]
    fn service_error_user_messages_are_categorized() {
        assert!(ServiceError::offline("connection refused")
            .user_message()
            .contains("offline"));
        assert!(ServiceError::timeout("120s").user_message().contains("timed out"));
        assert!(ServiceError::auth("401").user_message().contains("credentials"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&RunError::RunNotFound { id: 1 });
        assert_std_error(&ServiceError::offline("x"));
        assert_std_error(&DiffError::Parse {
            line: 1,
            message: "x".into(),
        });
        assert_std_error(&QueueError::JobNotFound { id: 1 });
    }
}
