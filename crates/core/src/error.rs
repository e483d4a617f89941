use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Errors raised by the job queue's state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("duplicate job id: {0}")]
    DuplicateJob(JobId),

    #[error("unknown job id: {0}")]
    UnknownJob(JobId),

    #[error("job {0} is not in a terminal state")]
    NotTerminal(JobId),

    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

impl QueueError {
    /// A transition rejected because the job was already cancelled. This is the
    /// expected outcome when a cancel races dispatch or completion.
    pub fn is_cancel_race(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidTransition {
                from: JobStatus::Cancelled,
                ..
            }
        )
    }
}

/// Failure running the external processing pipeline for one job.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("failed to launch pipeline: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("pipeline exited with {exit_code:?}: {diagnostics}")]
    Pipeline {
        exit_code: Option<i32>,
        diagnostics: String,
    },

    #[error("job panicked: {0}")]
    Panicked(String),
}

/// Failure of the optional quality-scoring collaborator. Never fatal to a job.
#[derive(Error, Debug)]
#[error("scoring {artifact} failed: {reason}")]
pub struct ScoringError {
    pub artifact: String,
    pub reason: String,
}

/// Failure reading host metrics.
#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("resource sampling unsupported on this platform")]
    Unsupported,

    #[error("failed to read {source_name}: {error}")]
    Read {
        source_name: String,
        error: std::io::Error,
    },

    #[error("failed to parse {0}")]
    Parse(String),

    #[error("sampling timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Failure persisting or reading back reports and event logs.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("report serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Configuration loading/validation failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Scheduler lifecycle errors.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler not started")]
    NotStarted,

    #[error("scheduler stopped before every job settled")]
    Stopped,

    /// A status transition failed in a way that means the one-worker-per-job
    /// invariant may have been violated.
    #[error("scheduler integrity fault: {0}")]
    Integrity(QueueError),

    #[error("dispatch loop terminated abnormally: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_race_detection() {
        let race = QueueError::InvalidTransition {
            job_id: "a".into(),
            from: JobStatus::Cancelled,
            to: JobStatus::Queued,
        };
        assert!(race.is_cancel_race());

        let fault = QueueError::InvalidTransition {
            job_id: "a".into(),
            from: JobStatus::Completed,
            to: JobStatus::Error,
        };
        assert!(!fault.is_cancel_race());
        assert!(!QueueError::UnknownJob("a".into()).is_cancel_race());
    }

    #[test]
    fn transition_error_message() {
        let err = QueueError::InvalidTransition {
            job_id: "job-7".into(),
            from: JobStatus::Pending,
            to: JobStatus::Completed,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for job job-7: pending -> completed"
        );
    }
}
