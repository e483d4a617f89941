use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique job identifier within a queue.
pub type JobId = String;

/// Opaque options handed to the external pipeline. Never interpreted by the scheduler.
pub type JobOptions = BTreeMap<String, String>;

/// Job priority. Higher variant = dispatched first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Lifecycle state of a job.
///
/// `Pending -> Queued -> Processing -> {Completed | Error | Cancelled}`.
/// `Pending` and `Queued` may also go straight to `Cancelled`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Error,
        JobStatus::Cancelled,
    ];

    /// Terminal statuses admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Error)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown job status '{s}'"))
    }
}

/// Immutable description of one unit of media-processing work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: JobId,
    pub display_name: String,
    pub source_location: String,
    pub output_location: String,
    #[serde(default)]
    pub priority: Priority,
    /// Tenant grouping key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub options: JobOptions,
    pub submitted_at: DateTime<Utc>,
}

impl JobSpec {
    /// Create a spec with normal priority, no deadline, and `submitted_at = now`.
    pub fn new(
        job_id: impl Into<JobId>,
        source_location: impl Into<String>,
        output_location: impl Into<String>,
    ) -> Self {
        let job_id = job_id.into();
        Self {
            display_name: job_id.clone(),
            job_id,
            source_location: source_location.into(),
            output_location: output_location.into(),
            priority: Priority::Normal,
            owner_id: None,
            deadline: None,
            options: JobOptions::new(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Override the submission timestamp (replay and tests).
    pub fn submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_at = at;
        self
    }
}

/// Mutable outcome record for a job, owned by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub elapsed_seconds: f64,
    #[serde(default)]
    pub output_artifacts: Vec<String>,
    /// Set only when `status` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_scores: Option<BTreeMap<String, f64>>,
}

impl JobResult {
    /// Fresh result for a newly submitted job.
    pub fn pending(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            started_at: None,
            ended_at: None,
            elapsed_seconds: 0.0,
            output_artifacts: Vec::new(),
            error_message: None,
            quality_scores: None,
        }
    }

    /// Terminal error result spanning `started_at..now`.
    pub fn failed(
        job_id: impl Into<JobId>,
        started_at: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        let mut result = Self::pending(job_id);
        result.status = JobStatus::Error;
        result.error_message = Some(message.into());
        result.finish(started_at, Utc::now());
        result
    }

    /// Stamp start/end times and derive `elapsed_seconds`.
    pub fn finish(&mut self, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) {
        self.started_at = Some(started_at);
        self.ended_at = Some(ended_at);
        self.elapsed_seconds =
            (ended_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Urgent);
    }

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!("URGENT".parse::<Priority>(), Ok(Priority::Urgent));
        assert_eq!("low".parse::<Priority>(), Ok(Priority::Low));
        assert!("critical".parse::<Priority>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn state_machine_edges() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Error));
        assert!(Pending.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Processing));
        assert!(!Queued.can_transition_to(Completed));
        for terminal in [Completed, Error, Cancelled] {
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn status_parse_matches_display() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>(), Ok(status));
        }
    }

    #[test]
    fn spec_builder_defaults() {
        let spec = JobSpec::new("job-1", "in/project", "out/job-1");
        assert_eq!(spec.display_name, "job-1");
        assert_eq!(spec.priority, Priority::Normal);
        assert!(spec.deadline.is_none());
        assert!(spec.options.is_empty());

        let spec = spec
            .with_priority(Priority::High)
            .with_owner("tenant-a")
            .with_option("resolution", "1080p");
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.owner_id.as_deref(), Some("tenant-a"));
        assert_eq!(spec.options["resolution"], "1080p");
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let json = r#"{
            "job_id": "a",
            "display_name": "A",
            "source_location": "src",
            "output_location": "out",
            "submitted_at": "2025-01-01T00:00:00Z"
        }"#;
        let spec: JobSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.priority, Priority::Normal);
        assert!(spec.owner_id.is_none());
    }

    #[test]
    fn finish_computes_elapsed() {
        let start = Utc::now();
        let mut result = JobResult::pending("j");
        result.finish(start, start + Duration::milliseconds(2500));
        assert_eq!(result.elapsed_seconds, 2.5);
        assert_eq!(result.started_at, Some(start));
    }

    #[test]
    fn failed_result_is_terminal_error() {
        let result = JobResult::failed("j", Utc::now(), "boom");
        assert_eq!(result.status, JobStatus::Error);
        assert_eq!(result.error_message.as_deref(), Some("boom"));
        assert!(result.ended_at.is_some());
    }
}
