//! Durable job history: per-job event logs, per-job result reports, and batch
//! summaries.
//!
//! Layout under the reports directory:
//! - `events/<job_id>.jsonl`: append-only, one [`JobEvent`] per line
//! - `jobs/<job_id>.json`: one [`JobReport`], rewritten when the job finishes

mod summary;

pub use summary::BatchSummary;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reelq_core::{JobResult, JobSpec, ReportError, ResourceSnapshot};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// One line of a job's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub message: String,
}

/// Structured record persisted once a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub spec: JobSpec,
    pub result: JobResult,
    /// Most recent background sample when the job finished, at most one
    /// `resource_check_interval_seconds` old. `sampled_at` records its age.
    pub resources: ResourceSnapshot,
    pub written_at: DateTime<Utc>,
}

/// Writes and reads back the on-disk job history.
#[derive(Debug, Clone)]
pub struct Reporter {
    dir: PathBuf,
}

impl Reporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the `events/` and `jobs/` directories.
    pub async fn init(&self) -> Result<(), ReportError> {
        tokio::fs::create_dir_all(self.events_dir()).await?;
        tokio::fs::create_dir_all(self.jobs_dir()).await?;
        info!(path = %self.dir.display(), "report store initialized");
        Ok(())
    }

    /// Append a timestamped line to the job's event log.
    pub async fn log_event(&self, job_id: &str, message: &str) -> Result<(), ReportError> {
        let event = JobEvent {
            timestamp: Utc::now(),
            job_id: job_id.to_string(),
            message: message.to_string(),
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        tokio::fs::create_dir_all(self.events_dir()).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.event_file(job_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(job_id, message, "job event logged");
        Ok(())
    }

    /// Persist `spec` + `result` + `resources` as the job's report.
    pub async fn write_job_report(
        &self,
        spec: &JobSpec,
        result: &JobResult,
        resources: &ResourceSnapshot,
    ) -> Result<JobReport, ReportError> {
        let report = JobReport {
            spec: spec.clone(),
            result: result.clone(),
            resources: resources.clone(),
            written_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&report)?;

        tokio::fs::create_dir_all(self.jobs_dir()).await?;
        let path = self.report_file(&spec.job_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(job_id = %spec.job_id, path = %path.display(), "job report written");
        Ok(report)
    }

    /// Every persisted report, oldest first. Unreadable files are skipped.
    pub async fn load_reports(&self) -> Result<Vec<JobReport>, ReportError> {
        let mut reports = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.jobs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(reports),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let data = tokio::fs::read(&path).await?;
                match serde_json::from_slice::<JobReport>(&data) {
                    Ok(report) => reports.push(report),
                    Err(e) => warn!(file = %path.display(), error = %e, "skipping corrupt job report"),
                }
            }
        }
        reports.sort_by(|a, b| {
            a.written_at
                .cmp(&b.written_at)
                .then_with(|| a.spec.job_id.cmp(&b.spec.job_id))
        });
        Ok(reports)
    }

    /// The job's event log in append order. Missing log = no events.
    pub async fn read_events(&self, job_id: &str) -> Result<Vec<JobEvent>, ReportError> {
        let path = self.event_file(job_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (i, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JobEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    file = %path.display(),
                    line = i + 1,
                    error = %e,
                    "skipping corrupt event line"
                ),
            }
        }
        Ok(events)
    }

    fn events_dir(&self) -> PathBuf {
        self.dir.join("events")
    }

    fn jobs_dir(&self) -> PathBuf {
        self.dir.join("jobs")
    }

    fn event_file(&self, job_id: &str) -> PathBuf {
        self.events_dir().join(format!("{}.jsonl", file_stem(job_id)))
    }

    fn report_file(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(format!("{}.json", file_stem(job_id)))
    }
}

/// File-name-safe form of a job id.
///
/// Bytes outside `[A-Za-z0-9._-]` are written as `%XX`, so distinct ids never
/// share a file. `""`, `.` and `..` are fully encoded.
pub fn file_stem(job_id: &str) -> String {
    match job_id {
        "" => return "%".to_string(),
        "." | ".." => return "%2E".repeat(job_id.len()),
        _ => {}
    }
    let mut stem = String::with_capacity(job_id.len());
    for byte in job_id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}
