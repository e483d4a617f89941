use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use reelq_core::{JobId, JobResult, JobStatus, ResourceSnapshot};
use serde::Serialize;

use crate::queue::status_counts;

use super::JobReport;

/// Aggregate view of a batch: job counts per status plus host pressure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub generated_at: DateTime<Utc>,
    /// Every status is present, zero or not.
    pub counts: BTreeMap<JobStatus, usize>,
    pub total: usize,
    /// Current host pressure; absent when summarizing persisted reports.
    pub resources: Option<ResourceSnapshot>,
    /// Mean elapsed seconds over terminal jobs that actually ran.
    pub mean_elapsed_seconds: Option<f64>,
    /// `(job_id, error_message)` for every failed job.
    pub failures: Vec<(JobId, String)>,
}

impl BatchSummary {
    /// Summary from live queue counts.
    pub fn new(counts: BTreeMap<JobStatus, usize>, resources: ResourceSnapshot) -> Self {
        let total = counts.values().sum();
        Self {
            generated_at: Utc::now(),
            counts,
            total,
            resources: Some(resources),
            mean_elapsed_seconds: None,
            failures: Vec::new(),
        }
    }

    /// Attach timing and failure details from finished jobs.
    pub fn with_details<'a, I>(mut self, results: I) -> Self
    where
        I: IntoIterator<Item = &'a JobResult>,
    {
        let mut elapsed = Vec::new();
        for result in results {
            if result.status == JobStatus::Error {
                self.failures.push((
                    result.job_id.clone(),
                    result.error_message.clone().unwrap_or_default(),
                ));
            }
            if result.is_terminal() && result.started_at.is_some() {
                elapsed.push(result.elapsed_seconds);
            }
        }
        if !elapsed.is_empty() {
            self.mean_elapsed_seconds = Some(elapsed.iter().sum::<f64>() / elapsed.len() as f64);
        }
        self
    }

    /// Summary of persisted reports (no live host reading).
    pub fn from_reports(reports: &[JobReport]) -> Self {
        let counts = status_counts(reports.iter().map(|r| &r.result));
        let summary = Self {
            generated_at: Utc::now(),
            total: reports.len(),
            counts,
            resources: None,
            mean_elapsed_seconds: None,
            failures: Vec::new(),
        };
        summary.with_details(reports.iter().map(|r| &r.result))
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Batch summary ({})",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(f, "  total jobs: {}", self.total)?;
        for (status, count) in &self.counts {
            writeln!(f, "  {:<11} {}", format!("{status}:"), count)?;
        }
        if let Some(mean) = self.mean_elapsed_seconds {
            writeln!(f, "  mean elapsed: {mean:.1}s")?;
        }
        if let Some(res) = &self.resources {
            writeln!(
                f,
                "  host: cpu {:.1}%  memory {:.1}%  disk {:.1}%{}",
                res.cpu_percent,
                res.memory_percent,
                res.disk_percent,
                if res.stale { " (stale)" } else { "" }
            )?;
        }
        if !self.failures.is_empty() {
            writeln!(f, "  failures:")?;
            for (job_id, message) in &self.failures {
                writeln!(f, "    {job_id}: {message}")?;
            }
        }
        Ok(())
    }
}
