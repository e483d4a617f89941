use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use reelq_core::JobStatus;
use serde::Serialize;

/// Scheduler operational metrics. Readable at any time via
/// [`Scheduler::metrics`](crate::Scheduler::metrics).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Jobs handed to a worker slot.
    pub jobs_dispatched: u64,
    /// Finished jobs per terminal status.
    pub jobs_finished: BTreeMap<JobStatus, u64>,
    /// Dispatch attempts refused by the resource gate.
    pub admission_denials: u64,
    /// Rolling mean of `elapsed_seconds` over finished jobs that ran.
    pub mean_elapsed_seconds: f64,
    /// In-flight jobs / `max_workers` (0.0 - 1.0).
    pub worker_utilization: f64,
    pub in_flight: usize,
    pub last_dispatch: Option<DateTime<Utc>>,
    #[serde(skip)]
    timed_samples: u64,
}

impl SchedulerMetrics {
    pub fn record_dispatch(&mut self) {
        self.jobs_dispatched += 1;
        self.last_dispatch = Some(Utc::now());
    }

    pub fn record_denial(&mut self) {
        self.admission_denials += 1;
    }

    /// Record a finished job. Only jobs that actually ran feed the mean.
    pub fn record_finish(&mut self, status: JobStatus, elapsed_seconds: Option<f64>) {
        *self.jobs_finished.entry(status).or_default() += 1;

        if let Some(elapsed) = elapsed_seconds {
            self.timed_samples += 1;
            // Incremental mean: new = prev + (x - prev) / n
            self.mean_elapsed_seconds +=
                (elapsed - self.mean_elapsed_seconds) / self.timed_samples as f64;
        }
    }

    pub fn set_in_flight(&mut self, in_flight: usize, max_workers: usize) {
        self.in_flight = in_flight;
        self.worker_utilization = if max_workers == 0 {
            0.0
        } else {
            in_flight as f64 / max_workers as f64
        };
    }

    pub fn finished(&self, status: JobStatus) -> u64 {
        self.jobs_finished.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_elapsed_is_incremental() {
        let mut m = SchedulerMetrics::default();
        m.record_finish(JobStatus::Completed, Some(10.0));
        m.record_finish(JobStatus::Error, Some(20.0));
        m.record_finish(JobStatus::Cancelled, None);

        assert!((m.mean_elapsed_seconds - 15.0).abs() < 1e-9);
        assert_eq!(m.finished(JobStatus::Completed), 1);
        assert_eq!(m.finished(JobStatus::Cancelled), 1);
        assert_eq!(m.finished(JobStatus::Pending), 0);
    }

    #[test]
    fn utilization_tracks_in_flight() {
        let mut m = SchedulerMetrics::default();
        m.set_in_flight(3, 4);
        assert_eq!(m.worker_utilization, 0.75);
        m.set_in_flight(0, 4);
        assert_eq!(m.worker_utilization, 0.0);
    }

    #[test]
    fn dispatch_and_denials() {
        let mut m = SchedulerMetrics::default();
        assert!(m.last_dispatch.is_none());
        m.record_dispatch();
        m.record_denial();
        m.record_denial();
        assert_eq!(m.jobs_dispatched, 1);
        assert_eq!(m.admission_denials, 2);
        assert!(m.last_dispatch.is_some());
    }
}
