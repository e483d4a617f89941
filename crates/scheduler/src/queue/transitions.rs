use chrono::Utc;
use reelq_core::{JobResult, JobSpec, JobStatus, QueueError};
use tracing::{debug, info};

use super::core::JobQueue;

impl JobQueue {
    /// Move `job_id` from `expected` to `next`, or fail without touching it.
    fn transition(
        &self,
        job_id: &str,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<JobResult, QueueError> {
        let updated = {
            let mut state = self.lock();
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
            let current = entry.result.status;
            if current != expected || !current.can_transition_to(next) {
                return Err(QueueError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: current,
                    to: next,
                });
            }
            entry.result.status = next;
            if next == JobStatus::Processing {
                entry.result.started_at = Some(Utc::now());
            }
            entry.result.clone()
        };
        debug!(job_id, from = %expected, to = %next, "job transition");
        self.bump();
        Ok(updated)
    }

    /// `Pending -> Queued`: the scheduler has picked this job.
    pub fn mark_queued(&self, job_id: &str) -> Result<JobResult, QueueError> {
        self.transition(job_id, JobStatus::Pending, JobStatus::Queued)
    }

    /// `Queued -> Processing`: a worker slot now owns this job.
    pub fn mark_running(&self, job_id: &str) -> Result<JobResult, QueueError> {
        self.transition(job_id, JobStatus::Queued, JobStatus::Processing)
    }

    /// Store the terminal outcome of a processing job.
    ///
    /// Fails if the job is not `Processing` (including when it was cancelled
    /// while running, in which case the late result is discarded) or if
    /// `result` does not carry a terminal status.
    pub fn record_result(&self, result: JobResult) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            let entry = state
                .jobs
                .get_mut(&result.job_id)
                .ok_or_else(|| QueueError::UnknownJob(result.job_id.clone()))?;
            let current = entry.result.status;
            if current != JobStatus::Processing
                || !result.status.is_terminal()
                || !current.can_transition_to(result.status)
            {
                return Err(QueueError::InvalidTransition {
                    job_id: result.job_id.clone(),
                    from: current,
                    to: result.status,
                });
            }
            info!(
                job_id = %result.job_id,
                status = %result.status,
                elapsed = result.elapsed_seconds,
                "job finished"
            );
            entry.result = result;
        }
        self.bump();
        Ok(())
    }

    /// Cancel a job that has not reached a terminal state.
    ///
    /// Returns the status the job was in. For a `Processing` job the caller is
    /// responsible for signalling its executor.
    pub fn cancel(&self, job_id: &str) -> Result<JobStatus, QueueError> {
        let previous = {
            let mut state = self.lock();
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
            let current = entry.result.status;
            if !current.can_transition_to(JobStatus::Cancelled) {
                return Err(QueueError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: current,
                    to: JobStatus::Cancelled,
                });
            }
            let now = Utc::now();
            entry.result.status = JobStatus::Cancelled;
            match entry.result.started_at {
                Some(started_at) => entry.result.finish(started_at, now),
                // Never ran: no start time, no elapsed time.
                None => {
                    entry.result.ended_at = Some(now);
                    entry.result.elapsed_seconds = 0.0;
                }
            }
            current
        };
        info!(job_id, previous = %previous, "job cancelled");
        self.bump();
        Ok(previous)
    }

    /// Remove a terminal job and hand back its final record.
    pub fn purge(&self, job_id: &str) -> Result<(JobSpec, JobResult), QueueError> {
        let removed = {
            let mut state = self.lock();
            let entry = state
                .jobs
                .get(job_id)
                .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
            if !entry.result.is_terminal() {
                return Err(QueueError::NotTerminal(job_id.to_string()));
            }
            state
                .jobs
                .remove(job_id)
                .map(|e| (e.spec, e.result))
                .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?
        };
        self.bump();
        Ok(removed)
    }

    /// Remove every terminal job. Returns how many were removed.
    pub fn purge_terminal(&self) -> usize {
        let removed = {
            let mut state = self.lock();
            let before = state.jobs.len();
            state.jobs.retain(|_, e| !e.result.is_terminal());
            before - state.jobs.len()
        };
        if removed > 0 {
            info!(removed, "purged terminal jobs");
            self.bump();
        }
        removed
    }
}
