use std::cmp::Ordering;

use reelq_core::{JobSpec, JobStatus};

use super::core::{JobEntry, JobQueue};

/// Dispatch order between two jobs. `Less` means `a` runs first.
///
/// 1. higher priority
/// 2. earlier deadline; a job without a deadline sorts after every job with one
/// 3. earlier `submitted_at`
/// 4. earlier submission sequence
pub(super) fn dispatch_order(a: &JobEntry, b: &JobEntry) -> Ordering {
    b.spec
        .priority
        .cmp(&a.spec.priority)
        .then_with(|| match (a.spec.deadline, b.spec.deadline) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.spec.submitted_at.cmp(&b.spec.submitted_at))
        .then_with(|| a.seq.cmp(&b.seq))
}

impl JobQueue {
    /// The pending job that should run next, if any.
    ///
    /// Pure read: the job stays `Pending` until the scheduler transitions it,
    /// so an admission denial never costs a job its place in line.
    pub fn select_next(&self) -> Option<JobSpec> {
        let state = self.lock();
        state
            .jobs
            .values()
            .filter(|e| e.result.status == JobStatus::Pending)
            .min_by(|a, b| dispatch_order(a, b))
            .map(|e| e.spec.clone())
    }

    /// Every pending job in the order it would be dispatched.
    pub fn pending_in_order(&self) -> Vec<JobSpec> {
        let state = self.lock();
        let mut pending: Vec<&JobEntry> = state
            .jobs
            .values()
            .filter(|e| e.result.status == JobStatus::Pending)
            .collect();
        pending.sort_by(|a, b| dispatch_order(a, b));
        pending.into_iter().map(|e| e.spec.clone()).collect()
    }
}
