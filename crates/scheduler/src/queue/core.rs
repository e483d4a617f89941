use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use reelq_core::{JobId, JobResult, JobSpec, JobStatus, QueueError};
use tokio::sync::watch;
use tracing::info;

/// One submitted job: its immutable spec, its current result, and its
/// submission sequence number (last-resort tie-break).
#[derive(Debug, Clone)]
pub(super) struct JobEntry {
    pub spec: JobSpec,
    pub result: JobResult,
    pub seq: u64,
}

#[derive(Debug, Default)]
pub(super) struct QueueState {
    pub jobs: HashMap<JobId, JobEntry>,
    pub next_seq: u64,
}

/// Selection criteria for [`JobQueue::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub owner_id: Option<String>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            owner_id: None,
        }
    }

    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            status: None,
            owner_id: Some(owner_id.into()),
        }
    }

    pub fn matches(&self, spec: &JobSpec, result: &JobResult) -> bool {
        self.status.map_or(true, |s| s == result.status)
            && self
                .owner_id
                .as_deref()
                .map_or(true, |o| spec.owner_id.as_deref() == Some(o))
    }
}

/// Thread-safe store of every submitted job and its result.
///
/// All reads and writes go through one mutex, so submission, selection, and
/// status transitions never interleave. Every mutation bumps a version number
/// published on a `watch` channel; the dispatch loop parks on it instead of
/// polling.
pub struct JobQueue {
    pub(super) state: Mutex<QueueState>,
    version: watch::Sender<u64>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState::default()),
            version,
        }
    }

    /// Critical sections never panic mid-update, so a poisoned lock still
    /// guards consistent state.
    pub(super) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Receiver that observes every queue mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Store a new job in `Pending`. Duplicate ids are rejected and leave the
    /// queue untouched.
    pub fn submit(&self, spec: JobSpec) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.jobs.contains_key(&spec.job_id) {
                return Err(QueueError::DuplicateJob(spec.job_id));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            info!(
                job_id = %spec.job_id,
                priority = %spec.priority,
                deadline = ?spec.deadline,
                "job submitted"
            );
            let entry = JobEntry {
                result: JobResult::pending(spec.job_id.clone()),
                spec,
                seq,
            };
            state.jobs.insert(entry.spec.job_id.clone(), entry);
        }
        self.bump();
        Ok(())
    }

    /// Last known result for a job.
    pub fn get_status(&self, job_id: &str) -> Option<JobResult> {
        self.lock().jobs.get(job_id).map(|e| e.result.clone())
    }

    pub fn get_spec(&self, job_id: &str) -> Option<JobSpec> {
        self.lock().jobs.get(job_id).map(|e| e.spec.clone())
    }

    /// Every job with its result, in submission order.
    pub fn snapshot(&self) -> Vec<(JobSpec, JobResult)> {
        self.list(&JobFilter::default())
    }

    /// Jobs matching `filter`, in submission order.
    pub fn list(&self, filter: &JobFilter) -> Vec<(JobSpec, JobResult)> {
        let state = self.lock();
        let mut entries: Vec<&JobEntry> = state
            .jobs
            .values()
            .filter(|e| filter.matches(&e.spec, &e.result))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .map(|e| (e.spec.clone(), e.result.clone()))
            .collect()
    }

    /// Job count per status. Every status is present, zero or not.
    pub fn status_summary(&self) -> BTreeMap<JobStatus, usize> {
        status_counts(self.lock().jobs.values().map(|e| &e.result))
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|e| e.result.status == status)
            .count()
    }

    /// True when every known job has reached a terminal status.
    pub fn is_settled(&self) -> bool {
        self.lock().jobs.values().all(|e| e.result.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }
}

/// Count `results` per status. Every status is present, zero or not.
pub fn status_counts<'a, I>(results: I) -> BTreeMap<JobStatus, usize>
where
    I: IntoIterator<Item = &'a JobResult>,
{
    let mut counts: BTreeMap<JobStatus, usize> =
        JobStatus::ALL.into_iter().map(|s| (s, 0)).collect();
    for result in results {
        *counts.entry(result.status).or_default() += 1;
    }
    counts
}
