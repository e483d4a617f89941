use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::FutureExt;
use reelq_core::{JobId, JobResult, JobSpec, QueueError, SchedulerError};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::core::Shared;

/// What one dispatch attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// A job went to a worker slot, or a cancelled one was skipped. Try again.
    Progress,
    /// Every slot is busy.
    Full,
    /// The resource gate said no.
    Denied,
    /// Nothing pending.
    Idle,
}

type WorkerExit = (JobId, Result<(), QueueError>);

/// The dispatch loop. Returns when shutdown is requested (after draining) or
/// on a scheduler-integrity fault.
pub(super) async fn run(
    shared: Shared,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SchedulerError> {
    let mut workers: JoinSet<WorkerExit> = JoinSet::new();
    let mut queue_changes = shared.queue.subscribe();
    let mut snapshot_changes = shared.monitor.subscribe();
    info!(max_workers = shared.max_workers, "dispatch loop started");

    let fault = loop {
        if *shutdown.borrow_and_update() {
            break None;
        }

        let attempt = match try_dispatch(&shared, &mut workers) {
            Ok(attempt) => attempt,
            Err(e) => break Some(e),
        };
        if attempt == Attempt::Progress {
            continue;
        }
        let wait = match attempt {
            Attempt::Denied => shared.admission_backoff,
            _ => shared.poll_interval,
        };

        tokio::select! {
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = reap(&shared, &workers, joined) {
                    break Some(e);
                }
            }
            _ = queue_changes.changed() => {
                debug!("dispatch woken by queue change");
            }
            _ = snapshot_changes.changed() => {
                debug!("dispatch woken by resource sample");
            }
            changed = shutdown.changed() => {
                // A dropped sender means the scheduler itself is gone.
                if changed.is_err() {
                    break None;
                }
            }
            _ = tokio::time::sleep(wait) => {}
        }
    };

    match fault {
        None => drain(&shared, &mut workers).await,
        Some(fault) => {
            error!(error = %fault, "scheduler integrity fault, stopping dispatch");
            terminate(&shared, &mut workers, "terminated after scheduler integrity fault").await;
            Err(fault)
        }
    }
}

/// One pass of the dispatch algorithm: slot check, admission gate, selection,
/// transition, hand-off.
fn try_dispatch(
    shared: &Shared,
    workers: &mut JoinSet<WorkerExit>,
) -> Result<Attempt, SchedulerError> {
    if workers.len() >= shared.max_workers {
        return Ok(Attempt::Full);
    }
    if !shared.monitor.can_admit_new_job() {
        shared.metrics_mut().record_denial();
        return Ok(Attempt::Denied);
    }
    let Some(spec) = shared.queue.select_next() else {
        return Ok(Attempt::Idle);
    };
    let job_id = spec.job_id.clone();

    // Registered before the job turns Processing so a cancel always finds it.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    shared.in_flight().insert(job_id.clone(), cancel_tx);

    let claimed = shared
        .queue
        .mark_queued(&job_id)
        .and_then(|_| shared.queue.mark_running(&job_id));
    if let Err(e) = claimed {
        shared.in_flight().remove(&job_id);
        if e.is_cancel_race() {
            debug!(job_id = %job_id, "job cancelled before dispatch, skipping");
            return Ok(Attempt::Progress);
        }
        return Err(SchedulerError::Integrity(e));
    }

    info!(job_id = %job_id, priority = %spec.priority, "dispatching job");
    workers.spawn(supervise(shared.clone(), spec, cancel_rx));
    {
        let mut metrics = shared.metrics_mut();
        metrics.record_dispatch();
        metrics.set_in_flight(workers.len(), shared.max_workers);
    }
    Ok(Attempt::Progress)
}

/// Run one job in its worker slot. Never panics out: a panic anywhere in the
/// worker becomes an `Error` result for this job.
async fn supervise(shared: Shared, spec: JobSpec, cancel: watch::Receiver<bool>) -> WorkerExit {
    let job_id = spec.job_id.clone();
    let started_at = Utc::now();

    let outcome = match AssertUnwindSafe(run_job(&shared, spec, cancel))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(job_id = %job_id, "worker panicked");
            let still_running = shared
                .queue
                .get_status(&job_id)
                .map_or(false, |r| !r.is_terminal());
            if still_running {
                let result = JobResult::failed(job_id.clone(), started_at, "worker panicked");
                settle(&shared, result).await
            } else {
                Ok(())
            }
        }
    };

    shared.in_flight().remove(&job_id);
    (job_id, outcome)
}

async fn run_job(
    shared: &Shared,
    spec: JobSpec,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), QueueError> {
    shared.log_event(&spec.job_id, "dispatched").await;

    let cancelled = async move {
        // A dropped sender means the slot is being torn down, not a cancel.
        let closed = cancel.wait_for(|c| *c).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    };
    let result = shared.executor.execute_until(&spec, cancelled).await;
    settle(shared, result).await
}

/// Store a worker's terminal result, then log and report it.
///
/// A result for a job that was cancelled meanwhile is dropped; any other
/// rejected transition is an integrity fault.
async fn settle(shared: &Shared, result: JobResult) -> Result<(), QueueError> {
    let job_id = result.job_id.clone();
    let status = result.status;
    let elapsed = result.elapsed_seconds;
    let message = match &result.error_message {
        Some(msg) => format!("finished: {status} ({msg})"),
        None => format!("finished: {status}"),
    };

    match shared.queue.record_result(result) {
        Ok(()) => {}
        Err(e) if e.is_cancel_race() => {
            debug!(job_id = %job_id, "discarding result of cancelled job");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    shared.metrics_mut().record_finish(status, Some(elapsed));
    shared.log_event(&job_id, &message).await;
    shared.write_report(&job_id).await;
    Ok(())
}

/// Handle one finished worker.
fn reap(
    shared: &Shared,
    workers: &JoinSet<WorkerExit>,
    joined: Result<WorkerExit, JoinError>,
) -> Result<(), SchedulerError> {
    shared
        .metrics_mut()
        .set_in_flight(workers.len(), shared.max_workers);
    match joined {
        Ok((job_id, Ok(()))) => {
            debug!(job_id = %job_id, "worker slot freed");
            Ok(())
        }
        Ok((_, Err(e))) => Err(SchedulerError::Integrity(e)),
        Err(e) => Err(SchedulerError::Join(e.to_string())),
    }
}

/// Graceful drain: wait for in-flight jobs up to the shutdown timeout, then
/// abort the rest.
async fn drain(shared: &Shared, workers: &mut JoinSet<WorkerExit>) -> Result<(), SchedulerError> {
    if workers.is_empty() {
        info!("dispatch loop stopped");
        return Ok(());
    }
    info!(
        in_flight = workers.len(),
        timeout = ?shared.shutdown_timeout,
        "draining workers"
    );

    let drained = tokio::time::timeout(shared.shutdown_timeout, async {
        let mut fault = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = reap(shared, workers, joined) {
                error!(error = %e, "worker failed during drain");
                fault.get_or_insert(e);
            }
        }
        fault
    })
    .await;

    match drained {
        Ok(None) => {
            info!("workers drained, dispatch loop stopped");
            Ok(())
        }
        Ok(Some(fault)) => Err(fault),
        Err(_) => {
            warn!(in_flight = workers.len(), "drain timed out, forcing shutdown");
            terminate(shared, workers, "terminated during shutdown").await;
            Ok(())
        }
    }
}

/// Abort every worker and record its job as failed with `reason`.
async fn terminate(shared: &Shared, workers: &mut JoinSet<WorkerExit>, reason: &str) {
    workers.abort_all();
    while workers.join_next().await.is_some() {}

    let orphaned: Vec<JobId> = shared.in_flight().drain().map(|(id, _)| id).collect();
    for job_id in orphaned {
        let started_at = shared
            .queue
            .get_status(&job_id)
            .and_then(|r| r.started_at)
            .unwrap_or_else(Utc::now);
        match settle(shared, JobResult::failed(job_id.clone(), started_at, reason)).await {
            Ok(()) => warn!(job_id = %job_id, reason, "job aborted"),
            Err(e) => debug!(job_id = %job_id, error = %e, "aborted job had already settled"),
        }
    }
    shared.metrics_mut().set_in_flight(0, shared.max_workers);
}
