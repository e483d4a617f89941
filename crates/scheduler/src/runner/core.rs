use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use reelq_core::config::SchedulerConfig;
use reelq_core::{
    Config, ConfigError, JobId, JobResult, JobSpec, JobStatus, QueueError, SchedulerError,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::executor::{CommandPipeline, CommandScorer, JobExecutor};
use crate::metrics::SchedulerMetrics;
use crate::monitor::{ProcfsSampler, ResourceMonitor};
use crate::queue::{status_counts, JobFilter, JobQueue};
use crate::report::{BatchSummary, Reporter};

use super::dispatch;

/// Everything the dispatch loop and its workers share. Cheap to clone.
#[derive(Clone)]
pub(super) struct Shared {
    pub queue: Arc<JobQueue>,
    pub monitor: Arc<ResourceMonitor>,
    pub executor: Arc<JobExecutor>,
    pub reporter: Option<Arc<Reporter>>,
    pub metrics: Arc<RwLock<SchedulerMetrics>>,
    /// Cancel signal per job currently owned by a worker slot.
    pub in_flight: Arc<Mutex<HashMap<JobId, watch::Sender<bool>>>>,
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub admission_backoff: Duration,
    pub shutdown_timeout: Duration,
    /// Flipped to true once the dispatch loop has returned.
    pub exited: Arc<watch::Sender<bool>>,
}

impl Shared {
    pub fn in_flight(&self) -> MutexGuard<'_, HashMap<JobId, watch::Sender<bool>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn metrics_mut(&self) -> std::sync::RwLockWriteGuard<'_, SchedulerMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the job's event log. Persistence failures are logged only.
    pub async fn log_event(&self, job_id: &str, message: &str) {
        if let Some(reporter) = &self.reporter {
            if let Err(e) = reporter.log_event(job_id, message).await {
                warn!(job_id, error = %e, "failed to write job event");
            }
        }
    }

    /// Persist the terminal report for `job_id` from the queue's stored result.
    pub async fn write_report(&self, job_id: &str) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        let (Some(spec), Some(result)) = (self.queue.get_spec(job_id), self.queue.get_status(job_id))
        else {
            return;
        };
        // Latest background sample; reports never sample the host inline.
        let resources = self.monitor.latest();
        if let Err(e) = reporter.write_job_report(&spec, &result, &resources).await {
            warn!(job_id, error = %e, "failed to write job report");
        }
    }
}

enum Lifecycle {
    Idle,
    Running {
        dispatch: JoinHandle<Result<(), SchedulerError>>,
        sampler: JoinHandle<()>,
    },
    Finished,
}

/// Resource-gated job scheduler: one dispatch loop plus a bounded, supervised
/// set of concurrent workers.
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) shared: Shared,
    shutdown: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
}

impl Scheduler {
    /// Create a scheduler with an empty queue and no report persistence.
    pub fn new(config: SchedulerConfig, monitor: ResourceMonitor, executor: JobExecutor) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (exited, _) = watch::channel(false);
        let shared = Shared {
            queue: Arc::new(JobQueue::new()),
            monitor: Arc::new(monitor),
            executor: Arc::new(executor),
            reporter: None,
            metrics: Arc::new(RwLock::new(SchedulerMetrics::default())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            max_workers: config.max_workers,
            poll_interval: config.poll_interval(),
            admission_backoff: config.admission_backoff(),
            shutdown_timeout: config.shutdown_timeout(),
            exited: Arc::new(exited),
        };
        Self {
            config,
            shared,
            shutdown,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Build the production wiring from a full [`Config`]: procfs sampling,
    /// command pipeline, optional command scorer, and on-disk reports.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let pipeline = CommandPipeline::from_config(&config.pipeline).ok_or_else(|| {
            ConfigError::Invalid("pipeline.program is required to run jobs".into())
        })?;
        let mut executor = JobExecutor::new(Arc::new(pipeline));
        if let Some(scorer) = CommandScorer::from_config(&config.scoring) {
            executor = executor.with_scorer(Arc::new(scorer));
        }
        let sampler = ProcfsSampler::new(config.scheduler.disk_path.clone());
        let monitor = ResourceMonitor::new(Arc::new(sampler), &config.scheduler);

        Ok(Self::new(config.scheduler.clone(), monitor, executor)
            .with_reporter(Reporter::new(config.reports.dir.clone())))
    }

    /// Persist event logs and job reports through `reporter`.
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.shared.reporter = Some(Arc::new(reporter));
        self
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the resource sampler and the dispatch loop. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(SchedulerError::AlreadyStarted);
        }
        info!(
            max_workers = self.config.max_workers,
            max_cpu = self.config.max_cpu_percent,
            max_memory = self.config.max_memory_percent,
            "scheduler starting"
        );

        let monitor = Arc::clone(&self.shared.monitor);
        let interval = self.config.resource_check_interval();
        let sampler_shutdown = self.shutdown.subscribe();
        let sampler = tokio::spawn(async move {
            monitor.run_sampler(interval, sampler_shutdown).await;
        });

        let shared = self.shared.clone();
        let loop_shutdown = self.shutdown.subscribe();
        let dispatch = tokio::spawn(async move {
            let outcome = dispatch::run(shared.clone(), loop_shutdown).await;
            shared.exited.send_replace(true);
            outcome
        });

        *lifecycle = Lifecycle::Running { dispatch, sampler };
        Ok(())
    }

    /// Stop dispatching, let in-flight jobs finish within the shutdown
    /// timeout, then abort whatever is left.
    ///
    /// Jobs that never left `Pending` stay `Pending`. Returns the dispatch
    /// loop's outcome, including any integrity fault it stopped on.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let idle = matches!(*self.lifecycle(), Lifecycle::Idle);
        if idle {
            return Err(SchedulerError::NotStarted);
        }
        info!(timeout = ?self.shared.shutdown_timeout, "scheduler stop requested");
        self.shutdown.send_replace(true);
        self.join().await
    }

    /// Wait for the dispatch loop to exit on its own (after [`stop`](Self::stop)
    /// or an integrity fault) and tear down the sampler.
    pub async fn join(&self) -> Result<(), SchedulerError> {
        let running = {
            let mut lifecycle = self.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Finished) {
                Lifecycle::Running { dispatch, sampler } => (dispatch, sampler),
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Idle;
                    return Err(SchedulerError::NotStarted);
                }
                Lifecycle::Finished => return Ok(()),
            }
        };
        let (dispatch, sampler) = running;

        let outcome = match dispatch.await {
            Ok(outcome) => outcome,
            Err(e) => Err(SchedulerError::Join(e.to_string())),
        };
        self.shutdown.send_replace(true);
        if let Err(e) = sampler.await {
            warn!(error = %e, "resource sampler task failed");
        }
        info!(ok = outcome.is_ok(), "scheduler stopped");
        outcome
    }

    /// Resolve once every known job is terminal.
    ///
    /// Fails with the loop's error if the dispatch loop exits first, or with
    /// [`SchedulerError::Stopped`] if it exited cleanly with live jobs left.
    pub async fn wait_until_settled(&self) -> Result<(), SchedulerError> {
        let mut changes = self.shared.queue.subscribe();
        let mut exited = self.shared.exited.subscribe();
        loop {
            if self.shared.queue.is_settled() {
                return Ok(());
            }
            let idle = matches!(*self.lifecycle(), Lifecycle::Idle);
            if idle {
                return Err(SchedulerError::NotStarted);
            }
            if *exited.borrow_and_update() {
                self.join().await?;
                return if self.shared.queue.is_settled() {
                    Ok(())
                } else {
                    Err(SchedulerError::Stopped)
                };
            }
            tokio::select! {
                _ = changes.changed() => {}
                _ = exited.changed() => {}
            }
        }
    }

    // ── Submission API ───────────────────────────────────────────────

    /// Queue a job. Duplicate ids are rejected and leave the queue unchanged.
    pub async fn submit_job(&self, spec: JobSpec) -> Result<JobId, QueueError> {
        let job_id = spec.job_id.clone();
        let priority = spec.priority;
        self.shared.queue.submit(spec)?;
        self.shared
            .log_event(&job_id, &format!("submitted with priority {priority}"))
            .await;
        Ok(job_id)
    }

    /// Last known result for `job_id`.
    pub fn get_status(&self, job_id: &str) -> Option<JobResult> {
        self.shared.queue.get_status(job_id)
    }

    /// Cancel a live job. Returns false for unknown or already-terminal jobs.
    ///
    /// A `Processing` job is marked cancelled at once and its executor is
    /// signalled; whatever the pipeline produces afterwards is discarded.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let previous = match self.shared.queue.cancel(job_id) {
            Ok(previous) => previous,
            Err(e) => {
                debug!(job_id, error = %e, "cancel refused");
                return false;
            }
        };

        if previous == JobStatus::Processing {
            if let Some(signal) = self.shared.in_flight().get(job_id) {
                signal.send_replace(true);
            }
        }
        let elapsed = self
            .shared
            .queue
            .get_status(job_id)
            .filter(|_| previous == JobStatus::Processing)
            .map(|r| r.elapsed_seconds);
        self.shared
            .metrics_mut()
            .record_finish(JobStatus::Cancelled, elapsed);

        self.shared
            .log_event(job_id, &format!("cancelled while {previous}"))
            .await;
        self.shared.write_report(job_id).await;
        true
    }

    /// Every job (or those matching `filter`) with its current result.
    pub fn list_jobs(&self, filter: Option<JobFilter>) -> Vec<(JobSpec, JobResult)> {
        self.shared.queue.list(&filter.unwrap_or_default())
    }

    /// Current counts plus host pressure. Never blocks the dispatch loop beyond
    /// one queue read.
    pub fn batch_summary(&self) -> BatchSummary {
        let jobs = self.shared.queue.snapshot();
        let counts = status_counts(jobs.iter().map(|(_, result)| result));
        BatchSummary::new(counts, self.shared.monitor.latest())
            .with_details(jobs.iter().map(|(_, result)| result))
    }

    /// Remove every terminal job from the queue.
    pub fn purge_terminal(&self) -> usize {
        self.shared.queue.purge_terminal()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.shared
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.shared.queue
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.shared.monitor
    }

    pub fn reporter(&self) -> Option<&Arc<Reporter>> {
        self.shared.reporter.as_ref()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}
