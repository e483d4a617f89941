//! End-to-end scheduling scenarios against the public API, with a scripted
//! pipeline and a fixed host reading.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reelq_core::config::SchedulerConfig;
use reelq_core::{ExecutionError, JobSpec, JobStatus, Priority};
use reelq_scheduler::{
    JobExecutor, JobFilter, Pipeline, PipelineOutcome, PipelineRequest, ResourceMonitor,
    Scheduler, StaticSampler,
};

/// Records dispatch order and concurrency; fails the ids it is told to.
#[derive(Default)]
struct ScriptedPipeline {
    order: Mutex<Vec<String>>,
    failing: HashSet<String>,
    running: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl ScriptedPipeline {
    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl Pipeline for ScriptedPipeline {
    async fn run(&self, request: &PipelineRequest) -> Result<PipelineOutcome, ExecutionError> {
        self.order.lock().unwrap().push(request.job_id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&request.job_id) {
            return Ok(PipelineOutcome {
                success: false,
                exit_code: Some(1),
                artifacts: vec![],
                diagnostics: "render failed: missing media".into(),
            });
        }
        Ok(PipelineOutcome {
            success: true,
            exit_code: Some(0),
            artifacts: vec![format!("{}/final.mp4", request.output_location)],
            diagnostics: String::new(),
        })
    }
}

fn scheduler_with(
    max_workers: usize,
    max_cpu_percent: f64,
    pipeline: Arc<ScriptedPipeline>,
) -> Scheduler {
    let config = SchedulerConfig {
        max_workers,
        max_cpu_percent,
        poll_interval_seconds: 0.02,
        resource_check_interval_seconds: 0.02,
        admission_backoff_seconds: 0.02,
        shutdown_timeout_seconds: 2.0,
        ..SchedulerConfig::default()
    };
    let monitor = ResourceMonitor::new(Arc::new(StaticSampler::new(10.0, 10.0, 10.0)), &config);
    Scheduler::new(config, monitor, JobExecutor::new(pipeline))
}

fn job(id: &str) -> JobSpec {
    JobSpec::new(id, format!("projects/{id}"), format!("renders/{id}"))
}

async fn settle(scheduler: &Scheduler) {
    tokio::time::timeout(Duration::from_secs(10), scheduler.wait_until_settled())
        .await
        .expect("jobs did not settle in time")
        .expect("scheduler failed");
}

#[tokio::test]
async fn priorities_dispatch_highest_first() {
    let pipeline = Arc::new(ScriptedPipeline::default());
    let scheduler = scheduler_with(1, 80.0, pipeline.clone());

    for (id, priority) in [
        ("low", Priority::Low),
        ("urgent", Priority::Urgent),
        ("normal", Priority::Normal),
    ] {
        scheduler
            .submit_job(job(id).with_priority(priority))
            .await
            .unwrap();
    }
    scheduler.start().unwrap();
    settle(&scheduler).await;
    scheduler.stop().await.unwrap();

    assert_eq!(pipeline.order(), vec!["urgent", "normal", "low"]);
}

#[tokio::test]
async fn equal_priority_follows_submission_order() {
    let pipeline = Arc::new(ScriptedPipeline::default());
    let scheduler = scheduler_with(1, 80.0, pipeline.clone());
    let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

    scheduler
        .submit_job(job("second").submitted_at(t0 + chrono::Duration::seconds(1)))
        .await
        .unwrap();
    scheduler
        .submit_job(job("first").submitted_at(t0))
        .await
        .unwrap();
    scheduler.start().unwrap();
    settle(&scheduler).await;
    scheduler.stop().await.unwrap();

    assert_eq!(pipeline.order(), vec!["first", "second"]);
}

#[tokio::test]
async fn failing_job_errors_and_scheduler_keeps_going() {
    let pipeline = Arc::new(ScriptedPipeline {
        failing: HashSet::from(["broken".to_string()]),
        ..ScriptedPipeline::default()
    });
    let scheduler = scheduler_with(1, 80.0, pipeline.clone());

    scheduler
        .submit_job(job("broken").with_priority(Priority::High))
        .await
        .unwrap();
    scheduler.submit_job(job("after-1")).await.unwrap();
    scheduler.submit_job(job("after-2")).await.unwrap();
    scheduler.start().unwrap();
    settle(&scheduler).await;
    scheduler.stop().await.unwrap();

    let broken = scheduler.get_status("broken").unwrap();
    assert_eq!(broken.status, JobStatus::Error);
    assert!(!broken.error_message.unwrap_or_default().is_empty());
    for id in ["after-1", "after-2"] {
        assert_eq!(scheduler.get_status(id).unwrap().status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn cancelled_pending_job_is_never_dispatched() {
    let pipeline = Arc::new(ScriptedPipeline::default());
    let scheduler = scheduler_with(1, 80.0, pipeline.clone());

    scheduler.submit_job(job("keep")).await.unwrap();
    scheduler.submit_job(job("drop")).await.unwrap();
    assert!(scheduler.cancel("drop").await);
    assert_eq!(
        scheduler.get_status("drop").unwrap().status,
        JobStatus::Cancelled
    );

    scheduler.start().unwrap();
    settle(&scheduler).await;
    scheduler.stop().await.unwrap();

    assert_eq!(pipeline.order(), vec!["keep"]);
    assert_eq!(
        scheduler.get_status("drop").unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn zero_cpu_ceiling_admits_nothing() {
    let pipeline = Arc::new(ScriptedPipeline::default());
    let scheduler = scheduler_with(4, 0.0, pipeline.clone());

    for i in 0..3 {
        scheduler.submit_job(job(&format!("job-{i}"))).await.unwrap();
    }
    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let jobs = scheduler.list_jobs(None);
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|(_, r)| r.status == JobStatus::Pending));
    assert!(scheduler
        .list_jobs(Some(JobFilter::status(JobStatus::Processing)))
        .is_empty());
    assert!(pipeline.order().is_empty());
    assert!(scheduler.metrics().admission_denials > 0);
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn processing_never_exceeds_max_workers() {
    let pipeline = Arc::new(ScriptedPipeline {
        delay: Duration::from_millis(30),
        ..ScriptedPipeline::default()
    });
    let scheduler = scheduler_with(3, 80.0, pipeline.clone());
    scheduler.start().unwrap();

    for i in 0..12 {
        scheduler.submit_job(job(&format!("job-{i}"))).await.unwrap();
    }

    let watcher = async {
        let mut max_seen = 0;
        while !scheduler.queue().is_settled() {
            let processing = scheduler.queue().count(JobStatus::Processing);
            max_seen = max_seen.max(processing);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        max_seen
    };
    let max_seen = tokio::time::timeout(Duration::from_secs(10), watcher)
        .await
        .expect("jobs did not settle in time");
    scheduler.stop().await.unwrap();

    assert!(max_seen <= 3, "saw {max_seen} processing jobs");
    assert!(pipeline.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(scheduler.queue().count(JobStatus::Completed), 12);
}

#[tokio::test]
async fn each_job_runs_exactly_once() {
    let pipeline = Arc::new(ScriptedPipeline {
        delay: Duration::from_millis(5),
        ..ScriptedPipeline::default()
    });
    let scheduler = scheduler_with(4, 80.0, pipeline.clone());
    scheduler.start().unwrap();
    for i in 0..20 {
        scheduler.submit_job(job(&format!("job-{i}"))).await.unwrap();
    }
    settle(&scheduler).await;
    scheduler.stop().await.unwrap();

    let order = pipeline.order();
    let unique: HashSet<&String> = order.iter().collect();
    assert_eq!(order.len(), 20);
    assert_eq!(unique.len(), 20);
}
