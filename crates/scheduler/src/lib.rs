//! Resource-gated media job scheduling.
//!
//! - [`monitor`]: host sampling and the admission gate
//! - [`queue`]: the job store and next-job selection
//! - [`executor`]: runs one job through the external pipeline
//! - [`report`]: event logs, job reports, batch summaries
//! - [`runner`]: the dispatch loop and worker pool

pub mod executor;
pub mod metrics;
pub mod monitor;
pub mod queue;
pub mod report;
pub mod runner;

pub use executor::{
    CommandPipeline, CommandScorer, JobExecutor, Pipeline, PipelineOutcome, PipelineRequest,
    QualityScorer,
};
pub use metrics::SchedulerMetrics;
pub use monitor::{AdmissionThresholds, HostSampler, ProcfsSampler, ResourceMonitor, StaticSampler};
pub use queue::{JobFilter, JobQueue};
pub use report::{BatchSummary, JobEvent, JobReport, Reporter};
pub use runner::Scheduler;
