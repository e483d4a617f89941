//! Runs one job through the external processing pipeline.
//!
//! The pipeline and the optional quality scorer are opaque collaborators behind
//! the [`Pipeline`] and [`QualityScorer`] traits. Everything that can go wrong
//! inside a job, including a panic, is converted into a terminal `Error`
//! [`JobResult`] here; nothing escapes to the scheduler.

mod command;

pub use command::{CommandPipeline, CommandScorer};

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use reelq_core::{ExecutionError, JobOptions, JobResult, JobSpec, JobStatus, ScoringError};
use tracing::{debug, info, warn};

/// Inputs handed to the external pipeline for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub job_id: String,
    pub source_location: String,
    pub output_location: String,
    pub options: JobOptions,
}

impl PipelineRequest {
    pub fn from_spec(spec: &JobSpec) -> Self {
        Self {
            job_id: spec.job_id.clone(),
            source_location: spec.source_location.clone(),
            output_location: spec.output_location.clone(),
            options: spec.options.clone(),
        }
    }
}

/// What the external pipeline reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Artifacts the pipeline reported explicitly. Empty means "look in the
    /// output location".
    pub artifacts: Vec<String>,
    pub diagnostics: String,
}

/// The external media-processing pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn run(&self, request: &PipelineRequest) -> Result<PipelineOutcome, ExecutionError>;
}

/// Optional per-artifact quality scoring. Failures are logged, never fatal.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    async fn score(&self, artifact: &str) -> Result<BTreeMap<String, f64>, ScoringError>;
}

/// Executes a single job and produces its terminal [`JobResult`].
#[derive(Clone)]
pub struct JobExecutor {
    pipeline: Arc<dyn Pipeline>,
    scorer: Option<Arc<dyn QualityScorer>>,
}

impl JobExecutor {
    pub fn new(pipeline: Arc<dyn Pipeline>) -> Self {
        Self {
            pipeline,
            scorer: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Run `spec` to completion.
    pub async fn execute(&self, spec: &JobSpec) -> JobResult {
        self.execute_until(spec, std::future::pending()).await
    }

    /// Run `spec` until it finishes or `cancelled` resolves, whichever is first.
    ///
    /// On cancellation the pipeline future is dropped and a `Cancelled` result
    /// is returned.
    pub async fn execute_until<C>(&self, spec: &JobSpec, cancelled: C) -> JobResult
    where
        C: Future<Output = ()> + Send,
    {
        let started_at = Utc::now();
        info!(job_id = %spec.job_id, source = %spec.source_location, "executing job");

        let run = AssertUnwindSafe(self.run_job(spec)).catch_unwind();
        let outcome = tokio::select! {
            caught = run => match caught {
                Ok(outcome) => Some(outcome),
                Err(panic) => Some(Err(ExecutionError::Panicked(panic_message(panic.as_ref())))),
            },
            _ = cancelled => None,
        };

        let ended_at = Utc::now();
        let mut result = JobResult::pending(spec.job_id.clone());
        match outcome {
            Some(Ok((artifacts, scores))) => {
                result.status = JobStatus::Completed;
                result.output_artifacts = artifacts;
                result.quality_scores = scores;
            }
            Some(Err(e)) => {
                warn!(job_id = %spec.job_id, error = %e, "job failed");
                result.status = JobStatus::Error;
                result.error_message = Some(error_message(&e));
            }
            None => {
                info!(job_id = %spec.job_id, "job execution cancelled");
                result.status = JobStatus::Cancelled;
            }
        }
        result.finish(started_at, ended_at);
        result
    }

    async fn run_job(
        &self,
        spec: &JobSpec,
    ) -> Result<(Vec<String>, Option<BTreeMap<String, f64>>), ExecutionError> {
        let request = PipelineRequest::from_spec(spec);
        let outcome = self.pipeline.run(&request).await?;
        if !outcome.success {
            return Err(ExecutionError::Pipeline {
                exit_code: outcome.exit_code,
                diagnostics: outcome.diagnostics,
            });
        }

        let artifacts = if outcome.artifacts.is_empty() {
            enumerate_artifacts(&spec.output_location).await
        } else {
            outcome.artifacts
        };
        debug!(job_id = %spec.job_id, artifacts = artifacts.len(), "pipeline succeeded");

        let scores = match &self.scorer {
            Some(scorer) => Some(score_artifacts(scorer.as_ref(), &spec.job_id, &artifacts).await),
            None => None,
        };
        Ok((artifacts, scores))
    }
}

/// Score every artifact, best effort.
///
/// With a single artifact the scorer's keys are used as-is; with several, each
/// key is prefixed by the artifact's file name (`"final.mp4:sharpness"`).
async fn score_artifacts(
    scorer: &dyn QualityScorer,
    job_id: &str,
    artifacts: &[String],
) -> BTreeMap<String, f64> {
    let mut merged = BTreeMap::new();
    for artifact in artifacts {
        match scorer.score(artifact).await {
            Ok(scores) => {
                for (metric, value) in scores {
                    let key = if artifacts.len() == 1 {
                        metric
                    } else {
                        format!("{}:{metric}", artifact_label(artifact))
                    };
                    merged.insert(key, value);
                }
            }
            Err(e) => warn!(job_id, error = %e, "quality scoring failed"),
        }
    }
    merged
}

fn artifact_label(artifact: &str) -> String {
    PathBuf::from(artifact)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| artifact.to_string())
}

/// Every regular file under `output_location`, sorted. Missing directory = none.
async fn enumerate_artifacts(output_location: &str) -> Vec<String> {
    let root = PathBuf::from(output_location);
    let walked = tokio::task::spawn_blocking(move || {
        let mut files: Vec<String> = walkdir::WalkDir::new(&root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path().to_string_lossy().into_owned())
            .collect();
        files.sort();
        files
    })
    .await;

    walked.unwrap_or_else(|e| {
        warn!(output = %output_location, error = %e, "artifact enumeration failed");
        Vec::new()
    })
}

/// Diagnostic text for a failed job. Never empty.
fn error_message(error: &ExecutionError) -> String {
    match error {
        ExecutionError::Pipeline {
            exit_code,
            diagnostics,
        } if diagnostics.trim().is_empty() => match exit_code {
            Some(code) => format!("pipeline exited with code {code}"),
            None => "pipeline terminated by signal".to_string(),
        },
        ExecutionError::Pipeline { diagnostics, .. } => diagnostics.trim().to_string(),
        other => other.to_string(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
