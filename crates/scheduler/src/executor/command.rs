//! Pipeline and scorer backed by external programs.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use reelq_core::config::{PipelineConfig, ScoringConfig};
use reelq_core::{ExecutionError, ScoringError};
use tokio::process::Command;
use tracing::debug;

use super::{Pipeline, PipelineOutcome, PipelineRequest, QualityScorer};

/// Stdout lines with this prefix name an output artifact.
const ARTIFACT_PREFIX: &str = "artifact:";

/// Runs `<program> <args..> --source <src> --output <out> [--option k=v ..]`.
///
/// Options are passed in key order. The child is killed if the job is
/// cancelled or the scheduler aborts the worker.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    program: String,
    args: Vec<String>,
}

impl CommandPipeline {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `None` when no pipeline program is configured.
    pub fn from_config(config: &PipelineConfig) -> Option<Self> {
        config
            .program
            .as_ref()
            .map(|program| Self::new(program.clone(), config.args.clone()))
    }

    fn command(&self, request: &PipelineRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--source")
            .arg(&request.source_location)
            .arg("--output")
            .arg(&request.output_location);
        for (key, value) in &request.options {
            cmd.arg("--option").arg(format!("{key}={value}"));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Pipeline for CommandPipeline {
    async fn run(&self, request: &PipelineRequest) -> Result<PipelineOutcome, ExecutionError> {
        debug!(job_id = %request.job_id, program = %self.program, "launching pipeline");
        let output = self.command(request).output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let artifacts = parse_artifacts(&stdout);
        let diagnostics = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };

        Ok(PipelineOutcome {
            success: output.status.success(),
            exit_code: output.status.code(),
            artifacts,
            diagnostics,
        })
    }
}

fn parse_artifacts(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(ARTIFACT_PREFIX))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

/// Runs `<program> <args..> <artifact>` and reads a JSON object of
/// `metric -> number` from stdout.
#[derive(Debug, Clone)]
pub struct CommandScorer {
    program: String,
    args: Vec<String>,
}

impl CommandScorer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &ScoringConfig) -> Option<Self> {
        config
            .program
            .as_ref()
            .map(|program| Self::new(program.clone(), config.args.clone()))
    }
}

#[async_trait]
impl QualityScorer for CommandScorer {
    async fn score(&self, artifact: &str) -> Result<BTreeMap<String, f64>, ScoringError> {
        let fail = |reason: String| ScoringError {
            artifact: artifact.to_string(),
            reason,
        };

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(artifact)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| fail(e.to_string()))?;

        if !output.status.success() {
            return Err(fail(format!(
                "scorer exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_scores(&output.stdout).map_err(fail)
    }
}

pub(super) fn parse_scores(stdout: &[u8]) -> Result<BTreeMap<String, f64>, String> {
    let value: serde_json::Value =
        serde_json::from_slice(stdout).map_err(|e| format!("invalid scorer output: {e}"))?;
    let object = value
        .as_object()
        .ok_or_else(|| "scorer output is not a JSON object".to_string())?;

    object
        .iter()
        .map(|(metric, v)| {
            v.as_f64()
                .map(|n| (metric.clone(), n))
                .ok_or_else(|| format!("score {metric} is not a number"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_lines_are_extracted() {
        let out = "progress 50%\nartifact: /renders/a/final.mp4\n  artifact:/renders/a/thumb.jpg\nartifact:\n";
        assert_eq!(
            parse_artifacts(out),
            vec!["/renders/a/final.mp4", "/renders/a/thumb.jpg"]
        );
    }

    #[test]
    fn scores_must_be_numeric_object() {
        let scores = parse_scores(br#"{"sharpness": 0.9, "vmaf": 93}"#).unwrap();
        assert_eq!(scores["sharpness"], 0.9);
        assert_eq!(scores["vmaf"], 93.0);

        assert!(parse_scores(b"[1, 2]").is_err());
        assert!(parse_scores(br#"{"vmaf": "high"}"#).is_err());
        assert!(parse_scores(b"not json").is_err());
    }
}
