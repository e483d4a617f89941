use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reelq_core::{JobSpec, Priority};
use serde::Deserialize;

/// A batch of jobs to submit, parsed from TOML:
///
/// ```toml
/// [[job]]
/// id = "trailer-v2"
/// source = "projects/trailer"
/// output = "renders/trailer"
/// priority = "urgent"
/// deadline = "2026-11-01T18:00:00Z"
/// options = { resolution = "1080p" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "job")]
    pub jobs: Vec<ManifestJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestJob {
    /// Generated when omitted.
    pub id: Option<String>,
    pub name: Option<String>,
    pub source: String,
    pub output: String,
    #[serde(default)]
    pub priority: Priority,
    pub owner: Option<String>,
    /// RFC 3339, quoted.
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Manifest {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid job manifest")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read job manifest: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Job specs in manifest order.
    pub fn into_specs(self) -> Vec<JobSpec> {
        self.jobs.into_iter().map(ManifestJob::into_spec).collect()
    }
}

impl ManifestJob {
    pub fn into_spec(self) -> JobSpec {
        let id = self
            .id
            .unwrap_or_else(|| format!("job-{}", uuid::Uuid::new_v4()));
        let mut spec = JobSpec::new(id, self.source, self.output).with_priority(self.priority);
        if let Some(name) = self.name {
            spec = spec.with_display_name(name);
        }
        if let Some(owner) = self.owner {
            spec = spec.with_owner(owner);
        }
        if let Some(deadline) = self.deadline {
            spec = spec.with_deadline(deadline);
        }
        spec.options = self.options;
        spec
    }
}
