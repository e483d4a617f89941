use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Shortest accepted interval or timeout.
pub const MIN_INTERVAL_SECONDS: f64 = 0.001;
/// Longest accepted interval or timeout (one week).
pub const MAX_INTERVAL_SECONDS: f64 = 604_800.0;

/// Clamped into the accepted range, so unvalidated values never panic.
fn secs(value: f64) -> Duration {
    let value = value.clamp(MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS);
    Duration::try_from_secs_f64(value).unwrap_or(Duration::from_millis(1))
}

// ── Top-level config ──────────────────────────────────────────

/// Full reelq configuration, typically parsed from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
}

impl Config {
    /// Parse config from a TOML string, apply `REELQ_*` env overrides, and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus env overrides, for runs without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(env_opt);
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable numbers are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparseable config override");
                    None
                }
            }
        }

        let s = &mut self.scheduler;
        if let Some(v) = parsed("REELQ_MAX_WORKERS", lookup("REELQ_MAX_WORKERS")) {
            s.max_workers = v;
        }
        if let Some(v) = parsed("REELQ_MAX_CPU_PERCENT", lookup("REELQ_MAX_CPU_PERCENT")) {
            s.max_cpu_percent = v;
        }
        if let Some(v) = parsed("REELQ_MAX_MEMORY_PERCENT", lookup("REELQ_MAX_MEMORY_PERCENT")) {
            s.max_memory_percent = v;
        }
        if let Some(v) = parsed(
            "REELQ_POLL_INTERVAL_SECONDS",
            lookup("REELQ_POLL_INTERVAL_SECONDS"),
        ) {
            s.poll_interval_seconds = v;
        }
        if let Some(v) = parsed(
            "REELQ_RESOURCE_CHECK_INTERVAL_SECONDS",
            lookup("REELQ_RESOURCE_CHECK_INTERVAL_SECONDS"),
        ) {
            s.resource_check_interval_seconds = v;
        }
        if let Some(v) = lookup("REELQ_PIPELINE_PROGRAM") {
            self.pipeline.program = Some(v);
        }
        if let Some(v) = lookup("REELQ_SCORING_PROGRAM") {
            self.scoring.program = Some(v);
        }
        if let Some(v) = lookup("REELQ_REPORTS_DIR") {
            self.reports.dir = PathBuf::from(v);
        }
    }

    // ── Validation ──────────────────────────────────────────────

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        let s = &self.scheduler;
        tracing::info!("Config loaded:");
        tracing::info!(
            "  scheduler:  max_workers={}, max_cpu={}%, max_memory={}%",
            s.max_workers,
            s.max_cpu_percent,
            s.max_memory_percent
        );
        tracing::info!(
            "  intervals:  poll={}s, resource_check={}s, backoff={}s",
            s.poll_interval_seconds,
            s.resource_check_interval_seconds,
            s.admission_backoff_seconds
        );
        tracing::info!(
            "  pipeline:   {}",
            self.pipeline.program.as_deref().unwrap_or("(none)")
        );
        tracing::info!(
            "  scoring:    {}",
            self.scoring.program.as_deref().unwrap_or("(disabled)")
        );
        tracing::info!("  reports:    dir={}", self.reports.dir.display());
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Dispatch loop, worker pool, and admission-control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on simultaneously processing jobs.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Admission requires CPU strictly below this percentage.
    #[serde(default = "default_max_cpu")]
    pub max_cpu_percent: f64,
    /// Admission requires memory strictly below this percentage.
    #[serde(default = "default_max_memory")]
    pub max_memory_percent: f64,
    /// Fallback wake-up interval when the loop is idle.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    /// How often the background sampler refreshes the resource snapshot.
    #[serde(default = "default_resource_check_interval")]
    pub resource_check_interval_seconds: f64,
    /// Wait after an admission denial before retrying.
    #[serde(default = "default_admission_backoff")]
    pub admission_backoff_seconds: f64,
    /// Upper bound for a single host sample.
    #[serde(default = "default_sample_timeout")]
    pub sample_timeout_seconds: f64,
    /// Graceful drain budget before in-flight jobs are forcibly terminated.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: f64,
    /// Filesystem whose usage is reported as `disk_percent`.
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,
}

fn default_max_workers() -> usize { 4 }
fn default_max_cpu() -> f64 { 80.0 }
fn default_max_memory() -> f64 { 70.0 }
fn default_poll_interval() -> f64 { 2.0 }
fn default_resource_check_interval() -> f64 { 5.0 }
fn default_admission_backoff() -> f64 { 5.0 }
fn default_sample_timeout() -> f64 { 1.0 }
fn default_shutdown_timeout() -> f64 { 30.0 }
fn default_disk_path() -> PathBuf { PathBuf::from("/") }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_cpu_percent: default_max_cpu(),
            max_memory_percent: default_max_memory(),
            poll_interval_seconds: default_poll_interval(),
            resource_check_interval_seconds: default_resource_check_interval(),
            admission_backoff_seconds: default_admission_backoff(),
            sample_timeout_seconds: default_sample_timeout(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            disk_path: default_disk_path(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_seconds)
    }

    pub fn resource_check_interval(&self) -> Duration {
        secs(self.resource_check_interval_seconds)
    }

    pub fn admission_backoff(&self) -> Duration {
        secs(self.admission_backoff_seconds)
    }

    pub fn sample_timeout(&self) -> Duration {
        secs(self.sample_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        secs(self.shutdown_timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        for (name, value) in [
            ("max_cpu_percent", self.max_cpu_percent),
            ("max_memory_percent", self.max_memory_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within 0-100, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("poll_interval_seconds", self.poll_interval_seconds),
            ("resource_check_interval_seconds", self.resource_check_interval_seconds),
            ("admission_backoff_seconds", self.admission_backoff_seconds),
            ("sample_timeout_seconds", self.sample_timeout_seconds),
            ("shutdown_timeout_seconds", self.shutdown_timeout_seconds),
        ] {
            if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between {MIN_INTERVAL_SECONDS}s and {MAX_INTERVAL_SECONDS}s, got {value}"
                )));
            }
        }
        Ok(())
    }
}

// ── External collaborators ────────────────────────────────────

/// External processing pipeline command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Optional quality-scoring command. Absent program disables scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

// ── Reports ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    #[serde(default = "default_reports_dir")]
    pub dir: PathBuf,
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: default_reports_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_cpu_percent, 80.0);
        assert_eq!(config.max_memory_percent, 70.0);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.resource_check_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let toml_str = r#"
            [scheduler]
            max_workers = 2
            max_cpu_percent = 65.5

            [pipeline]
            program = "render-project"
            args = ["--fast"]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.max_workers, 2);
        assert_eq!(config.scheduler.max_cpu_percent, 65.5);
        assert_eq!(config.scheduler.max_memory_percent, 70.0);
        assert_eq!(config.pipeline.program.as_deref(), Some("render-project"));
        assert_eq!(config.pipeline.args, vec!["--fast"]);
        assert!(config.scoring.program.is_none());
        assert_eq!(config.reports.dir, PathBuf::from("reports"));
    }

    #[test]
    fn empty_toml_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.max_workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reelq.toml");
        std::fs::write(&path, "[scheduler]\nmax_workers = 0\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "got {err}");
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = [
            ("REELQ_MAX_WORKERS", "8"),
            ("REELQ_MAX_CPU_PERCENT", "not-a-number"),
            ("REELQ_PIPELINE_PROGRAM", "/usr/bin/render"),
            ("REELQ_REPORTS_DIR", "/var/lib/reelq"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.scheduler.max_workers, 8);
        assert_eq!(config.scheduler.max_cpu_percent, 80.0);
        assert_eq!(config.pipeline.program.as_deref(), Some("/usr/bin/render"));
        assert_eq!(config.reports.dir, PathBuf::from("/var/lib/reelq"));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = SchedulerConfig::default();
        config.max_memory_percent = 120.0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.poll_interval_seconds = 0.0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.max_cpu_percent = 0.0;
        assert!(config.validate().is_ok(), "0% is a valid (always-deny) threshold");
    }

    #[test]
    fn validate_rejects_unrepresentable_intervals() {
        for raw in ["inf", "nan", "1e-12", "1e300", "-1.0"] {
            let toml_str = format!("[scheduler]\npoll_interval_seconds = {raw}\n");
            let err = Config::from_toml(&toml_str).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{raw}: got {err}");
        }

        let mut config = SchedulerConfig::default();
        config.shutdown_timeout_seconds = 0.001;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn interval_accessors_never_panic_or_return_zero() {
        let config = SchedulerConfig {
            poll_interval_seconds: f64::INFINITY,
            resource_check_interval_seconds: 1e-12,
            admission_backoff_seconds: f64::NAN,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(604_800));
        assert!(config.resource_check_interval() >= Duration::from_micros(999));
        assert!(config.admission_backoff() > Duration::ZERO);
    }
}
