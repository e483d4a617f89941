//! Host metric sources for the [`ResourceMonitor`](super::ResourceMonitor).

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reelq_core::{HostReading, SamplingError};

/// Reads current host utilization.
#[async_trait]
pub trait HostSampler: Send + Sync {
    async fn read(&self) -> Result<HostReading, SamplingError>;
}

// ── Procfs ───────────────────────────────────────────────────────────

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Busy percentage between two readings. Zero when no time elapsed.
    pub fn busy_percent_since(&self, earlier: &CpuTimes) -> f64 {
        let total = self.total.saturating_sub(earlier.total);
        let idle = self.idle.saturating_sub(earlier.idle);
        if total == 0 {
            return 0.0;
        }
        (1.0 - idle as f64 / total as f64) * 100.0
    }
}

/// Parse the `cpu ` summary line of `/proc/stat`.
///
/// Format: `cpu  user nice system idle iowait irq softirq steal ...`.
/// Idle time is `idle + iowait`.
pub(crate) fn parse_cpu_times(stat: &str) -> Result<CpuTimes, SamplingError> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| SamplingError::Parse("/proc/stat: no cpu line".into()))?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|e| SamplingError::Parse(format!("/proc/stat: {e}")))?;

    if fields.len() < 4 {
        return Err(SamplingError::Parse("/proc/stat: short cpu line".into()));
    }

    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().sum();
    Ok(CpuTimes { idle, total })
}

/// Memory in use as a percentage, from `MemTotal` and `MemAvailable` (kB).
pub(crate) fn parse_meminfo_percent(meminfo: &str) -> Result<f64, SamplingError> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
    };

    let total = field("MemTotal:")
        .ok_or_else(|| SamplingError::Parse("/proc/meminfo: MemTotal".into()))?;
    let available = field("MemAvailable:")
        .ok_or_else(|| SamplingError::Parse("/proc/meminfo: MemAvailable".into()))?;

    if total == 0 {
        return Err(SamplingError::Parse("/proc/meminfo: MemTotal is zero".into()));
    }
    Ok((1.0 - available.min(total) as f64 / total as f64) * 100.0)
}

/// Use% column from POSIX `df -P` output.
pub(crate) fn parse_df_percent(df: &str) -> Result<f64, SamplingError> {
    df.lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().nth(4))
        .and_then(|pct| pct.trim_end_matches('%').parse::<f64>().ok())
        .ok_or_else(|| SamplingError::Parse("df: missing capacity column".into()))
}

/// Samples the local host through `/proc` and `df`.
///
/// CPU utilization is the delta between consecutive reads. The very first read
/// takes two `/proc/stat` readings `cpu_window` apart.
pub struct ProcfsSampler {
    disk_path: PathBuf,
    cpu_window: Duration,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl ProcfsSampler {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
            cpu_window: Duration::from_millis(250),
            last_cpu: Mutex::new(None),
        }
    }

    /// Window used for the initial CPU measurement (default 250ms).
    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }

    async fn read_file(path: &str) -> Result<String, SamplingError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|error| SamplingError::Read {
                source_name: path.to_string(),
                error,
            })
    }

    async fn cpu_percent(&self) -> Result<f64, SamplingError> {
        let previous = *self.last_cpu.lock().unwrap_or_else(PoisonError::into_inner);
        let earlier = match previous {
            Some(times) => times,
            None => {
                let first = parse_cpu_times(&Self::read_file("/proc/stat").await?)?;
                tokio::time::sleep(self.cpu_window).await;
                first
            }
        };
        let now = parse_cpu_times(&Self::read_file("/proc/stat").await?)?;
        *self.last_cpu.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        Ok(now.busy_percent_since(&earlier))
    }

    async fn memory_percent(&self) -> Result<f64, SamplingError> {
        parse_meminfo_percent(&Self::read_file("/proc/meminfo").await?)
    }

    async fn disk_percent(&self) -> Result<f64, SamplingError> {
        let output = tokio::process::Command::new("df")
            .arg("-P")
            .arg(&self.disk_path)
            .output()
            .await
            .map_err(|error| SamplingError::Read {
                source_name: "df".into(),
                error,
            })?;
        if !output.status.success() {
            return Err(SamplingError::Parse(format!(
                "df exited with {:?}",
                output.status.code()
            )));
        }
        parse_df_percent(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl HostSampler for ProcfsSampler {
    #[cfg(target_os = "linux")]
    async fn read(&self) -> Result<HostReading, SamplingError> {
        let cpu_percent = self.cpu_percent().await?;
        let memory_percent = self.memory_percent().await?;
        let disk_percent = self.disk_percent().await?;
        Ok(HostReading {
            cpu_percent,
            memory_percent,
            disk_percent,
        })
    }

    #[cfg(not(target_os = "linux"))]
    async fn read(&self) -> Result<HostReading, SamplingError> {
        Err(SamplingError::Unsupported)
    }
}

// ── Static ───────────────────────────────────────────────────────────

/// Sampler returning a fixed, externally adjustable reading.
///
/// Used to run without host gating and to script admission in tests.
pub struct StaticSampler {
    reading: Mutex<Option<HostReading>>,
}

impl StaticSampler {
    pub fn new(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self {
            reading: Mutex::new(Some(HostReading {
                cpu_percent,
                memory_percent,
                disk_percent,
            })),
        }
    }

    /// An idle host: every reading is 0%.
    pub fn idle() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn set(&self, reading: HostReading) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) = Some(reading);
    }

    /// Make subsequent reads fail until [`set`](Self::set) is called again.
    pub fn fail(&self) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl HostSampler for StaticSampler {
    async fn read(&self) -> Result<HostReading, SamplingError> {
        let reading = *self.reading.lock().unwrap_or_else(PoisonError::into_inner);
        reading.ok_or_else(|| SamplingError::Parse("static sampler set to fail".into()))
    }
}
