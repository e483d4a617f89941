use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw host utilization reading, percentages in `0.0..=100.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostReading {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// Point-in-time view of host pressure. Recomputed on demand, never persisted
/// except as part of a job report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub sampled_at: DateTime<Utc>,
    /// Set when the latest sampling attempt failed and these values are carried over.
    #[serde(default)]
    pub stale: bool,
}

impl ResourceSnapshot {
    /// Snapshot from a successful reading taken now.
    pub fn fresh(reading: HostReading) -> Self {
        Self {
            cpu_percent: reading.cpu_percent,
            memory_percent: reading.memory_percent,
            disk_percent: reading.disk_percent,
            sampled_at: Utc::now(),
            stale: false,
        }
    }

    /// Placeholder used before the first successful sample. Always stale.
    pub fn unsampled() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_percent: 0.0,
            sampled_at: Utc::now(),
            stale: true,
        }
    }
}
