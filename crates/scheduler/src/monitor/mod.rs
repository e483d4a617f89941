//! Host resource sampling and the admission-control gate.
//!
//! The monitor keeps the most recent [`ResourceSnapshot`] in a `watch` channel.
//! A background sampler task refreshes it on its own interval, so admission
//! checks never wait on a sample and sampling frequency is independent of how
//! often the dispatch loop asks.

mod sampler;
#[cfg(test)]
mod tests;

pub use sampler::{HostSampler, ProcfsSampler, StaticSampler};

use std::sync::Arc;
use std::time::Duration;

use reelq_core::config::SchedulerConfig;
use reelq_core::ResourceSnapshot;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// CPU and memory ceilings a fresh snapshot must stay strictly below.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionThresholds {
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
}

impl AdmissionThresholds {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_cpu_percent: config.max_cpu_percent,
            max_memory_percent: config.max_memory_percent,
        }
    }

    /// Stale snapshots never admit: failed sampling fails closed.
    pub fn admits(&self, snapshot: &ResourceSnapshot) -> bool {
        !snapshot.stale
            && snapshot.cpu_percent < self.max_cpu_percent
            && snapshot.memory_percent < self.max_memory_percent
    }
}

/// Samples host utilization and answers "may a new job start now?".
pub struct ResourceMonitor {
    sampler: Arc<dyn HostSampler>,
    thresholds: AdmissionThresholds,
    sample_timeout: Duration,
    latest: watch::Sender<ResourceSnapshot>,
}

impl ResourceMonitor {
    pub fn new(sampler: Arc<dyn HostSampler>, config: &SchedulerConfig) -> Self {
        let (latest, _) = watch::channel(ResourceSnapshot::unsampled());
        Self {
            sampler,
            thresholds: AdmissionThresholds::from_config(config),
            sample_timeout: config.sample_timeout(),
            latest,
        }
    }

    pub fn thresholds(&self) -> AdmissionThresholds {
        self.thresholds
    }

    /// Take a fresh sample, bounded by the sample timeout.
    ///
    /// On failure the previous snapshot is returned with `stale = true` and
    /// admission stays closed until a later sample succeeds.
    pub async fn sample(&self) -> ResourceSnapshot {
        let outcome = tokio::time::timeout(self.sample_timeout, self.sampler.read()).await;
        match outcome {
            Ok(Ok(reading)) => {
                let snapshot = ResourceSnapshot::fresh(reading);
                debug!(
                    cpu = snapshot.cpu_percent,
                    memory = snapshot.memory_percent,
                    disk = snapshot.disk_percent,
                    "resource sample"
                );
                self.latest.send_replace(snapshot.clone());
                snapshot
            }
            Ok(Err(e)) => {
                warn!(error = %e, "resource sampling failed, admission closed");
                self.mark_stale()
            }
            Err(_) => {
                warn!(timeout = ?self.sample_timeout, "resource sampling timed out, admission closed");
                self.mark_stale()
            }
        }
    }

    fn mark_stale(&self) -> ResourceSnapshot {
        self.latest.send_modify(|s| s.stale = true);
        self.latest.borrow().clone()
    }

    /// Most recent snapshot, without sampling.
    pub fn latest(&self) -> ResourceSnapshot {
        self.latest.borrow().clone()
    }

    /// Receiver notified whenever a new snapshot (or staleness flag) is published.
    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot> {
        self.latest.subscribe()
    }

    /// Hard admission gate over the latest snapshot.
    pub fn can_admit_new_job(&self) -> bool {
        let snapshot = self.latest.borrow();
        let admit = self.thresholds.admits(&snapshot);
        if !admit {
            debug!(
                cpu = snapshot.cpu_percent,
                memory = snapshot.memory_percent,
                stale = snapshot.stale,
                max_cpu = self.thresholds.max_cpu_percent,
                max_memory = self.thresholds.max_memory_percent,
                "admission denied"
            );
        }
        admit
    }

    /// Refresh the snapshot every `interval` (at least 1ms) until `shutdown` flips to true.
    pub async fn run_sampler(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let interval = interval.max(Duration::from_millis(1));
        info!(interval = ?interval, "resource sampler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sample().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("resource sampler stopped");
    }
}
