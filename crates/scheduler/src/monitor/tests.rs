use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reelq_core::config::SchedulerConfig;
use reelq_core::{HostReading, SamplingError};

use super::sampler::{parse_cpu_times, parse_df_percent, parse_meminfo_percent, CpuTimes};
use super::*;

fn reading(cpu: f64, memory: f64) -> HostReading {
    HostReading {
        cpu_percent: cpu,
        memory_percent: memory,
        disk_percent: 10.0,
    }
}

fn monitor_with(sampler: Arc<dyn HostSampler>) -> ResourceMonitor {
    ResourceMonitor::new(sampler, &SchedulerConfig::default())
}

// ── Parsing ──────────────────────────────────────────────────────────

#[test]
fn parses_proc_stat_cpu_line() {
    let stat = "cpu  100 5 50 800 45 0 0 0 0 0\ncpu0 50 2 25 400 20 0 0 0 0 0\n";
    let times = parse_cpu_times(stat).unwrap();
    assert_eq!(times.idle, 845);
    assert_eq!(times.total, 1000);
}

#[test]
fn cpu_busy_percent_between_readings() {
    let earlier = CpuTimes { idle: 800, total: 1000 };
    let later = CpuTimes { idle: 850, total: 1200 };
    // 200 jiffies elapsed, 50 idle -> 75% busy
    assert_eq!(later.busy_percent_since(&earlier), 75.0);
    assert_eq!(earlier.busy_percent_since(&earlier), 0.0);
}

#[test]
fn rejects_malformed_proc_stat() {
    assert!(parse_cpu_times("intr 1 2 3").is_err());
    assert!(parse_cpu_times("cpu  1 2").is_err());
    assert!(parse_cpu_times("cpu  a b c d").is_err());
}

#[test]
fn parses_meminfo() {
    let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
    assert_eq!(parse_meminfo_percent(meminfo).unwrap(), 75.0);
    assert!(parse_meminfo_percent("MemTotal: 100 kB\n").is_err());
}

#[test]
fn parses_df_output() {
    let df = "Filesystem     1024-blocks      Used Available Capacity Mounted on\n/dev/nvme0n1p2   479000000 215000000 240000000      48% /\n";
    assert_eq!(parse_df_percent(df).unwrap(), 48.0);
    assert!(parse_df_percent("Filesystem\n").is_err());
}

// ── Admission ────────────────────────────────────────────────────────

#[tokio::test]
async fn unsampled_monitor_denies_admission() {
    let monitor = monitor_with(Arc::new(StaticSampler::idle()));
    assert!(monitor.latest().stale);
    assert!(!monitor.can_admit_new_job());
}

#[tokio::test]
async fn admits_below_both_thresholds() {
    let sampler = Arc::new(StaticSampler::new(50.0, 50.0, 90.0));
    let monitor = monitor_with(sampler);
    let snap = monitor.sample().await;
    assert!(!snap.stale);
    assert!(monitor.can_admit_new_job(), "disk usage is not part of the gate");
}

#[tokio::test]
async fn thresholds_are_strict() {
    let sampler = Arc::new(StaticSampler::new(80.0, 10.0, 0.0));
    let monitor = monitor_with(sampler.clone());
    monitor.sample().await;
    assert!(!monitor.can_admit_new_job(), "cpu == max must deny");

    sampler.set(reading(10.0, 70.0));
    monitor.sample().await;
    assert!(!monitor.can_admit_new_job(), "memory == max must deny");

    sampler.set(reading(79.9, 69.9));
    monitor.sample().await;
    assert!(monitor.can_admit_new_job());
}

#[tokio::test]
async fn zero_cpu_threshold_always_denies() {
    let mut config = SchedulerConfig::default();
    config.max_cpu_percent = 0.0;
    let monitor = ResourceMonitor::new(Arc::new(StaticSampler::idle()), &config);
    monitor.sample().await;
    assert!(!monitor.can_admit_new_job());
}

#[tokio::test]
async fn sampling_failure_keeps_last_values_and_fails_closed() {
    let sampler = Arc::new(StaticSampler::new(20.0, 30.0, 40.0));
    let monitor = monitor_with(sampler.clone());
    monitor.sample().await;
    assert!(monitor.can_admit_new_job());

    sampler.fail();
    let snap = monitor.sample().await;
    assert!(snap.stale);
    assert_eq!(snap.cpu_percent, 20.0);
    assert!(!monitor.can_admit_new_job());

    sampler.set(reading(20.0, 30.0));
    monitor.sample().await;
    assert!(monitor.can_admit_new_job(), "fresh sample reopens admission");
}

struct SlowSampler;

#[async_trait]
impl HostSampler for SlowSampler {
    async fn read(&self) -> Result<HostReading, SamplingError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(reading(0.0, 0.0))
    }
}

#[tokio::test(start_paused = true)]
async fn sample_is_bounded_by_timeout() {
    let monitor = monitor_with(Arc::new(SlowSampler));
    let snap = monitor.sample().await;
    assert!(snap.stale);
    assert!(!monitor.can_admit_new_job());
}

#[tokio::test(start_paused = true)]
async fn background_sampler_publishes_and_stops() {
    let sampler = Arc::new(StaticSampler::new(5.0, 5.0, 5.0));
    let monitor = Arc::new(monitor_with(sampler));
    let mut updates = monitor.subscribe();
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let m = monitor.clone();
    let handle = tokio::spawn(async move {
        m.run_sampler(Duration::from_secs(5), stop_rx).await;
    });

    updates.changed().await.unwrap();
    assert!(monitor.can_admit_new_job());

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("sampler should stop")
        .unwrap();
}
