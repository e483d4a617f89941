mod cli;
mod manifest;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use reelq_core::config::load_dotenv;
use reelq_core::Config;
use reelq_scheduler::{BatchSummary, Reporter, Scheduler};

use crate::cli::{CliArgs, Command};
use crate::manifest::Manifest;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    match args.command {
        Command::Run { config, jobs } => run(config.as_deref(), &jobs).await,
        Command::Summary { reports_dir, json } => summary(reports_dir, json).await,
        Command::Events {
            job_id,
            reports_dir,
        } => events(reports_dir, &job_id).await,
    }
}

async fn run(config_path: Option<&Path>, jobs_path: &Path) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => Config::from_env().context("invalid configuration")?,
    };
    config.log_summary();

    let manifest = Manifest::load(jobs_path)?;
    let scheduler = Scheduler::from_config(&config).context("failed to build scheduler")?;
    if let Some(reporter) = scheduler.reporter() {
        reporter
            .init()
            .await
            .with_context(|| format!("failed to prepare reports dir: {}", reporter.dir().display()))?;
    }

    let mut submitted = 0usize;
    for spec in manifest.into_specs() {
        match scheduler.submit_job(spec).await {
            Ok(_) => submitted += 1,
            Err(e) => warn!(error = %e, "skipping manifest entry"),
        }
    }
    info!(submitted, "jobs submitted");

    scheduler.start()?;
    let settled = tokio::select! {
        settled = scheduler.wait_until_settled() => settled,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping scheduler");
            Ok(())
        }
    };
    let stopped = scheduler.stop().await;

    println!("{}", scheduler.batch_summary());
    settled.context("scheduler did not settle")?;
    stopped.context("scheduler stopped abnormally")?;
    Ok(())
}

async fn summary(reports_dir: PathBuf, json: bool) -> Result<()> {
    let reporter = Reporter::new(reports_dir);
    let reports = reporter
        .load_reports()
        .await
        .with_context(|| format!("failed to read reports in {}", reporter.dir().display()))?;
    let summary = BatchSummary::from_reports(&reports);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{summary}");
    }
    Ok(())
}

async fn events(reports_dir: PathBuf, job_id: &str) -> Result<()> {
    let reporter = Reporter::new(reports_dir);
    let events = reporter
        .read_events(job_id)
        .await
        .with_context(|| format!("failed to read events for {job_id}"))?;

    if events.is_empty() {
        println!("no events recorded for {job_id}");
        return Ok(());
    }
    for event in events {
        println!(
            "{}  {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.message
        );
    }
    Ok(())
}
