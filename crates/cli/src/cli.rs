use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resource-gated media job scheduler.
///
/// Runs batches of render jobs under a worker limit and host CPU/memory
/// ceilings, and inspects the reports they leave behind.
#[derive(Parser, Debug)]
#[command(name = "reelq", about = "Resource-gated media job scheduler")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit every job in a manifest and run until all of them settle
    Run {
        /// Path to the TOML config file (defaults plus REELQ_* env when omitted)
        #[arg(long, env = "REELQ_CONFIG")]
        config: Option<PathBuf>,

        /// Job manifest: a TOML file with one [[job]] table per job
        #[arg(long)]
        jobs: PathBuf,
    },

    /// Summarize the job reports persisted in a reports directory
    Summary {
        #[arg(long, env = "REELQ_REPORTS_DIR", default_value = "reports")]
        reports_dir: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print one job's event log
    Events {
        job_id: String,

        #[arg(long, env = "REELQ_REPORTS_DIR", default_value = "reports")]
        reports_dir: PathBuf,
    },
}
