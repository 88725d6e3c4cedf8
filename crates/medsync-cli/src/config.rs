use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "medsync")]
#[command(
    author,
    version,
    about = "Keeps a local drug and diagnosis catalogue in sync with openFDA and NLM ClinicalTables"
)]
#[command(after_help = "Examples:
  medsync import openfda_ndc
  medsync import clinicaltables_conditions --terms diabetes --limit 200
  medsync import openfda_label --search 'effective_time:[20240101 TO 20241231]'
  medsync schedule
  medsync status")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Settings file (defaults to <config_dir>/medsync/medsync.toml)
    #[arg(short, long, env = "MEDSYNC_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Overrides the scheduler master switch from the settings file
    #[arg(long, env = "MEDSYNC_SCHEDULER_ENABLED")]
    pub scheduler_enabled: Option<bool>,

    /// openFDA API key applied to openFDA jobs without their own
    #[arg(long, env = "OPENFDA_API_KEY", hide_env_values = true)]
    pub openfda_api_key: Option<String>,

    /// Log at DEBUG instead of INFO
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one import cycle for a job and print its statistics
    #[command(after_help = "Examples:
  medsync import openfda_ndc                 # next window from the stored cursor
  medsync import openfda_ndc --skip 0        # ad-hoc window, cursor untouched
  medsync import openfda_label               # enrich drugs still missing labels")]
    Import {
        /// Job name from the settings file
        job: String,
        /// openFDA search expression overriding the job's
        #[arg(long)]
        search: Option<String>,
        /// ClinicalTables terms overriding the job's
        #[arg(long)]
        terms: Option<String>,
        /// Page size (clamped to the upstream maximum)
        #[arg(short, long)]
        limit: Option<u32>,
        /// Explicit window start; bypasses the stored cursor
        #[arg(long)]
        skip: Option<u64>,
    },
    /// Run every configured job once, sequentially
    ImportAll,
    /// Start the cron scheduler and block until Ctrl-C
    Schedule,
    /// Show entity counts, cursors and last-run statistics
    Status,
    /// List configured jobs and their next scheduled runs
    Jobs,
}
