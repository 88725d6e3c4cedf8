use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use medsync_cli::{Command, Config};
use medsync_client::RetryingFetcher;
use medsync_core::traits::StateStore;
use medsync_core::{
    BatchRunSummary, ImportParams, ImportPipeline, JobKind, JobRunResult, RunStats, Scheduler,
    Settings,
};
use medsync_db::{run_migrations, PgEntityStore, PgStateStore};

type AppScheduler = Scheduler<RetryingFetcher, PgEntityStore, PgStateStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Parse command line arguments
    let config = Config::parse();

    // Setup logging (stderr to keep stdout clean for JSON output)
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    // Static settings, then CLI/env overrides
    let mut settings =
        Settings::load(config.config.as_deref()).context("Failed to load settings")?;
    if let Some(api_key) = config.openfda_api_key.as_deref().filter(|k| !k.is_empty()) {
        settings.apply_openfda_api_key(api_key);
    }
    if let Some(enabled) = config.scheduler_enabled {
        settings.scheduler.enabled = enabled;
    }

    // Database connection
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to apply database migrations")?;

    // Initialize services
    let fetcher = RetryingFetcher::new(&settings.http, settings.rate_limit.clone())
        .context("Failed to build HTTP client")?;
    let entities = PgEntityStore::new(pool.clone());
    let state = PgStateStore::new(pool);
    let pipeline = ImportPipeline::new(fetcher, entities.clone(), state.clone(), settings.jobs);
    let scheduler = Scheduler::new(Arc::new(pipeline), settings.scheduler.enabled)
        .context("Invalid job schedule")?;

    // Execute command
    match config.command {
        Command::Import {
            job,
            search,
            terms,
            limit,
            skip,
        } => {
            let params = ImportParams {
                search,
                terms,
                limit,
                skip,
            };
            import(&scheduler, &job, &params).await?;
        }
        Command::ImportAll => {
            import_all(&scheduler).await?;
        }
        Command::Schedule => {
            schedule(&scheduler).await;
        }
        Command::Status => {
            show_status(&entities, &state).await?;
        }
        Command::Jobs => {
            list_jobs(&scheduler);
        }
    }

    Ok(())
}

/// Run one job and print its statistics as JSON
async fn import(scheduler: &AppScheduler, job: &str, params: &ImportParams) -> anyhow::Result<()> {
    let stats = scheduler
        .trigger(job, params)
        .await
        .with_context(|| format!("Import of {} failed", job))?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Run every configured job once, in order
async fn import_all(scheduler: &AppScheduler) -> anyhow::Result<()> {
    let mut summary = BatchRunSummary::new();

    for job in scheduler.pipeline().jobs() {
        if job.kind == JobKind::ClinicaltablesConditions && job.terms.is_none() {
            warn!(job = %job.name, "No search terms configured, skipping");
            continue;
        }

        match scheduler.trigger(&job.name, &ImportParams::default()).await {
            Ok(stats) => summary.add(JobRunResult::success(job.name.clone(), stats)),
            Err(e) => {
                error!(job = %job.name, error = %e, "Job failed");
                summary.add(JobRunResult::failure(job.name.clone(), e.user_message()));
            }
        }
    }

    info!(
        "Import complete: {} successful, {} failed, {} records received, {} written",
        summary.successful_count(),
        summary.failed_count(),
        summary.total_received(),
        summary.total_written()
    );

    println!();
    for result in &summary.results {
        match (&result.stats, &result.error) {
            (Some(stats), _) => println!(
                "  ✓ {:<28} received {:>5}  imported {:>5}  updated {:>5}  skipped {:>5}  errors {:>3}",
                result.job, stats.received, stats.imported, stats.updated, stats.skipped, stats.error_count
            ),
            (None, Some(error)) => println!("  ✗ {:<28} {}", result.job, error),
            (None, None) => {}
        }
    }
    println!();

    if summary.failed_count() > 0 && summary.successful_count() == 0 {
        anyhow::bail!("All jobs failed");
    }
    Ok(())
}

/// Run the scheduler until Ctrl-C
async fn schedule(scheduler: &AppScheduler) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    if !scheduler.is_enabled() {
        scheduler.run(shutdown_rx).await;
        info!("Set MEDSYNC_SCHEDULER_ENABLED=true or [scheduler] enabled = true to run jobs on a timer");
        return;
    }

    let signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl-C; stopping scheduler");
        }
        info!("Shutdown requested");
        let _ = shutdown_tx.send(());
    };

    tokio::join!(scheduler.run(shutdown_rx), signal);
}

/// Show entity counts, cursors and last-run statistics
async fn show_status(entities: &PgEntityStore, state: &PgStateStore) -> anyhow::Result<()> {
    let counts = entities.counts().await?;
    let pairs = state.list().await?;

    println!("\n📊 Catalogue\n");
    println!("  Drugs:                 {}", counts.drugs);
    println!("  Ingredients:           {}", counts.ingredients);
    println!("  Diagnoses:             {}", counts.diagnoses);
    println!("  Synonyms:              {}", counts.synonyms);

    let (stats, cursors): (Vec<_>, Vec<_>) =
        pairs.iter().partition(|(key, _)| key.starts_with("stats:"));

    println!("\n📍 Cursors\n");
    if cursors.is_empty() {
        println!("  (none)");
    }
    for (key, value) in cursors {
        println!("  {:<40} {}", key, value);
    }

    println!("\n🕒 Last runs\n");
    if stats.is_empty() {
        println!("  (none)");
    }
    for (key, value) in stats {
        match serde_json::from_str::<RunStats>(value) {
            Ok(run) => println!(
                "  {:<28} {}  received {}  imported {}  updated {}  skipped {}  errors {}",
                run.job,
                run.finished_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "unfinished".to_string()),
                run.received,
                run.imported,
                run.updated,
                run.skipped,
                run.error_count
            ),
            Err(e) => println!("  {:<28} unreadable ({})", key, e),
        }
    }
    println!();

    Ok(())
}

/// List configured jobs with their next fire times
fn list_jobs(scheduler: &AppScheduler) {
    let upcoming = scheduler.upcoming(Utc::now());

    println!();
    for job in scheduler.pipeline().jobs() {
        let next = upcoming
            .iter()
            .find(|(name, _)| name == &job.name)
            .and_then(|(_, next)| *next)
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "manual".to_string());
        println!(
            "  {:<28} {:<26} {:<14} next: {}",
            job.name,
            job.kind.as_str(),
            job.cron.as_deref().unwrap_or("-"),
            next
        );
    }
    if !scheduler.is_enabled() {
        println!("\n  (scheduler disabled)");
    }
    println!();
}
