use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use govmatch_matcher::CapabilityMatcher;
use govmatch_storage::Store;
use govmatch_sync::SyncConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "govmatch")]
#[command(about = "Procurement opportunity sync and capability matching")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch notices posted since the last run.
    Sync {
        #[arg(long)]
        max: Option<usize>,
    },
    /// Re-fetch a fixed window, paging through every category code.
    FullSync {
        #[arg(long, default_value_t = 7)]
        days_back: u32,
        #[arg(long, default_value_t = 90)]
        batch_size: usize,
    },
    /// Score opportunities against active capabilities.
    Analyze {
        /// Opportunity ids; the most recent ones when omitted.
        ids: Vec<Uuid>,
    },
    /// Run incremental sync on an interval until Ctrl-C.
    Schedule {
        #[arg(long)]
        interval_minutes: Option<u64>,
    },
    Serve,
    Migrate,
    /// Print the sync cursor and store statistics.
    Status,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let log_json = std::env::var("GOVMATCH_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or(Commands::Sync { max: None }) {
        Commands::Sync { max } => {
            let report = govmatch_sync::run_incremental_sync_from_env(max).await?;
            println!(
                "sync complete: run_id={} new={} window={}..{} total_synced={}",
                report.run_id,
                report.new_opportunities,
                report.from_date.format("%m/%d/%Y"),
                report.to_date.format("%m/%d/%Y"),
                report.total_synced
            );
            if !report.failed_categories.is_empty() {
                println!("failed categories: {}", report.failed_categories.join(", "));
            }
        }
        Commands::FullSync {
            days_back,
            batch_size,
        } => {
            let report = govmatch_sync::run_full_sync_from_env(days_back, batch_size).await?;
            println!(
                "full sync complete: run_id={} upserted={} total_synced={}",
                report.run_id, report.upserted, report.total_synced
            );
            for category in &report.per_category {
                println!(
                    "  {}: {} records in {} pages",
                    category.code, category.records, category.pages
                );
            }
        }
        Commands::Analyze { ids } => {
            let config = SyncConfig::from_env()?;
            let store = govmatch_sync::connect_store(&config).await?;
            let matcher = CapabilityMatcher::new(store);
            let report = matcher.batch_analyze(Some(ids.as_slice())).await?;
            println!(
                "analysis complete: analyzed={} failed={} missing={}",
                report.analyzed,
                report.failed.len(),
                report.missing.len()
            );
            for failure in &report.failed {
                println!("  {}: {}", failure.opportunity_id, failure.error);
            }
        }
        Commands::Schedule { interval_minutes } => {
            govmatch_sync::run_scheduler_from_env(interval_minutes).await?;
        }
        Commands::Serve => {
            govmatch_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            govmatch_sync::connect_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Status => {
            let config = SyncConfig::from_env()?;
            let store = govmatch_sync::connect_store(&config).await?;
            let state = store.load_sync_state().await?;
            let stats = store.statistics(Utc::now()).await?;
            let jobs = store.job_history(5).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "sync_state": state,
                    "statistics": stats,
                    "recent_jobs": jobs,
                }))?
            );
        }
    }

    Ok(())
}
