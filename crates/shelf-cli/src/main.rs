use anyhow::Result;
use clap::{Parser, Subcommand};
use shelf_sync::JobOutcome;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shelf-cli")]
#[command(about = "Storefront catalog ingestion from the Product Advertising API")]
struct Cli {
    /// Print the run summary as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rebuild the whole product catalog.
    RefreshCatalog,
    /// Refresh the product sets of articles due today.
    RefreshArticles,
    /// Run both jobs on their cron schedules until interrupted (requires SHELF_SCHEDULER_ENABLED).
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::RefreshCatalog => match shelf_sync::run_catalog_once_from_env().await? {
            JobOutcome::Completed(summary) if cli.json => {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            JobOutcome::Completed(summary) => println!(
                "catalog refreshed: run_id={} sweeps={} pages={} unavailable={} products={}",
                summary.run_id,
                summary.sweeps,
                summary.pages_requested,
                summary.pages_unavailable,
                summary.products_stored
            ),
            JobOutcome::Skipped => println!("catalog refresh already running; skipped"),
        },
        Commands::RefreshArticles => match shelf_sync::run_articles_once_from_env().await? {
            JobOutcome::Completed(summary) if cli.json => {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            JobOutcome::Completed(summary) => println!(
                "articles refreshed: run_id={} day={} articles={} refreshed={} products={}",
                summary.run_id,
                summary.day_of_month,
                summary.articles_scanned,
                summary.articles_refreshed,
                summary.products_inserted
            ),
            JobOutcome::Skipped => println!("article refresh already running; skipped"),
        },
        Commands::Schedule => shelf_sync::run_scheduler_from_env().await?,
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
