use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobcrawl_sync::{build_scheduler, connect_store, orchestrator_from_config, CrawlConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobcrawl")]
#[command(about = "Career listing crawler and job query API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape cycle and print its summary as JSON.
    Scrape {
        /// Listing pages to load per source (overrides JOBCRAWL_MAX_PAGES).
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Apply pending database migrations.
    Migrate,
    /// Serve the job API and run scheduled scrape cycles.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = CrawlConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape { max_pages: None }) {
        Commands::Scrape { max_pages } => {
            if let Some(max_pages) = max_pages {
                config.max_pages = max_pages;
            }
            let orchestrator = orchestrator_from_config(&config).await?;
            let summary = orchestrator.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            connect_store(&config).await?;
            info!("migrations applied");
        }
        Commands::Serve => serve(config).await?,
    }

    Ok(())
}

async fn serve(config: CrawlConfig) -> Result<()> {
    let orchestrator = Arc::new(orchestrator_from_config(&config).await?);

    if config.scrape_on_start {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if let Err(err) = orchestrator.try_run_cycle().await {
                error!(error = %err, "startup scrape cycle aborted");
            }
        });
    }

    let _scheduler = if config.scheduler_enabled {
        let sched = build_scheduler(Arc::clone(&orchestrator), &config.scrape_cron).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.scrape_cron, "scrape scheduler started");
        Some(sched)
    } else {
        None
    };

    jobcrawl_web::serve(orchestrator.store(), config.web_port).await
}
