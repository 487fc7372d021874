//! `inventory-prober` command line entry point

#![allow(clippy::uninlined_format_args)]

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use inventory_prober_lib::application::{InventoryRun, RunReport, RunStatus};
use inventory_prober_lib::infrastructure::logging::{init_logging_with_config, log_system_info};
use inventory_prober_lib::infrastructure::{ConfigManager, HttpStorefrontFactory};

/// Discover a storefront catalog and probe the stock of every variant
#[derive(Debug, Parser)]
#[command(name = "inventory-prober", version, about)]
struct Cli {
    /// Number of concurrent browser sessions
    #[arg(long)]
    concurrency: Option<NonZeroUsize>,

    /// Run sessions without logging every navigation at info level
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    headless: Option<bool>,

    /// Configuration file (created with defaults when missing)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let config = manager
        .initialize_on_first_run()
        .await?
        .with_overrides(cli.concurrency.map(NonZeroUsize::get), cli.headless);

    init_logging_with_config(&config.logging)?;
    log_system_info();
    info!(config = ?manager.config_path(), "⚙️ Configuration loaded");

    config.validate().context("Invalid configuration")?;

    let factory = HttpStorefrontFactory::new(&config.storefront, config.crawl.headless)?;
    let run = InventoryRun::new(config, Arc::new(factory));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("🛑 Ctrl-C received, finishing in-flight probes");
                on_signal.cancel();
            }
            Err(e) => error!("Could not listen for Ctrl-C: {e}"),
        }
    });

    let report = run.execute(&cancel).await.context("Inventory run failed")?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    let counts = report.summary.counts;
    match report.status {
        RunStatus::Completed => println!("Run {} completed in {:?}", report.run_id, report.summary.duration),
        RunStatus::Interrupted => println!(
            "Run {} interrupted; {} variants still pending, restart to resume",
            report.run_id,
            counts.pending + counts.in_flight
        ),
    }
    println!(
        "  variants: {} done, {} failed ({} oracle calls, {} session restarts)",
        counts.done, counts.failed, report.summary.oracle_calls, report.summary.session_restarts
    );

    if report.status == RunStatus::Completed {
        let categories = &report.categories;
        println!("  out of stock:  {}", categories.out_of_stock.len());
        println!("  back in stock: {}", categories.back_in_stock.len());
        println!("  high stock:    {}", categories.high_stock.len());
        println!("  low stock:     {}", categories.low_stock.len());
    }

    if !report.failures.is_empty() {
        println!("  failures:");
        for failure in &report.failures {
            println!(
                "    {} [{:?}] after {} attempts: {}",
                failure.target.id(),
                failure.kind,
                failure.attempts,
                failure.reason
            );
        }
    }
}
