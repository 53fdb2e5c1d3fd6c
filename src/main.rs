//! CLI entry point: wires configuration, logging, store and egress pool
//! at the top level and runs crawl commands against the catalog.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use carton_crawler::application::CrawlRunner;
use carton_crawler::domain::events::CrawlReport;
use carton_crawler::domain::product::SizeCategory;
use carton_crawler::infrastructure::config::ConfigManager;
use carton_crawler::infrastructure::egress::{EgressPool, HttpLivenessProbe};
use carton_crawler::infrastructure::logging::init_logging_with_config;
use carton_crawler::infrastructure::product_store::ProductStore;

const USAGE: &str = "\
Usage: carton-crawler <command> [args]

Commands:
  listings [category...]          crawl listing pages (default: all categories)
  details <category> [id...]      extract detail records (default: all stored ids)
  details <category> --pending    only ids never enriched by a detail pass
  all                             listings for all categories, then details
  reset                           drop and recreate the products table";

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        bail!("missing command");
    };

    let manager = ConfigManager::new()?;
    let config = manager.initialize_on_first_run().await?;
    init_logging_with_config(&config.logging)?;

    let database_url = ConfigManager::database_url()?;
    let store = ProductStore::connect(&database_url).await?;
    store.initialize().await?;

    let probe = Arc::new(HttpLivenessProbe::new(
        config.egress.probe_url.clone(),
        Duration::from_secs(config.egress.probe_timeout_seconds),
    ));
    let egress = Arc::new(
        EgressPool::new(config.egress.endpoints.clone(), probe).with_intervals(
            chrono::Duration::minutes(config.egress.probe_interval_minutes),
            chrono::Duration::minutes(config.egress.freshness_window_minutes),
        ),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight fetches then stopping");
                cancel.cancel();
            }
        });
    }

    let runner = CrawlRunner::new(config, store.clone(), egress)?;

    match command {
        "listings" => {
            let categories = parse_categories(&args[1..])?;
            let report = runner.crawl_listings(&categories, &cancel).await?;
            print_report("listings", &report);
        }
        "details" => {
            let Some(category_arg) = args.get(1) else {
                eprintln!("{USAGE}");
                bail!("details requires a category");
            };
            let category: SizeCategory = category_arg
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;

            let rest = &args[2..];
            let ids = if rest.iter().any(|a| a == "--pending") {
                Some(store.list_pending_detail_ids(category).await?)
            } else if rest.is_empty() {
                None
            } else {
                Some(rest.to_vec())
            };

            let report = runner.crawl_details(category, ids, &cancel).await?;
            print_report("details", &report);
        }
        "all" => {
            let categories = SizeCategory::ALL.to_vec();
            let listing_report = runner.crawl_listings(&categories, &cancel).await?;
            print_report("listings", &listing_report);

            for category in categories {
                if cancel.is_cancelled() {
                    break;
                }
                let report = runner.crawl_details(category, None, &cancel).await?;
                print_report(&format!("details {category}"), &report);
            }
        }
        "reset" => {
            store.reset().await.context("database reset failed")?;
            info!("database reset completed");
        }
        other => {
            eprintln!("{USAGE}");
            bail!("unknown command: {other}");
        }
    }

    Ok(())
}

fn parse_categories(args: &[String]) -> Result<Vec<SizeCategory>> {
    if args.is_empty() {
        return Ok(SizeCategory::ALL.to_vec());
    }
    args.iter()
        .map(|a| a.parse::<SizeCategory>().map_err(|e| anyhow::anyhow!(e)))
        .collect()
}

fn print_report(label: &str, report: &CrawlReport) {
    info!(
        run_id = %report.run_id,
        attempted = report.attempted,
        succeeded = report.succeeded,
        failed = report.failures.len(),
        "{label} run finished"
    );
    for failure in &report.failures {
        warn!(id = %failure.id, stage = %failure.stage, reason = %failure.reason, "item failed");
    }
}
