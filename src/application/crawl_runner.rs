//! Crawl run orchestration
//!
//! Wires the worker pool: listing workers (one per size category, bounded
//! by a semaphore) and detail workers (one per id chunk, each owning one
//! rendering session for its whole batch). Cancellation is checked at
//! loop boundaries only; fetches in flight are never interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::events::{CrawlReport, CrawlStage, ItemFailure};
use crate::domain::product::{ProductStub, SizeCategory};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::egress::EgressPool;
use crate::infrastructure::extractor::DetailExtractor;
use crate::infrastructure::fetch::{DirectRateLimiter, FetchClient, FetchConfig, build_rate_limiter};
use crate::infrastructure::listing::ListingCrawler;
use crate::infrastructure::product_store::ProductStore;
use crate::infrastructure::renderer::{ChromeRenderer, PageRenderer, RendererConfig};
use crate::infrastructure::retry::RetryPolicy;

/// Produces one renderer per worker; each worker holds its session for
/// the lifetime of its batch and releases it on shutdown.
pub type RendererFactory = Arc<dyn Fn() -> Arc<dyn PageRenderer> + Send + Sync>;

pub struct CrawlRunner {
    config: AppConfig,
    store: ProductStore,
    egress: Arc<EgressPool>,
    limiter: Arc<DirectRateLimiter>,
    renderer_factory: RendererFactory,
}

impl CrawlRunner {
    pub fn new(config: AppConfig, store: ProductStore, egress: Arc<EgressPool>) -> Result<Self> {
        let limiter = build_rate_limiter(config.crawler.max_requests_per_second)
            .context("invalid request rate configuration")?;
        let renderer_factory: RendererFactory =
            Arc::new(|| Arc::new(ChromeRenderer::new(RendererConfig::default())));
        Ok(Self {
            config,
            store,
            egress,
            limiter,
            renderer_factory,
        })
    }

    /// Swap the rendering backend; tests script it, production uses Chrome
    pub fn with_renderer_factory(mut self, factory: RendererFactory) -> Self {
        self.renderer_factory = factory;
        self
    }

    fn build_fetch_client(&self) -> Arc<FetchClient> {
        let crawler = &self.config.crawler;
        let policy = RetryPolicy::new(
            crawler.max_retries,
            Duration::from_millis(crawler.retry_base_delay_ms),
            Duration::from_millis(crawler.retry_max_delay_ms),
        );
        let fetch_config = FetchConfig {
            user_agent: crawler.user_agent.clone(),
            request_timeout: Duration::from_secs(crawler.request_timeout_seconds),
            interaction_timeout: Duration::from_secs(crawler.interaction_timeout_seconds),
            delay_range_ms: (crawler.request_delay_min_ms, crawler.request_delay_max_ms),
        };
        Arc::new(FetchClient::new(
            self.egress.clone(),
            (self.renderer_factory)(),
            policy,
            fetch_config,
            self.limiter.clone(),
        ))
    }

    /// Crawl the listing pages of the given categories concurrently.
    /// Within one category pagination is strictly sequential; stubs
    /// persist in page order. Egress exhaustion aborts the whole run.
    pub async fn crawl_listings(
        &self,
        categories: &[SizeCategory],
        cancel: &CancellationToken,
    ) -> Result<CrawlReport> {
        self.egress
            .ensure_available()
            .await
            .context("egress roster unusable, aborting run")?;

        let mut report = CrawlReport::new(Uuid::new_v4().to_string());
        info!(run_id = %report.run_id, categories = categories.len(), "listing crawl starting");

        let semaphore = Arc::new(Semaphore::new(
            self.config.crawler.workers.listing_max_concurrent.max(1),
        ));
        let mut tasks = JoinSet::new();

        for &category in categories {
            let fetch = self.build_fetch_client();
            let crawler = ListingCrawler::new(
                fetch.clone(),
                self.store.clone(),
                &self.config.crawler.site.category_base_url,
            );
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                let summary = crawler.crawl_category(category, &cancel).await;
                fetch.shutdown().await;
                summary
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let summary = joined.context("listing worker panicked")??;
            info!(
                category = %summary.category,
                pages = summary.pages_visited,
                stubs = summary.stubs_stored,
                failures = summary.failures.len(),
                "category finished"
            );
            for _ in 0..summary.stubs_stored {
                report.record_success();
            }
            for failure in summary.failures {
                report.record_failure(failure);
            }
        }

        report.finish();
        info!(run_id = %report.run_id, stored = report.succeeded, failed = report.failures.len(), "listing crawl finished");
        Ok(report)
    }

    /// Extract full records for the given ids (default: every stored id
    /// of the category). The id list is split across detail workers; each
    /// worker processes its chunk sequentially on one rendering session.
    pub async fn crawl_details(
        &self,
        category: SizeCategory,
        ids: Option<Vec<String>>,
        cancel: &CancellationToken,
    ) -> Result<CrawlReport> {
        self.egress
            .ensure_available()
            .await
            .context("egress roster unusable, aborting run")?;

        let ids = match ids {
            Some(ids) => ids,
            None => self.store.list_stub_ids(category).await?,
        };

        let mut report = CrawlReport::new(Uuid::new_v4().to_string());
        info!(run_id = %report.run_id, %category, items = ids.len(), "detail crawl starting");

        let workers = self.config.crawler.workers.detail_workers.max(1);
        let mut tasks = JoinSet::new();

        for chunk in chunk_ids(ids, workers) {
            let fetch = self.build_fetch_client();
            let extractor = DetailExtractor::new(fetch.clone());
            let store = self.store.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let mut succeeded = 0usize;
                let mut failures = Vec::new();

                for id in chunk {
                    if cancel.is_cancelled() {
                        info!("detail worker cancelled between items");
                        break;
                    }

                    let stub = match store.get(&id).await {
                        Ok(Some(record)) => ProductStub {
                            external_id: record.external_id,
                            display_name: record.display_name,
                            size_category: record.size_category,
                            canonical_url: record.canonical_url,
                        },
                        _ => ProductStub {
                            external_id: id.clone(),
                            display_name: id.clone(),
                            size_category: category,
                            canonical_url: ProductStub::detail_url(&id),
                        },
                    };

                    match extractor.extract(&stub).await {
                        Ok(record) => match store.upsert_record(&record).await {
                            Ok(()) => succeeded += 1,
                            Err(error) => {
                                warn!(%id, %error, "record upsert failed");
                                failures.push(ItemFailure::new(&id, CrawlStage::Persist, &error));
                            }
                        },
                        Err(error) => {
                            warn!(%id, %error, "detail extraction failed");
                            failures.push(ItemFailure::new(&id, CrawlStage::Detail, &error));
                        }
                    }
                }

                fetch.shutdown().await;
                (succeeded, failures)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (succeeded, failures) = joined.context("detail worker panicked")?;
            for _ in 0..succeeded {
                report.record_success();
            }
            for failure in failures {
                report.record_failure(failure);
            }
        }

        report.finish();
        info!(run_id = %report.run_id, stored = report.succeeded, failed = report.failures.len(), "detail crawl finished");
        Ok(report)
    }
}

/// Split ids into at most `workers` contiguous chunks, dropping none
fn chunk_ids(ids: Vec<String>, workers: usize) -> Vec<Vec<String>> {
    if ids.is_empty() {
        return Vec::new();
    }
    let chunk_size = ids.len().div_ceil(workers);
    ids.chunks(chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}
