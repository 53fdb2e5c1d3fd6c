//! Retrying fetch execution through scored egress
//!
//! One client for both page transports: plain HTTP (listing pages, default
//! detail state) and browser-rendered fetches with a simulated UI
//! interaction (tiered pricing states). Every attempt selects an egress
//! from the pool, applies a randomized inter-request delay under a global
//! rate cap, and reports its outcome back to the pool.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::constants::crawling;
use crate::domain::product::PriceUnit;
use crate::infrastructure::egress::{EgressEndpoint, EgressPool};
use crate::infrastructure::renderer::{PageRenderer, RenderRequest, RenderedPage};
use crate::infrastructure::retry::RetryPolicy;

pub type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Error)]
pub enum FetchError {
    /// All retry attempts failed
    #[error("fetch failed after {attempts} attempts: {url}: {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Fetch behaviour knobs, resolved from the application config
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub request_timeout: Duration,
    pub interaction_timeout: Duration,
    /// Randomized politeness delay applied before every fetch attempt
    pub delay_range_ms: (u64, u64),
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            request_timeout: Duration::from_secs(crawling::DEFAULT_REQUEST_TIMEOUT_SECONDS),
            interaction_timeout: Duration::from_secs(
                crawling::DEFAULT_INTERACTION_TIMEOUT_SECONDS,
            ),
            delay_range_ms: (
                crawling::DEFAULT_REQUEST_DELAY_MIN_MS,
                crawling::DEFAULT_REQUEST_DELAY_MAX_MS,
            ),
        }
    }
}

/// Build the shared request-rate limiter from a requests-per-second cap
pub fn build_rate_limiter(max_requests_per_second: u32) -> Result<Arc<DirectRateLimiter>> {
    let quota = Quota::per_second(
        NonZeroU32::new(max_requests_per_second).context("rate limit must be greater than 0")?,
    );
    Ok(Arc::new(RateLimiter::direct(quota)))
}

/// Executes fetches with retry/backoff, reselecting egress each attempt.
/// One instance per worker; the rendering session it drives lives for the
/// worker's batch of fetches.
pub struct FetchClient {
    egress: Arc<EgressPool>,
    renderer: Arc<dyn PageRenderer>,
    policy: RetryPolicy,
    config: FetchConfig,
    limiter: Arc<DirectRateLimiter>,
    // reqwest clients are proxy-bound at build time, so cache one per egress
    http_clients: Mutex<HashMap<String, reqwest::Client>>,
}

impl FetchClient {
    pub fn new(
        egress: Arc<EgressPool>,
        renderer: Arc<dyn PageRenderer>,
        policy: RetryPolicy,
        config: FetchConfig,
        limiter: Arc<DirectRateLimiter>,
    ) -> Self {
        Self {
            egress,
            renderer,
            policy,
            config,
            limiter,
            http_clients: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a page as initially rendered. `interaction` names a UI state
    /// to establish first; `None` reads the page as served. Retries up to
    /// the policy cap with randomized backoff, reselecting egress each
    /// attempt, and records every attempt's outcome on the egress pool.
    pub async fn fetch(
        &self,
        url: &str,
        interaction: Option<PriceUnit>,
    ) -> Result<RenderedPage, FetchError> {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.policy.max_attempts {
            self.limiter.until_ready().await;
            self.politeness_delay().await;

            let egress = self.egress.select().await;
            let started = Instant::now();
            let outcome = match interaction {
                None => self.fetch_static(url, egress.as_ref()).await,
                Some(unit) => self.fetch_rendered(url, egress.as_ref(), unit).await,
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(page) => {
                    if let Some(endpoint) = &egress {
                        self.egress.record(endpoint, true, elapsed).await;
                    }
                    debug!(url, attempt, "fetch succeeded");
                    return Ok(page);
                }
                Err(error) => {
                    if let Some(endpoint) = &egress {
                        self.egress.record(endpoint, false, elapsed).await;
                    }
                    warn!(url, attempt, %error, "fetch attempt failed");
                    last_error = error;
                    if self.policy.should_retry(attempt) {
                        sleep(self.policy.backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    /// Tear down the worker's rendering session
    pub async fn shutdown(&self) {
        self.renderer.shutdown().await;
    }

    async fn politeness_delay(&self) {
        let (min, max) = self.config.delay_range_ms;
        if max == 0 {
            return;
        }
        let millis = if min >= max { min } else { fastrand::u64(min..=max) };
        sleep(Duration::from_millis(millis)).await;
    }

    async fn fetch_static(
        &self,
        url: &str,
        egress: Option<&EgressEndpoint>,
    ) -> Result<RenderedPage, String> {
        let client = self
            .http_client_for(egress)
            .await
            .map_err(|e| e.to_string())?;

        let response = client.get(url).send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP error {status}: {url}"));
        }
        let body = response.text().await.map_err(|e| e.to_string())?;
        if body.is_empty() {
            return Err(format!("empty response from {url}"));
        }
        Ok(RenderedPage {
            url: url.to_string(),
            html: body,
            interaction_applied: false,
        })
    }

    async fn fetch_rendered(
        &self,
        url: &str,
        egress: Option<&EgressEndpoint>,
        unit: PriceUnit,
    ) -> Result<RenderedPage, String> {
        let request = RenderRequest {
            url,
            egress,
            interaction: Some(unit),
            interaction_timeout: self.config.interaction_timeout,
        };
        match self.renderer.render(request).await {
            Ok(outcome) => Ok(RenderedPage {
                url: url.to_string(),
                html: outcome.html,
                interaction_applied: outcome.interaction_applied,
            }),
            Err(error) => Err(error.to_string()),
        }
    }

    async fn http_client_for(
        &self,
        egress: Option<&EgressEndpoint>,
    ) -> Result<reqwest::Client, FetchError> {
        let key = egress
            .map(EgressEndpoint::key)
            .unwrap_or_else(|| "direct".to_string());

        let mut clients = self.http_clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(&self.config.user_agent)
            .timeout(self.config.request_timeout)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(endpoint) = egress {
            let mut proxy = reqwest::Proxy::all(endpoint.proxy_url())
                .map_err(|e| FetchError::ClientBuild(e.to_string()))?;
            if let (Some(user), Some(pass)) = (&endpoint.username, &endpoint.password) {
                proxy = proxy.basic_auth(user, pass);
            }
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::renderer::{RenderError, RenderOutcome};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Renderer that replays a script of outcomes
    struct ScriptedRenderer {
        script: StdMutex<Vec<Result<RenderOutcome, RenderError>>>,
    }

    impl ScriptedRenderer {
        fn new(script: Vec<Result<RenderOutcome, RenderError>>) -> Self {
            Self {
                script: StdMutex::new(script),
            }
        }
    }

    #[async_trait]
    impl PageRenderer for ScriptedRenderer {
        async fn render(
            &self,
            _request: RenderRequest<'_>,
        ) -> Result<RenderOutcome, RenderError> {
            self.script
                .lock()
                .unwrap()
                .remove(0)
        }

        async fn shutdown(&self) {}
    }

    fn fast_client(
        pool: Arc<EgressPool>,
        renderer: Arc<dyn PageRenderer>,
        max_attempts: u32,
    ) -> FetchClient {
        let policy = RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(5),
        );
        let config = FetchConfig {
            delay_range_ms: (0, 0),
            ..FetchConfig::default()
        };
        let limiter = build_rate_limiter(1000).unwrap();
        FetchClient::new(pool, renderer, policy, config, limiter)
    }

    fn outcome(html: &str) -> RenderOutcome {
        RenderOutcome {
            html: html.to_string(),
            interaction_applied: true,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fail_twice_then_succeed_records_on_pool() {
        let endpoint = EgressEndpoint::new("proxy-a.example.net", 8080);
        let pool = Arc::new(EgressPool::new(
            vec![endpoint.clone()],
            Arc::new(crate::infrastructure::egress::HttpLivenessProbe::default()),
        ));
        let renderer = Arc::new(ScriptedRenderer::new(vec![
            Err(RenderError::Navigation("connection reset".to_string())),
            Err(RenderError::UpdateNotObserved {
                marker: "data-active-unit=\"10\"".to_string(),
            }),
            Ok(outcome("<html>ok</html>")),
        ]));
        let client = fast_client(pool.clone(), renderer, 3);

        let page = client
            .fetch("https://example.net/item", Some(PriceUnit::PerTen))
            .await
            .expect("third attempt succeeds");
        assert_eq!(page.html, "<html>ok</html>");

        let stats = pool.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].failure_count, 2);
        assert_eq!(stats[0].success_count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_retries_surface_fetch_failure() {
        let pool = Arc::new(EgressPool::new(
            Vec::new(),
            Arc::new(crate::infrastructure::egress::HttpLivenessProbe::default()),
        ));
        let renderer = Arc::new(ScriptedRenderer::new(vec![
            Err(RenderError::Session("chrome died".to_string())),
            Err(RenderError::Session("chrome died".to_string())),
        ]));
        let client = fast_client(pool, renderer, 2);

        let err = client
            .fetch("https://example.net/item", Some(PriceUnit::Bulk))
            .await
            .unwrap_err();
        match err {
            FetchError::Exhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn benign_interaction_skip_passes_through() {
        let pool = Arc::new(EgressPool::new(
            Vec::new(),
            Arc::new(crate::infrastructure::egress::HttpLivenessProbe::default()),
        ));
        let renderer = Arc::new(ScriptedRenderer::new(vec![Ok(RenderOutcome {
            html: "<html>no tabs here</html>".to_string(),
            interaction_applied: false,
        })]));
        let client = fast_client(pool, renderer, 3);

        let page = client
            .fetch("https://example.net/item", Some(PriceUnit::PerTen))
            .await
            .unwrap();
        assert!(!page.interaction_applied);
    }
}
