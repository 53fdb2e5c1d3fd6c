//! Browser-rendered page fetching
//!
//! The renderer seam behind the fetch client: one interactive rendering
//! session (headless Chrome) is held per worker for the lifetime of a
//! batch of fetches, launched lazily and torn down on explicit shutdown.
//! An interaction names a pricing-unit tab to activate before the content
//! is read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::constants::site;
use crate::domain::product::PriceUnit;
use crate::infrastructure::egress::EgressEndpoint;

/// A page as read after rendering (and optionally after an interaction)
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    /// False when the requested interaction's UI element was absent from
    /// the page (benign skip) or no interaction was requested
    pub interaction_applied: bool,
}

/// Raw render result before the fetch client wraps it
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub html: String,
    pub interaction_applied: bool,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("browser session error: {0}")]
    Session(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("UI element not ready within timeout: {selector}")]
    ElementNotReady { selector: String },

    #[error("content update not observed after interaction: {marker}")]
    UpdateNotObserved { marker: String },

    #[error("rendered page was empty: {url}")]
    EmptyContent { url: String },
}

/// What one rendered fetch needs to know
pub struct RenderRequest<'a> {
    pub url: &'a str,
    pub egress: Option<&'a EgressEndpoint>,
    pub interaction: Option<PriceUnit>,
    pub interaction_timeout: Duration,
}

/// Seam between the fetch client and the actual rendering machinery.
/// Tests script this; production uses [`ChromeRenderer`].
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, request: RenderRequest<'_>) -> Result<RenderOutcome, RenderError>;

    /// Tear the session down. Workers call this once at shutdown.
    async fn shutdown(&self);
}

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub navigation_timeout: Duration,
    /// Poll interval while waiting for post-interaction content updates
    pub update_poll_interval: Duration,
}

impl Default for RendererConfig {
    fn default() -> Self {
        use crate::domain::constants::crawling;
        Self {
            navigation_timeout: Duration::from_secs(crawling::DEFAULT_REQUEST_TIMEOUT_SECONDS),
            update_poll_interval: Duration::from_millis(250),
        }
    }
}

struct ChromeSession {
    // Browser owns the process; dropping it closes Chrome
    _browser: Browser,
    tab: Arc<Tab>,
    egress_key: Option<String>,
}

/// One headless-Chrome session, lazily launched, reused across fetches and
/// relaunched only when the egress proxy changes.
pub struct ChromeRenderer {
    session: Mutex<Option<ChromeSession>>,
    config: RendererConfig,
}

impl ChromeRenderer {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            session: Mutex::new(None),
            config,
        }
    }

    fn launch(egress: Option<&EgressEndpoint>) -> Result<ChromeSession, RenderError> {
        let proxy_url = egress.map(|e| e.proxy_url());
        info!(proxy = ?proxy_url, "launching headless browser session");

        let options = LaunchOptions {
            headless: true,
            sandbox: false,
            idle_browser_timeout: Duration::from_secs(600),
            proxy_server: proxy_url.as_deref(),
            ..Default::default()
        };
        let browser =
            Browser::new(options).map_err(|e| RenderError::Session(e.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|e| RenderError::Session(e.to_string()))?;

        Ok(ChromeSession {
            _browser: browser,
            tab,
            egress_key: egress.map(EgressEndpoint::key),
        })
    }

    /// Navigate, optionally perform the interaction, and read the content.
    /// Runs blocking CDP calls, so callers wrap it in `block_in_place`.
    fn render_blocking(
        session: &ChromeSession,
        request: &RenderRequest<'_>,
        config: &RendererConfig,
    ) -> Result<RenderOutcome, RenderError> {
        let tab = &session.tab;
        tab.set_default_timeout(config.navigation_timeout);
        tab.navigate_to(request.url)
            .map_err(|e| RenderError::Navigation(e.to_string()))?;
        tab.wait_until_navigated()
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        let Some(unit) = request.interaction else {
            let html = Self::read_content(tab, request.url)?;
            return Ok(RenderOutcome {
                html,
                interaction_applied: false,
            });
        };

        let selector = unit.tab_selector();
        match tab.wait_for_element_with_custom_timeout(selector, request.interaction_timeout) {
            Ok(element) => {
                element
                    .click()
                    .map_err(|_| RenderError::ElementNotReady {
                        selector: selector.to_string(),
                    })?;
                Self::wait_for_marker(tab, request, unit, config)?;
                let html = Self::read_content(tab, request.url)?;
                Ok(RenderOutcome {
                    html,
                    interaction_applied: true,
                })
            }
            Err(_) => {
                // Tab never appeared. If the page carries no pricing-tab
                // container at all, the state simply does not exist here
                // and the page is returned as rendered.
                let html = Self::read_content(tab, request.url)?;
                if html.contains(site::PRICE_TAB_CONTAINER_HINT) {
                    Err(RenderError::ElementNotReady {
                        selector: selector.to_string(),
                    })
                } else {
                    debug!(url = request.url, unit = %unit, "pricing tab absent, benign skip");
                    Ok(RenderOutcome {
                        html,
                        interaction_applied: false,
                    })
                }
            }
        }
    }

    /// Poll the rendered output until the tier's content marker shows up
    fn wait_for_marker(
        tab: &Arc<Tab>,
        request: &RenderRequest<'_>,
        unit: PriceUnit,
        config: &RendererConfig,
    ) -> Result<(), RenderError> {
        let marker = unit.content_marker();
        let deadline = Instant::now() + request.interaction_timeout;
        loop {
            let content = Self::read_content(tab, request.url)?;
            if content.contains(marker) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RenderError::UpdateNotObserved {
                    marker: marker.to_string(),
                });
            }
            std::thread::sleep(config.update_poll_interval);
        }
    }

    fn read_content(tab: &Arc<Tab>, url: &str) -> Result<String, RenderError> {
        let html = tab
            .get_content()
            .map_err(|e| RenderError::Navigation(e.to_string()))?;
        if html.is_empty() {
            return Err(RenderError::EmptyContent {
                url: url.to_string(),
            });
        }
        Ok(html)
    }
}

#[async_trait]
impl PageRenderer for ChromeRenderer {
    async fn render(&self, request: RenderRequest<'_>) -> Result<RenderOutcome, RenderError> {
        let mut guard = self.session.lock().await;

        let wanted_key = request.egress.map(EgressEndpoint::key);
        let needs_launch = match guard.as_ref() {
            Some(session) => session.egress_key != wanted_key,
            None => true,
        };
        if needs_launch {
            if guard.take().is_some() {
                debug!("recycling browser session for new egress");
            }
            let session =
                tokio::task::block_in_place(|| Self::launch(request.egress))?;
            *guard = Some(session);
        }

        let session = guard.as_ref().expect("session just ensured");
        let outcome = tokio::task::block_in_place(|| {
            Self::render_blocking(session, &request, &self.config)
        });

        if let Err(error) = &outcome {
            warn!(url = request.url, %error, "render failed, dropping session");
            // A wedged tab poisons every later fetch; start clean next time
            *guard = None;
        }
        outcome
    }

    async fn shutdown(&self) {
        let mut guard = self.session.lock().await;
        if guard.take().is_some() {
            info!("browser session torn down");
        }
    }
}
