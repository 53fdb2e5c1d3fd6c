//! Egress (proxy) pool with health-scored selection
//!
//! Tracks a fixed roster of proxy endpoints and their health statistics,
//! and produces a best-available egress choice per request. Endpoints are
//! never removed — a failing proxy is only down-weighted and may recover.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::constants::egress as defaults;

#[derive(Debug, Error)]
pub enum EgressError {
    /// Non-empty roster where no endpoint passes liveness testing
    #[error("no egress endpoint passed liveness testing ({roster_size} configured)")]
    Exhausted { roster_size: usize },
}

/// A proxy endpoint as configured; health state lives in the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl EgressEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Stable identity used for health bookkeeping
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `http://host:port` form accepted by reqwest and Chrome
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Health statistics for one endpoint, owned exclusively by the pool
#[derive(Debug, Clone, Default)]
struct EndpointHealth {
    success_count: u64,
    failure_count: u64,
    cumulative_latency: Duration,
    last_tested_at: Option<DateTime<Utc>>,
    last_verdict: bool,
}

impl EndpointHealth {
    fn average_latency(&self) -> Duration {
        let attempts = self.success_count + self.failure_count;
        if attempts == 0 {
            Duration::ZERO
        } else {
            self.cumulative_latency / attempts as u32
        }
    }

    /// Lexicographic score: reliability dominates, then fewer failures,
    /// then lower average latency. Monotonically non-decreasing in
    /// successes, non-increasing in failures and latency.
    fn score(&self) -> (u64, i64, i128) {
        (
            self.success_count,
            -(self.failure_count as i64),
            -(self.average_latency().as_micros() as i128),
        )
    }
}

/// Read-only stats snapshot for reporting and tests
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub key: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_latency_ms: u64,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_verdict: bool,
}

struct EndpointSlot {
    endpoint: EgressEndpoint,
    health: EndpointHealth,
}

/// Lightweight liveness check, injectable so tests stay off the network
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Probe through the endpoint; returns observed latency on success
    async fn probe(&self, endpoint: &EgressEndpoint) -> Result<Duration>;
}

/// Probes by fetching a small page through the proxy
pub struct HttpLivenessProbe {
    probe_url: String,
    timeout: Duration,
}

impl HttpLivenessProbe {
    pub fn new(probe_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            probe_url: probe_url.into(),
            timeout,
        }
    }
}

impl Default for HttpLivenessProbe {
    fn default() -> Self {
        Self::new(
            defaults::DEFAULT_PROBE_URL,
            Duration::from_secs(defaults::DEFAULT_PROBE_TIMEOUT_SECONDS),
        )
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn probe(&self, endpoint: &EgressEndpoint) -> Result<Duration> {
        let mut proxy = reqwest::Proxy::all(endpoint.proxy_url())?;
        if let (Some(user), Some(pass)) = (&endpoint.username, &endpoint.password) {
            proxy = proxy.basic_auth(user, pass);
        }
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()?;

        let started = std::time::Instant::now();
        let response = client.get(&self.probe_url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("probe returned HTTP {}", response.status());
        }
        Ok(started.elapsed())
    }
}

/// Pool over the configured roster. All health mutation happens under one
/// mutex; selection falls back to round-robin until health data exists.
pub struct EgressPool {
    slots: Mutex<Vec<EndpointSlot>>,
    probe: Arc<dyn LivenessProbe>,
    probe_interval: chrono::Duration,
    freshness_window: chrono::Duration,
    round_robin: AtomicUsize,
}

impl EgressPool {
    pub fn new(endpoints: Vec<EgressEndpoint>, probe: Arc<dyn LivenessProbe>) -> Self {
        let slots = endpoints
            .into_iter()
            .map(|endpoint| EndpointSlot {
                endpoint,
                health: EndpointHealth::default(),
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            probe,
            probe_interval: chrono::Duration::minutes(defaults::DEFAULT_PROBE_INTERVAL_MINUTES),
            freshness_window: chrono::Duration::minutes(defaults::DEFAULT_FRESHNESS_WINDOW_MINUTES),
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn with_intervals(
        mut self,
        probe_interval: chrono::Duration,
        freshness_window: chrono::Duration,
    ) -> Self {
        self.probe_interval = probe_interval;
        self.freshness_window = freshness_window;
        self
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    /// Best-available egress for the next request. Returns the endpoint
    /// with the highest score among endpoints tested within the freshness
    /// window; when none have been tested, or every tested one has zero
    /// success, falls back to round-robin over the full roster. `None`
    /// only on an empty roster (direct connection).
    pub async fn select(&self) -> Option<EgressEndpoint> {
        let slots = self.slots.lock().await;
        if slots.is_empty() {
            return None;
        }

        let now = Utc::now();
        let best_fresh = slots
            .iter()
            .filter(|slot| {
                slot.health
                    .last_tested_at
                    .is_some_and(|t| now - t <= self.freshness_window)
            })
            .max_by_key(|slot| slot.health.score());

        if let Some(slot) = best_fresh {
            if slot.health.success_count > 0 {
                debug!(endpoint = %slot.endpoint.key(), "selected scored egress");
                return Some(slot.endpoint.clone());
            }
        }

        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % slots.len();
        debug!(endpoint = %slots[index].endpoint.key(), "selected round-robin egress");
        Some(slots[index].endpoint.clone())
    }

    /// Record one request outcome through the endpoint. Counter and
    /// latency updates are atomic with respect to other workers.
    pub async fn record(&self, endpoint: &EgressEndpoint, success: bool, latency: Duration) {
        let key = endpoint.key();
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.iter_mut().find(|s| s.endpoint.key() == key) else {
            warn!(endpoint = %key, "recording outcome for unknown endpoint");
            return;
        };
        if success {
            slot.health.success_count += 1;
        } else {
            slot.health.failure_count += 1;
        }
        slot.health.cumulative_latency += latency;
    }

    /// Liveness-test one endpoint, at most once per probe interval; inside
    /// the interval the cached verdict is returned. Probe outcomes feed the
    /// same counters as real fetches, so failing endpoints are
    /// down-weighted rather than removed.
    pub async fn test(&self, endpoint: &EgressEndpoint) -> bool {
        let key = endpoint.key();
        {
            let slots = self.slots.lock().await;
            if let Some(slot) = slots.iter().find(|s| s.endpoint.key() == key) {
                if let Some(tested_at) = slot.health.last_tested_at {
                    if Utc::now() - tested_at < self.probe_interval {
                        debug!(endpoint = %key, verdict = slot.health.last_verdict, "probe throttled, cached verdict");
                        return slot.health.last_verdict;
                    }
                }
            } else {
                warn!(endpoint = %key, "probe requested for unknown endpoint");
                return false;
            }
        }

        let outcome = self.probe.probe(endpoint).await;
        let (verdict, latency) = match outcome {
            Ok(latency) => {
                debug!(endpoint = %key, ?latency, "probe succeeded");
                (true, latency)
            }
            Err(error) => {
                warn!(endpoint = %key, %error, "probe failed");
                (false, Duration::ZERO)
            }
        };

        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.endpoint.key() == key) {
            slot.health.last_tested_at = Some(Utc::now());
            slot.health.last_verdict = verdict;
            if verdict {
                slot.health.success_count += 1;
                slot.health.cumulative_latency += latency;
            } else {
                slot.health.failure_count += 1;
            }
        }
        verdict
    }

    /// Probe the roster until one endpoint passes. Fatal when the roster
    /// is non-empty and nothing passes; an empty roster means direct
    /// connection and is fine.
    pub async fn ensure_available(&self) -> Result<(), EgressError> {
        let roster: Vec<EgressEndpoint> = {
            let slots = self.slots.lock().await;
            slots.iter().map(|s| s.endpoint.clone()).collect()
        };
        if roster.is_empty() {
            return Ok(());
        }

        for endpoint in &roster {
            if self.test(endpoint).await {
                info!(endpoint = %endpoint.key(), "egress roster has a live endpoint");
                return Ok(());
            }
        }
        Err(EgressError::Exhausted {
            roster_size: roster.len(),
        })
    }

    /// Stats snapshot for reporting
    pub async fn stats(&self) -> Vec<EndpointStats> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .map(|slot| EndpointStats {
                key: slot.endpoint.key(),
                success_count: slot.health.success_count,
                failure_count: slot.health.failure_count,
                average_latency_ms: slot.health.average_latency().as_millis() as u64,
                last_tested_at: slot.health.last_tested_at,
                last_verdict: slot.health.last_verdict,
            })
            .collect()
    }
}
