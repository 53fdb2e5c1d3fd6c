//! Configuration infrastructure
//!
//! Loading and management of the crawler configuration: a JSON file under
//! the user config directory, created with defaults on first run. Every
//! component receives its settings from here; nothing reads the file on
//! its own.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::domain::constants::{crawling, egress as egress_defaults, site};
use crate::infrastructure::egress::EgressEndpoint;

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub crawler: CrawlerConfig,
    pub egress: EgressConfig,
    pub logging: LoggingConfig,
}

/// Fetching and worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// User agent presented on plain-HTTP fetches
    pub user_agent: String,

    /// Per-attempt request timeout in seconds
    pub request_timeout_seconds: u64,

    /// Wait for a pricing-unit tab / its content update, in seconds
    pub interaction_timeout_seconds: u64,

    /// Maximum attempts per fetch
    pub max_retries: u32,

    /// Backoff base and cap in milliseconds
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Randomized politeness delay range in milliseconds
    pub request_delay_min_ms: u64,
    pub request_delay_max_ms: u64,

    /// Global request-rate cap shared by all workers
    pub max_requests_per_second: u32,

    pub workers: WorkerConfig,
    pub site: SiteConfig,
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Categories crawled concurrently during listing runs
    pub listing_max_concurrent: usize,

    /// Detail workers; each owns one rendering session for its batch
    pub detail_workers: usize,
}

/// Site URL roots, overridable for test harnesses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub category_base_url: String,
    pub detail_base_url: String,
}

/// Egress roster and probing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    /// Proxy roster; empty means direct connection
    pub endpoints: Vec<EgressEndpoint>,

    pub probe_url: String,
    pub probe_timeout_seconds: u64,
    pub probe_interval_minutes: i64,
    pub freshness_window_minutes: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    pub console_output: bool,
    pub file_output: bool,

    /// Module-specific log level filters (e.g., "sqlx": "warn")
    pub module_filters: HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerConfig::default(),
            egress: EgressConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            request_timeout_seconds: crawling::DEFAULT_REQUEST_TIMEOUT_SECONDS,
            interaction_timeout_seconds: crawling::DEFAULT_INTERACTION_TIMEOUT_SECONDS,
            max_retries: crawling::DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: crawling::DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: crawling::DEFAULT_RETRY_MAX_DELAY_MS,
            request_delay_min_ms: crawling::DEFAULT_REQUEST_DELAY_MIN_MS,
            request_delay_max_ms: crawling::DEFAULT_REQUEST_DELAY_MAX_MS,
            max_requests_per_second: crawling::DEFAULT_MAX_REQUESTS_PER_SECOND,
            workers: WorkerConfig::default(),
            site: SiteConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listing_max_concurrent: 2,
            detail_workers: 2,
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            category_base_url: site::CATEGORY_BASE_URL.to_string(),
            detail_base_url: site::DETAIL_BASE_URL.to_string(),
        }
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            probe_url: egress_defaults::DEFAULT_PROBE_URL.to_string(),
            probe_timeout_seconds: egress_defaults::DEFAULT_PROBE_TIMEOUT_SECONDS,
            probe_interval_minutes: egress_defaults::DEFAULT_PROBE_INTERVAL_MINUTES,
            freshness_window_minutes: egress_defaults::DEFAULT_FRESHNESS_WINDOW_MINUTES,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: true,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("sqlx".to_string(), "warn".to_string());
                filters.insert("reqwest".to_string(), "info".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("headless_chrome".to_string(), "warn".to_string());
                filters.insert("carton_crawler".to_string(), "info".to_string());
                filters
            },
        }
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("carton-crawler");
        Ok(config_dir)
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join("carton_crawler_config.json");
        Ok(Self { config_path })
    }

    /// Application data directory (database, logs)
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join("carton-crawler");
        Ok(data_dir)
    }

    /// SQLite URL for the default database location
    pub fn database_url() -> Result<String> {
        let path = Self::get_app_data_dir()?.join("database").join("products.db");
        Ok(format!("sqlite:{}", path.display()))
    }

    /// Initialize configuration system on first run
    pub async fn initialize_on_first_run(&self) -> Result<AppConfig> {
        let config_dir = self
            .config_path
            .parent()
            .context("Failed to get config directory")?;

        if !config_dir.exists() {
            fs::create_dir_all(config_dir)
                .await
                .context("Failed to create config directory")?;
            info!("created configuration directory: {:?}", config_dir);
        }

        if self.config_path.exists() {
            self.load_config().await
        } else {
            info!("first run detected, writing default configuration");
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            self.create_data_directories().await?;
            Ok(default_config)
        }
    }

    async fn create_data_directories(&self) -> Result<()> {
        let app_data_dir = Self::get_app_data_dir()?;
        for dir in [app_data_dir.join("database"), app_data_dir.join("logs")] {
            if !dir.exists() {
                fs::create_dir_all(&dir)
                    .await
                    .with_context(|| format!("Failed to create directory: {dir:?}"))?;
                info!("created directory: {:?}", dir);
            }
        }
        Ok(())
    }

    /// Load configuration from file, creating defaults when missing
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "configuration file not found, creating default: {:?}",
                self.config_path
            );
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", self.config_path))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", self.config_path))?;
        Ok(config)
    }

    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.config_path, content)
            .await
            .with_context(|| format!("Failed to write config file {:?}", self.config_path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn config_roundtrips_through_file() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager {
            config_path: dir.path().join("config.json"),
        };

        let mut config = AppConfig::default();
        config.crawler.max_retries = 7;
        config.egress.endpoints.push(EgressEndpoint::new("proxy.example.net", 3128));
        manager.save_config(&config).await.unwrap();

        let loaded = manager.load_config().await.unwrap();
        assert_eq!(loaded.crawler.max_retries, 7);
        assert_eq!(loaded.egress.endpoints.len(), 1);
        assert_eq!(loaded.egress.endpoints[0].port, 3128);
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager {
            config_path: dir.path().join("missing.json"),
        };
        let loaded = manager.load_config().await.unwrap();
        assert_eq!(
            loaded.crawler.max_retries,
            crawling::DEFAULT_MAX_RETRIES
        );
        assert!(manager.config_path.exists());
    }
}
