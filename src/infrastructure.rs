//! Infrastructure layer: egress management, fetching, extraction, and
//! persistence

pub mod config;
pub mod egress;
pub mod extractor;
pub mod fetch;
pub mod listing;
pub mod logging;
pub mod product_store;
pub mod renderer;
pub mod retry;

pub use config::{AppConfig, ConfigManager};
pub use egress::{EgressEndpoint, EgressError, EgressPool, HttpLivenessProbe, LivenessProbe};
pub use extractor::DetailExtractor;
pub use fetch::{FetchClient, FetchError};
pub use listing::{CrawlCursor, ListingCrawler};
pub use product_store::ProductStore;
pub use renderer::{ChromeRenderer, PageRenderer, RenderedPage};
pub use retry::RetryPolicy;
