//! Application layer: crawl run orchestration over the infrastructure
//! components

pub mod crawl_runner;

pub use crawl_runner::{CrawlRunner, RendererFactory};
