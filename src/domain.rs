//! Domain types for the catalog acquisition pipeline

pub mod constants;
pub mod events;
pub mod product;

pub use events::{CrawlReport, CrawlStage, ItemFailure};
pub use product::{PriceTiers, PriceUnit, ProductRecord, ProductStub, SizeCategory};
