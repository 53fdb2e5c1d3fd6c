//! carton-crawler - resilient product catalog acquisition
//!
//! Acquires structured product records (dimensions, pricing tiers,
//! material attributes) from a corrugated-box catalog site that exposes
//! no API: egress health management, retrying fetch/interaction
//! execution, paginated listing traversal, structured field extraction,
//! and idempotent upsert persistence.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;
