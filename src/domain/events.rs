//! Run-level result types surfaced to collaborators
//!
//! The pipeline reports progress through a per-run failure list rather
//! than aborting on individual items; these are the plain-data shapes the
//! display layer consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stage an item failed in, kept for targeted re-runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrawlStage {
    Listing,
    Detail,
    Persist,
}

impl std::fmt::Display for CrawlStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Listing => "listing",
            Self::Detail => "detail",
            Self::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// One item (product or listing page) that could not be processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Product external id, or the page URL for listing failures
    pub id: String,
    pub stage: CrawlStage,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(id: impl Into<String>, stage: CrawlStage, reason: impl ToString) -> Self {
        Self {
            id: id.into(),
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Outcome of one crawl run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlReport {
    pub run_id: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<ItemFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CrawlReport {
    pub fn new(run_id: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            attempted: 0,
            succeeded: 0,
            failures: Vec::new(),
            started_at: now,
            completed_at: now,
        }
    }

    pub fn record_success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, failure: ItemFailure) {
        self.attempted += 1;
        self.failures.push(failure);
    }

    pub fn finish(&mut self) {
        self.completed_at = Utc::now();
    }
}
