//! Site characteristics and domain constants
//!
//! Fixed tables describing www.bestcarton.com: size categories, the
//! quantity tiers the shop quotes prices for, and the URL patterns of
//! listing and detail pages.

/// bestcarton.com site characteristics
pub mod site {
    /// Site base URL
    pub const BASE_URL: &str = "https://www.bestcarton.com";

    /// Category listing base URL; append `{category}/` and optionally `page/{n}/`
    pub const CATEGORY_BASE_URL: &str = "https://www.bestcarton.com/category/size/";

    /// Detail page base URL; append `{product_id}/`
    pub const DETAIL_BASE_URL: &str = "https://www.bestcarton.com/cardboard/box/";

    /// Path fragment identifying a product detail link in listing markup
    pub const DETAIL_LINK_FRAGMENT: &str = "/cardboard/box/";

    /// Listing pages are 1-based; page 1 has no `page/` path segment
    pub const PAGE_NUMBERING_BASE: u32 = 1;

    /// Class name present whenever the detail page carries pricing-unit tabs.
    /// Used to tell "tab not rendered yet" apart from "page has no tabs".
    pub const PRICE_TAB_CONTAINER_HINT: &str = "price-unit-tab";

    /// Spec-table labels on detail pages (th text, before normalization)
    pub mod labels {
        pub const INNER_LENGTH: &str = "長さ（内寸）";
        pub const INNER_WIDTH: &str = "幅（内寸）";
        pub const INNER_DEPTH: &str = "深さ（内寸）";
        pub const OUTER_LENGTH: &str = "長さ（外寸）";
        pub const OUTER_WIDTH: &str = "幅（外寸）";
        pub const OUTER_DEPTH: &str = "深さ（外寸）";
        pub const OUTER_DIMENSION_SUM: &str = "外形三辺合計";
        pub const MANUFACTURING_METHOD: &str = "製法";
        pub const PROCESSING_LOCATION: &str = "加工先";
        pub const COLOR: &str = "色";
        pub const BOX_TYPE: &str = "形式";
        pub const MATERIAL: &str = "材質";
        pub const THICKNESS: &str = "厚み";
        pub const STANDARD_WIDTH: &str = "規格幅";
    }
}

/// Crawling limits and politeness defaults
pub mod crawling {
    /// Default randomized inter-request delay range (milliseconds)
    pub const DEFAULT_REQUEST_DELAY_MIN_MS: u64 = 500;
    pub const DEFAULT_REQUEST_DELAY_MAX_MS: u64 = 2000;

    /// Default per-attempt request timeout (seconds)
    pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

    /// Default wait for a pricing-unit tab to become interactable (seconds)
    pub const DEFAULT_INTERACTION_TIMEOUT_SECONDS: u64 = 10;

    /// Default retry attempts per fetch
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Default backoff base / cap (milliseconds)
    pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;
    pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

    /// Default global request-rate cap (requests per second)
    pub const DEFAULT_MAX_REQUESTS_PER_SECOND: u32 = 2;

    /// Hard cap on price-row elements scanned per pricing-unit state.
    /// Guards against malformed markup that matches the row selector
    /// without end.
    pub const PRICE_ROW_SCAN_CAP: usize = 120;
}

/// Egress (proxy) health management defaults
pub mod egress {
    /// Liveness probe target, reachable through any working proxy
    pub const DEFAULT_PROBE_URL: &str = "https://httpbin.org/ip";

    /// Minimum interval between probes of the same endpoint (minutes)
    pub const DEFAULT_PROBE_INTERVAL_MINUTES: i64 = 5;

    /// An endpoint counts as freshly tested within this window (minutes)
    pub const DEFAULT_FRESHNESS_WINDOW_MINUTES: i64 = 5;

    /// Probe request timeout (seconds)
    pub const DEFAULT_PROBE_TIMEOUT_SECONDS: u64 = 5;
}

/// The quantity tiers the shop quotes unit prices for. The products table
/// carries one nullable `price_{q}` column per entry; quantities reported
/// by the site outside this table are dropped.
pub const ALLOWED_QUANTITIES: [u32; 51] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 20, 30, 40, 50, 60, 70, 80, 100, 110,
    120, 130, 140, 150, 160, 170, 180, 190, 200, 300, 400, 500, 600, 700,
    800, 900, 1000, 1400, 1600, 1800, 2000, 2200, 2400, 2600, 2800, 3000,
    3200, 3400, 3600, 3800, 4000, 4200,
];

/// Whether `quantity` is one of the fixed tiers the schema has a column for
pub fn is_allowed_quantity(quantity: u32) -> bool {
    ALLOWED_QUANTITIES.binary_search(&quantity).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_quantities_are_sorted_and_unique() {
        let mut sorted = ALLOWED_QUANTITIES.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.as_slice(), ALLOWED_QUANTITIES.as_slice());
    }

    #[test]
    fn membership_check_matches_table() {
        assert!(is_allowed_quantity(1));
        assert!(is_allowed_quantity(100));
        assert!(is_allowed_quantity(4200));
        assert!(!is_allowed_quantity(0));
        assert!(!is_allowed_quantity(90));
        assert!(!is_allowed_quantity(99999));
    }
}
