//! Paginated category listing traversal
//!
//! Walks one size category's listing pages in order, extracting product
//! stubs and persisting them page by page so partial progress survives a
//! later failure. Termination is driven only by site signals: the absence
//! of a next-page link, or the cycle guard tripping on a revisited URL.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::constants::site;
use crate::domain::events::{CrawlStage, ItemFailure};
use crate::domain::product::{ProductStub, SizeCategory};
use crate::infrastructure::fetch::FetchClient;
use crate::infrastructure::product_store::ProductStore;

/// CSS selectors for listing markup
#[derive(Debug, Clone)]
pub struct ListingSelectors {
    /// One listing entry per product
    pub entry: String,
    /// Detail-page link inside an entry
    pub entry_link: String,
    /// The next-page affordance; absent means the last page
    pub next_link: String,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            entry: "li.product-item, article.product-entry".to_string(),
            entry_link: format!("a[href*='{}']", site::DETAIL_LINK_FRAGMENT),
            next_link: "a.next.page-numbers, .nav-links a.next".to_string(),
        }
    }
}

/// Ephemeral per-run pagination state: the first page URL, the visited-URL
/// set for cycle detection, and a page counter. Never persisted.
#[derive(Debug)]
pub struct CrawlCursor {
    pub category: SizeCategory,
    pub current_page: u32,
    visited: HashSet<String>,
    base_url: String,
}

impl CrawlCursor {
    pub fn new(category: SizeCategory, base_url: &str) -> Self {
        Self {
            category,
            current_page: site::PAGE_NUMBERING_BASE,
            visited: HashSet::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Listing URL of the category's first page; later pages come from
    /// each page's own next link.
    pub fn initial_url(&self) -> String {
        format!("{}/{}/", self.base_url, self.category)
    }

    /// Mark the URL visited; false means it was seen before in this run
    pub fn mark_visited(&mut self, url: &str) -> bool {
        self.visited.insert(url.to_string())
    }

    pub fn advance(&mut self) {
        self.current_page += 1;
    }
}

/// Result of crawling one category
#[derive(Debug, Clone)]
pub struct CategorySummary {
    pub category: SizeCategory,
    pub pages_visited: u32,
    pub stubs_stored: usize,
    pub failures: Vec<ItemFailure>,
}

/// Listing-page state machine for one size category
pub struct ListingCrawler {
    fetch: Arc<FetchClient>,
    store: ProductStore,
    selectors: ListingSelectors,
    category_base_url: String,
}

impl ListingCrawler {
    pub fn new(fetch: Arc<FetchClient>, store: ProductStore, category_base_url: &str) -> Self {
        Self {
            fetch,
            store,
            selectors: ListingSelectors::default(),
            category_base_url: category_base_url.to_string(),
        }
    }

    pub fn with_selectors(mut self, selectors: ListingSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    /// Walk the category's pages until the site signals the end (no next
    /// link), the cycle guard fires on a revisited URL, or cancellation is
    /// requested between page fetches.
    pub async fn crawl_category(
        &self,
        category: SizeCategory,
        cancel: &CancellationToken,
    ) -> Result<CategorySummary> {
        let mut cursor = CrawlCursor::new(category, &self.category_base_url);
        let mut summary = CategorySummary {
            category,
            pages_visited: 0,
            stubs_stored: 0,
            failures: Vec::new(),
        };
        let mut page_url = cursor.initial_url();

        loop {
            if cancel.is_cancelled() {
                info!(%category, "listing crawl cancelled between pages");
                break;
            }

            if !cursor.mark_visited(&page_url) {
                warn!(%category, url = %page_url, "page URL already visited, cycle guard fired");
                break;
            }

            let page = match self.fetch.fetch(&page_url, None).await {
                Ok(page) => page,
                Err(error) => {
                    // Without this page there is no next link to follow;
                    // the category ends here and the page is reported.
                    warn!(%category, url = %page_url, %error, "listing page fetch failed");
                    summary
                        .failures
                        .push(ItemFailure::new(&page_url, CrawlStage::Listing, &error));
                    break;
                }
            };
            summary.pages_visited += 1;

            let (stubs, next_url) =
                parse_listing_page(&self.selectors, &page.html, &page_url, category);
            debug!(
                %category,
                page = cursor.current_page,
                stubs = stubs.len(),
                has_next = next_url.is_some(),
                "listing page parsed"
            );

            // Persist immediately, not batched at the end
            for stub in &stubs {
                match self.store.upsert_stub(stub).await {
                    Ok(()) => summary.stubs_stored += 1,
                    Err(error) => {
                        warn!(id = %stub.external_id, %error, "stub upsert failed");
                        summary.failures.push(ItemFailure::new(
                            &stub.external_id,
                            CrawlStage::Persist,
                            &error,
                        ));
                    }
                }
            }

            match next_url {
                Some(next) => {
                    cursor.advance();
                    page_url = next;
                }
                None => {
                    info!(%category, pages = summary.pages_visited, "no next-page link, category done");
                    break;
                }
            }
        }

        Ok(summary)
    }
}

/// Extract stubs and the next-page URL from listing markup. Entries
/// without an extractable identifier are dropped and logged.
fn parse_listing_page(
    selectors: &ListingSelectors,
    html: &str,
    page_url: &str,
    category: SizeCategory,
) -> (Vec<ProductStub>, Option<String>) {
    let document = Html::parse_document(html);

    let entry_selector = match Selector::parse(&selectors.entry) {
        Ok(s) => s,
        Err(_) => return (Vec::new(), None),
    };
    let link_selector = match Selector::parse(&selectors.entry_link) {
        Ok(s) => s,
        Err(_) => return (Vec::new(), None),
    };

    let mut stubs = Vec::new();
    for entry in document.select(&entry_selector) {
        let Some(link) = entry.select(&link_selector).next() else {
            debug!(%category, "listing entry without detail link, dropped");
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let canonical_url = resolve_url(href, site::BASE_URL);
        let Some(external_id) = external_id_from_url(&canonical_url) else {
            warn!(%category, url = %canonical_url, "listing entry without identifier, dropped");
            continue;
        };

        let display_name = {
            let text = link.text().collect::<String>().trim().to_string();
            if text.is_empty() {
                external_id.clone()
            } else {
                text
            }
        };

        stubs.push(ProductStub {
            external_id,
            display_name,
            size_category: category,
            canonical_url,
        });
    }

    let next_url = Selector::parse(&selectors.next_link)
        .ok()
        .and_then(|s| {
            document
                .select(&s)
                .next()
                .and_then(|link| link.value().attr("href"))
                .map(|href| resolve_url(href, page_url))
        });

    (stubs, next_url)
}

/// Resolve a possibly-relative href against a base URL
fn resolve_url(href: &str, base_url: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else if let Ok(base) = Url::parse(base_url) {
        base.join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string())
    } else {
        href.to_string()
    }
}

/// The catalog id is the terminal path segment of the detail URL
fn external_id_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !parsed.path().contains(site::DETAIL_LINK_FRAGMENT) {
        return None;
    }
    let id = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()?
        .to_string();
    if id.is_empty() || id == "box" {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_URL: &str = "https://www.bestcarton.com/category/size/size-60/";

    #[test]
    fn cursor_builds_first_page_url() {
        let cursor = CrawlCursor::new(
            SizeCategory::Size60,
            "https://www.bestcarton.com/category/size/",
        );
        assert_eq!(
            cursor.initial_url(),
            "https://www.bestcarton.com/category/size/size-60/"
        );
    }

    #[test]
    fn cursor_detects_revisited_urls() {
        let mut cursor = CrawlCursor::new(SizeCategory::Size60, "https://example.net/c");
        let url = cursor.initial_url();
        assert!(cursor.mark_visited(&url));
        assert!(!cursor.mark_visited(&url));
    }

    #[test]
    fn external_id_comes_from_terminal_segment() {
        assert_eq!(
            external_id_from_url("https://www.bestcarton.com/cardboard/box/A4-60/"),
            Some("A4-60".to_string())
        );
        assert_eq!(
            external_id_from_url("https://www.bestcarton.com/cardboard/box/"),
            None
        );
        assert_eq!(
            external_id_from_url("https://www.bestcarton.com/about/"),
            None
        );
    }

    #[test]
    fn listing_page_parses_stubs_and_next_url() {
        let selectors = ListingSelectors::default();
        let html = r#"
            <ul>
                <li class="product-item">
                    <a href="/cardboard/box/A4-60/">A4サイズ 60サイズ</a>
                </li>
                <li class="product-item">
                    <a href="https://www.bestcarton.com/cardboard/box/K-50/">K-50 みかん箱</a>
                </li>
                <li class="product-item">
                    <a href="/company/about/">会社概要</a>
                </li>
            </ul>
            <div class="nav-links"><a class="next page-numbers" href="/category/size/size-60/page/2/">次へ</a></div>
        "#;

        let (stubs, next_url) =
            parse_listing_page(&selectors, html, PAGE_URL, SizeCategory::Size60);
        assert_eq!(stubs.len(), 2);
        assert_eq!(stubs[0].external_id, "A4-60");
        assert_eq!(stubs[0].display_name, "A4サイズ 60サイズ");
        assert_eq!(
            stubs[0].canonical_url,
            "https://www.bestcarton.com/cardboard/box/A4-60/"
        );
        assert_eq!(stubs[1].external_id, "K-50");
        assert_eq!(
            next_url.as_deref(),
            Some("https://www.bestcarton.com/category/size/size-60/page/2/")
        );
    }

    #[test]
    fn last_page_has_no_next_url() {
        let selectors = ListingSelectors::default();
        let html = r##"
            <ul><li class="product-item"><a href="/cardboard/box/W-10/">W-10</a></li></ul>
            <div class="nav-links"><a class="prev page-numbers" href="#">前へ</a></div>
        "##;
        let (stubs, next_url) =
            parse_listing_page(&selectors, html, PAGE_URL, SizeCategory::Size80);
        assert_eq!(stubs.len(), 1);
        assert!(next_url.is_none());
    }

    #[test]
    fn resolve_handles_relative_and_absolute() {
        assert_eq!(
            resolve_url("/cardboard/box/K-50/", "https://www.bestcarton.com"),
            "https://www.bestcarton.com/cardboard/box/K-50/"
        );
        assert_eq!(
            resolve_url("https://other.example.net/x", "https://www.bestcarton.com"),
            "https://other.example.net/x"
        );
    }
}
