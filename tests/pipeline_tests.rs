//! End-to-end pipeline scenarios over a local mock site and a scripted
//! rendering backend: listing traversal into the store, price-tier
//! merging across pricing-unit states, and retry accounting against the
//! egress pool.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use carton_crawler::domain::product::{PriceUnit, ProductStub, SizeCategory};
use carton_crawler::infrastructure::egress::{EgressEndpoint, EgressPool, HttpLivenessProbe};
use carton_crawler::infrastructure::extractor::DetailExtractor;
use carton_crawler::infrastructure::fetch::{FetchClient, FetchConfig, build_rate_limiter};
use carton_crawler::infrastructure::listing::ListingCrawler;
use carton_crawler::infrastructure::product_store::ProductStore;
use carton_crawler::infrastructure::renderer::{
    PageRenderer, RenderError, RenderOutcome, RenderRequest,
};
use carton_crawler::infrastructure::retry::RetryPolicy;

/// Renderer that replays a fixed script of outcomes, recording the
/// requested interactions.
struct ScriptedRenderer {
    script: Mutex<Vec<Result<RenderOutcome, RenderError>>>,
    seen_interactions: Mutex<Vec<Option<PriceUnit>>>,
}

impl ScriptedRenderer {
    fn new(script: Vec<Result<RenderOutcome, RenderError>>) -> Self {
        Self {
            script: Mutex::new(script),
            seen_interactions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PageRenderer for ScriptedRenderer {
    async fn render(&self, request: RenderRequest<'_>) -> Result<RenderOutcome, RenderError> {
        self.seen_interactions
            .lock()
            .unwrap()
            .push(request.interaction);
        let mut script = self.script.lock().unwrap();
        assert!(!script.is_empty(), "renderer script exhausted");
        script.remove(0)
    }

    async fn shutdown(&self) {}
}

fn empty_pool() -> Arc<EgressPool> {
    Arc::new(EgressPool::new(
        Vec::new(),
        Arc::new(HttpLivenessProbe::default()),
    ))
}

fn test_client(pool: Arc<EgressPool>, renderer: Arc<dyn PageRenderer>) -> Arc<FetchClient> {
    let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
    let config = FetchConfig {
        delay_range_ms: (0, 0),
        ..FetchConfig::default()
    };
    let limiter = build_rate_limiter(1000).unwrap();
    Arc::new(FetchClient::new(pool, renderer, policy, config, limiter))
}

async fn fresh_store() -> ProductStore {
    let store = ProductStore::connect_in_memory().await.unwrap();
    store.initialize().await.unwrap();
    store
}

fn listing_page(entries: &[(&str, &str)], next_href: Option<&str>) -> String {
    let mut html = String::from("<ul>");
    for (id, name) in entries {
        html.push_str(&format!(
            "<li class=\"product-item\"><a href=\"/cardboard/box/{id}/\">{name}</a></li>"
        ));
    }
    html.push_str("</ul>");
    if let Some(href) = next_href {
        html.push_str(&format!(
            "<div class=\"nav-links\"><a class=\"next page-numbers\" href=\"{href}\">次へ</a></div>"
        ));
    }
    html
}

#[tokio::test]
async fn two_page_listing_yields_exactly_three_stubs() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/size-60/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(
            &[("A4-60", "A4 box"), ("K-50", "K-50 box")],
            Some("/size-60/page/2/"),
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/size-60/page/2/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(
            &[("W-10", "W-10 box")],
            None,
        )))
        .mount(&server)
        .await;

    let store = fresh_store().await;
    let fetch = test_client(empty_pool(), Arc::new(ScriptedRenderer::new(Vec::new())));
    let crawler = ListingCrawler::new(fetch, store.clone(), &server.uri());

    let cancel = CancellationToken::new();
    let summary = crawler
        .crawl_category(SizeCategory::Size60, &cancel)
        .await
        .unwrap();

    assert_eq!(summary.pages_visited, 2);
    assert_eq!(summary.stubs_stored, 3);
    assert!(summary.failures.is_empty());

    let stored = store.list(Some(SizeCategory::Size60)).await.unwrap();
    assert_eq!(stored.len(), 3);
    let ids: Vec<&str> = stored.iter().map(|r| r.external_id.as_str()).collect();
    assert_eq!(ids, vec!["A4-60", "K-50", "W-10"]);
}

#[tokio::test]
async fn cyclic_pagination_terminates_via_cycle_guard() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/size-80/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(
            &[("P-1", "P-1 box")],
            Some("/size-80/page/2/"),
        )))
        .mount(&server)
        .await;
    // The second page's next link points back at the first page
    Mock::given(method("GET"))
        .and(path("/size-80/page/2/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_page(
            &[("P-2", "P-2 box")],
            Some("/size-80/"),
        )))
        .mount(&server)
        .await;

    let store = fresh_store().await;
    let fetch = test_client(empty_pool(), Arc::new(ScriptedRenderer::new(Vec::new())));
    let crawler = ListingCrawler::new(fetch, store.clone(), &server.uri());

    let cancel = CancellationToken::new();
    let summary = crawler
        .crawl_category(SizeCategory::Size80, &cancel)
        .await
        .unwrap();

    // Finite termination: both pages visited once, then the guard fires
    assert_eq!(summary.pages_visited, 2);
    assert_eq!(summary.stubs_stored, 2);
}

const DETAIL_PAGE: &str = r#"
    <h1 class="item-title">宅配60サイズ A4段ボール箱</h1>
    <table class="item-spec">
        <tr><th>長さ（内寸）</th><td>305 mm</td></tr>
        <tr><th>幅（内寸）</th><td>220 mm</td></tr>
        <tr><th>材質</th><td>K5</td></tr>
    </table>
    <ul class="price-list" data-active-unit="1">
        <li onclick="selectPrice(1, 100); return false;">1枚 100円</li>
    </ul>
"#;

fn bulk_page() -> RenderOutcome {
    RenderOutcome {
        html: r#"
            <ul class="price-list" data-active-unit="bulk">
                <li onclick="selectPrice(1, 90); return false;">1枚 90円</li>
                <li onclick="selectPrice(10, 800); return false;">10枚 800円</li>
            </ul>
        "#
        .to_string(),
        interaction_applied: true,
    }
}

#[tokio::test]
async fn price_tiers_merge_last_tier_wins_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cardboard/box/T-1/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DETAIL_PAGE))
        .mount(&server)
        .await;

    // The per-ten tab is absent from this page (benign skip); the bulk
    // tab renders the overriding pairs.
    let renderer = Arc::new(ScriptedRenderer::new(vec![
        Ok(RenderOutcome {
            html: "<html>no price tabs</html>".to_string(),
            interaction_applied: false,
        }),
        Ok(bulk_page()),
    ]));
    let fetch = test_client(empty_pool(), renderer.clone());
    let extractor = DetailExtractor::new(fetch);
    let store = fresh_store().await;

    let stub = ProductStub {
        external_id: "T-1".to_string(),
        display_name: "T-1".to_string(),
        size_category: SizeCategory::Size60,
        canonical_url: format!("{}/cardboard/box/T-1/", server.uri()),
    };

    let record = extractor.extract(&stub).await.unwrap();
    store.upsert_record(&record).await.unwrap();

    let stored = store.get("T-1").await.unwrap().unwrap();
    assert_eq!(stored.price_tiers.len(), 2);
    assert_eq!(stored.price_tiers.get(&1), Some(&90));
    assert_eq!(stored.price_tiers.get(&10), Some(&800));
    // Fixed fields came from the default state
    assert_eq!(stored.inner_length, Some(305.0));
    assert_eq!(stored.material.as_deref(), Some("K5"));

    // Interactions were requested in the fixed tier order
    let seen = renderer.seen_interactions.lock().unwrap().clone();
    assert_eq!(seen, vec![Some(PriceUnit::PerTen), Some(PriceUnit::Bulk)]);
}

#[tokio::test]
async fn fetch_failing_twice_succeeds_third_and_pool_reflects_it() {
    let endpoint = EgressEndpoint::new("proxy-a.example.net", 8080);
    let pool = Arc::new(EgressPool::new(
        vec![endpoint],
        Arc::new(HttpLivenessProbe::default()),
    ));

    let renderer = Arc::new(ScriptedRenderer::new(vec![
        Err(RenderError::Navigation("connection reset".to_string())),
        Err(RenderError::UpdateNotObserved {
            marker: "data-active-unit=\"10\"".to_string(),
        }),
        Ok(RenderOutcome {
            html: "<html data-active-unit=\"10\">ok</html>".to_string(),
            interaction_applied: true,
        }),
    ]));
    let fetch = test_client(pool.clone(), renderer);

    let page = fetch
        .fetch("https://www.bestcarton.com/cardboard/box/T-9/", Some(PriceUnit::PerTen))
        .await
        .expect("third attempt succeeds");
    assert!(page.interaction_applied);

    let stats = pool.stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].failure_count, 2);
    assert_eq!(stats[0].success_count, 1);
}
