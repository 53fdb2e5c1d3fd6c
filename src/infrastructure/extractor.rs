//! Detail-page field and price-tier extraction
//!
//! Fixed attribute fields come from label-anchored lookups against the
//! spec table (find the label cell, read the adjacent value cell; a
//! missing label leaves the field null). Price tiers come from scanning a
//! bounded number of price-row elements per pricing-unit state and
//! decoding each row's event-trigger attribute payload.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::domain::constants::crawling::PRICE_ROW_SCAN_CAP;
use crate::domain::constants::site::labels;
use crate::domain::product::{PriceUnit, ProductRecord, ProductStub};
use crate::infrastructure::fetch::{FetchClient, FetchError};

/// CSS selectors for detail-page markup
#[derive(Debug, Clone)]
pub struct DetailSelectors {
    /// Rows of the spec table (th label, td value)
    pub spec_rows: String,
    /// Price-row elements carrying the trigger payload
    pub price_rows: String,
    /// Attribute holding the trigger payload on a price row
    pub payload_attr: String,
    /// Product title
    pub title: String,
}

impl Default for DetailSelectors {
    fn default() -> Self {
        Self {
            spec_rows: "table.item-spec tr, table.spec-table tr".to_string(),
            price_rows: "ul.price-list li[onclick], table.price-table tr[onclick]".to_string(),
            payload_attr: "onclick".to_string(),
            title: "h1.item-title, h1.entry-title".to_string(),
        }
    }
}

/// Extracts a full product record from rendered detail pages, one fetch
/// per pricing-unit state.
pub struct DetailExtractor {
    fetch: Arc<FetchClient>,
    selectors: DetailSelectors,
}

impl DetailExtractor {
    pub fn new(fetch: Arc<FetchClient>) -> Self {
        Self {
            fetch,
            selectors: DetailSelectors::default(),
        }
    }

    pub fn with_selectors(mut self, selectors: DetailSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    /// Fetch the detail page under the default UI state for the fixed
    /// fields and the first tier, then revisit it once per remaining
    /// pricing-unit state and merge the reported pairs last-tier-wins.
    ///
    /// Failing to fetch the default page at all is fatal for the product;
    /// a missing field, an absent tab, or a tier fetch that exhausts its
    /// retries only leaves that piece out.
    pub async fn extract(&self, stub: &ProductStub) -> Result<ProductRecord, FetchError> {
        let url = if stub.canonical_url.is_empty() {
            ProductStub::detail_url(&stub.external_id)
        } else {
            stub.canonical_url.clone()
        };

        let default_page = self.fetch.fetch(&url, None).await?;
        let mut record = parse_detail_fields(&self.selectors, &default_page.html, stub);

        for unit in PriceUnit::SEQUENCE {
            let pairs = if unit.is_default() {
                scan_price_rows(&self.selectors, &default_page.html)
            } else {
                match self.fetch.fetch(&url, Some(unit)).await {
                    Ok(page) if page.interaction_applied => {
                        scan_price_rows(&self.selectors, &page.html)
                    }
                    Ok(_) => {
                        debug!(id = %stub.external_id, %unit, "pricing tab absent, tier skipped");
                        continue;
                    }
                    Err(error) => {
                        warn!(id = %stub.external_id, %unit, %error, "tier fetch failed, tier skipped");
                        continue;
                    }
                }
            };
            record.merge_price_pairs(pairs);
        }

        Ok(record)
    }
}

/// Label-anchored lookup of every fixed field. Runs entirely on one parsed
/// document; absent labels leave fields null.
fn parse_detail_fields(
    selectors: &DetailSelectors,
    html: &str,
    stub: &ProductStub,
) -> ProductRecord {
    let document = Html::parse_document(html);
    let mut record = ProductRecord::from_stub(stub);

    if let Ok(title_selector) = Selector::parse(&selectors.title) {
        if let Some(title) = document.select(&title_selector).next() {
            let text = title.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                record.display_name = text;
            }
        }
    }

    let lookup = SpecTable::parse(selectors, &document);
    record.inner_length = lookup.numeric(labels::INNER_LENGTH);
    record.inner_width = lookup.numeric(labels::INNER_WIDTH);
    record.inner_depth = lookup.numeric(labels::INNER_DEPTH);
    record.outer_length = lookup.numeric(labels::OUTER_LENGTH);
    record.outer_width = lookup.numeric(labels::OUTER_WIDTH);
    record.outer_depth = lookup.numeric(labels::OUTER_DEPTH);
    record.outer_dimension_sum = lookup.numeric(labels::OUTER_DIMENSION_SUM);
    record.manufacturing_method = lookup.text(labels::MANUFACTURING_METHOD);
    record.processing_location = lookup.text(labels::PROCESSING_LOCATION);
    record.color = lookup.text(labels::COLOR);
    record.box_type = lookup.text(labels::BOX_TYPE);
    record.material = lookup.text(labels::MATERIAL);
    record.thickness = lookup.numeric(labels::THICKNESS);
    record.standard_width = lookup.numeric(labels::STANDARD_WIDTH);

    record
}

/// The spec table flattened into normalized label → value text pairs
struct SpecTable {
    entries: Vec<(String, String)>,
}

impl SpecTable {
    fn parse(selectors: &DetailSelectors, document: &Html) -> Self {
        let mut entries = Vec::new();
        let Ok(row_selector) = Selector::parse(&selectors.spec_rows) else {
            return Self { entries };
        };
        let Ok(th_selector) = Selector::parse("th") else {
            return Self { entries };
        };
        let Ok(td_selector) = Selector::parse("td") else {
            return Self { entries };
        };

        for row in document.select(&row_selector) {
            let Some(label_cell) = row.select(&th_selector).next() else {
                continue;
            };
            let Some(value_cell) = row.select(&td_selector).next() else {
                continue;
            };
            let label = normalize_label(&label_cell.text().collect::<String>());
            let value = value_cell.text().collect::<String>().trim().to_string();
            if !label.is_empty() {
                entries.push((label, value));
            }
        }
        Self { entries }
    }

    fn text(&self, label: &str) -> Option<String> {
        let wanted = normalize_label(label);
        self.entries
            .iter()
            .find(|(l, _)| *l == wanted)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty())
    }

    fn numeric(&self, label: &str) -> Option<f64> {
        self.text(label).as_deref().and_then(parse_numeric)
    }
}

/// The site mixes half- and full-width parentheses and stray whitespace in
/// its labels; compare a normalized form.
fn normalize_label(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '(' => '（',
            ')' => '）',
            other => other,
        })
        .collect()
}

static NUMBER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").expect("valid number pattern"));

/// First numeric token in a value cell ("320 mm" → 320.0)
fn parse_numeric(text: &str) -> Option<f64> {
    NUMBER_PATTERN
        .find(text)?
        .as_str()
        .parse::<f64>()
        .ok()
}

/// Scan the bounded list of price rows and decode their payloads. Rows
/// past the cap are ignored even when the markup keeps matching; rows
/// whose payload does not decode are skipped.
fn scan_price_rows(selectors: &DetailSelectors, html: &str) -> Vec<(u32, i64)> {
    let document = Html::parse_document(html);
    let Ok(row_selector) = Selector::parse(&selectors.price_rows) else {
        return Vec::new();
    };

    document
        .select(&row_selector)
        .take(PRICE_ROW_SCAN_CAP)
        .filter_map(|row| {
            let raw = row.value().attr(&selectors.payload_attr)?;
            match parse_trigger_payload(raw) {
                Some(pair) => Some(pair),
                None => {
                    debug!(payload = raw, "unparseable price-row payload, row skipped");
                    None
                }
            }
        })
        .collect()
}

// The most site-coupled piece of the pipeline: rows announce their price
// through an inline event-trigger payload such as
// `selectPrice(100, 3050); return false;`. A named-trigger pattern is
// tried first, then a generic two-integer call as fallback.
static NAMED_TRIGGER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:selectPrice|setPrice|priceSelect)\s*\(\s*(\d+)\s*,\s*(\d+)")
        .expect("valid named trigger pattern")
});
static GENERIC_TRIGGER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\(\s*(\d+)\s*,\s*(\d+)\s*[,)]").expect("valid generic trigger pattern")
});

/// Decode one price-row payload.
///
/// Input: the raw attribute string. Output: the (quantity, unit price)
/// pair, or `None` when the payload does not match any known encoding or
/// its numbers do not fit.
pub fn parse_trigger_payload(raw: &str) -> Option<(u32, i64)> {
    let captures = NAMED_TRIGGER_PATTERN
        .captures(raw)
        .or_else(|| GENERIC_TRIGGER_PATTERN.captures(raw))?;
    let quantity = captures.get(1)?.as_str().parse::<u32>().ok()?;
    let price = captures.get(2)?.as_str().parse::<i64>().ok()?;
    Some((quantity, price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::product::SizeCategory;
    use rstest::rstest;

    fn stub() -> ProductStub {
        ProductStub {
            external_id: "A4-60".to_string(),
            display_name: "A4-60".to_string(),
            size_category: SizeCategory::Size60,
            canonical_url: ProductStub::detail_url("A4-60"),
        }
    }

    const DETAIL_PAGE: &str = r#"
        <h1 class="item-title">宅配60サイズ A4段ボール箱</h1>
        <table class="item-spec">
            <tr><th>長さ（内寸）</th><td>305 mm</td></tr>
            <tr><th>幅 (内寸)</th><td>220 mm</td></tr>
            <tr><th>深さ（内寸）</th><td>61 mm</td></tr>
            <tr><th>外形三辺合計</th><td>60.5 cm</td></tr>
            <tr><th>製法</th><td>抜き加工</td></tr>
            <tr><th>色</th><td>クラフト</td></tr>
            <tr><th>形 式</th><td>A式</td></tr>
            <tr><th>材質</th><td>K5×K5</td></tr>
            <tr><th>厚み</th><td>3 mm</td></tr>
        </table>
        <ul class="price-list" data-active-unit="1">
            <li onclick="selectPrice(1, 120); return false;">1枚 120円</li>
            <li onclick="selectPrice(10, 1000); return false;">10枚 1,000円</li>
        </ul>
    "#;

    #[test]
    fn fields_are_label_anchored_and_nullable() {
        let record = parse_detail_fields(&DetailSelectors::default(), DETAIL_PAGE, &stub());
        assert_eq!(record.display_name, "宅配60サイズ A4段ボール箱");
        assert_eq!(record.inner_length, Some(305.0));
        assert_eq!(record.inner_width, Some(220.0));
        assert_eq!(record.inner_depth, Some(61.0));
        assert_eq!(record.outer_dimension_sum, Some(60.5));
        assert_eq!(record.manufacturing_method.as_deref(), Some("抜き加工"));
        assert_eq!(record.color.as_deref(), Some("クラフト"));
        assert_eq!(record.box_type.as_deref(), Some("A式"));
        assert_eq!(record.material.as_deref(), Some("K5×K5"));
        assert_eq!(record.thickness, Some(3.0));
        // Labels absent from the page resolve to null, not an error
        assert_eq!(record.outer_length, None);
        assert_eq!(record.standard_width, None);
        assert_eq!(record.processing_location, None);
    }

    #[test]
    fn price_rows_are_scanned_from_payloads() {
        let pairs = scan_price_rows(&DetailSelectors::default(), DETAIL_PAGE);
        assert_eq!(pairs, vec![(1, 120), (10, 1000)]);
    }

    #[test]
    fn row_scan_halts_at_cap_on_endless_markup() {
        let mut html = String::from("<ul class=\"price-list\">");
        for i in 0..400 {
            html.push_str(&format!(
                "<li onclick=\"selectPrice({}, {})\">row</li>",
                i + 1,
                (i + 1) * 10
            ));
        }
        html.push_str("</ul>");

        let pairs = scan_price_rows(&DetailSelectors::default(), &html);
        assert_eq!(pairs.len(), PRICE_ROW_SCAN_CAP);
    }

    #[rstest]
    #[case("selectPrice(100, 3050); return false;", Some((100, 3050)))]
    #[case("setPrice( 20 , 1800 )", Some((20, 1800)))]
    #[case("priceSelect(1,120)", Some((1, 120)))]
    // Generic fallback: unknown trigger name, two leading integers
    #[case("applyRow(50, 4200, 'bulk')", Some((50, 4200)))]
    // Non-numeric payloads are skipped, not errors
    #[case("selectPrice('a', 'b')", None)]
    #[case("toggleMenu()", None)]
    #[case("", None)]
    // Overflowing quantity does not fit u32
    #[case("selectPrice(99999999999, 10)", None)]
    fn payload_decoding_cases(#[case] raw: &str, #[case] expected: Option<(u32, i64)>) {
        assert_eq!(parse_trigger_payload(raw), expected);
    }

    #[test]
    fn duplicate_quantities_within_a_tier_last_row_wins() {
        let html = r#"
            <ul class="price-list">
                <li onclick="selectPrice(10, 1000)">a</li>
                <li onclick="selectPrice(10, 950)">b</li>
            </ul>
        "#;
        let pairs = scan_price_rows(&DetailSelectors::default(), html);
        // Scan preserves document order; the merge map makes the later
        // row win
        let mut record = ProductRecord::from_stub(&stub());
        record.merge_price_pairs(pairs);
        assert_eq!(record.price_tiers.get(&10), Some(&950));
    }

    #[test]
    fn numeric_parse_pulls_first_token() {
        assert_eq!(parse_numeric("320 mm"), Some(320.0));
        assert_eq!(parse_numeric("60.5 cm"), Some(60.5));
        assert_eq!(parse_numeric("未定"), None);
    }
}
