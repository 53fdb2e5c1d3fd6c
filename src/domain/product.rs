use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::constants::site;

/// Size categories the shop organizes its catalog by. Fixed set; listing
/// URLs are derived from the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeCategory {
    #[serde(rename = "size-60")]
    Size60,
    #[serde(rename = "size-80")]
    Size80,
    #[serde(rename = "size-100")]
    Size100,
    #[serde(rename = "size-120")]
    Size120,
    #[serde(rename = "size-140")]
    Size140,
    #[serde(rename = "size-160")]
    Size160,
    #[serde(rename = "size-mail-A4-25")]
    MailA4Depth25,
    #[serde(rename = "size-mail-A4-30")]
    MailA4Depth30,
}

impl SizeCategory {
    /// Every category the site exposes, in catalog order
    pub const ALL: [Self; 8] = [
        Self::Size60,
        Self::Size80,
        Self::Size100,
        Self::Size120,
        Self::Size140,
        Self::Size160,
        Self::MailA4Depth25,
        Self::MailA4Depth30,
    ];

    /// The site's identifier for this category (used in URLs and storage)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Size60 => "size-60",
            Self::Size80 => "size-80",
            Self::Size100 => "size-100",
            Self::Size120 => "size-120",
            Self::Size140 => "size-140",
            Self::Size160 => "size-160",
            Self::MailA4Depth25 => "size-mail-A4-25",
            Self::MailA4Depth30 => "size-mail-A4-30",
        }
    }
}

impl fmt::Display for SizeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SizeCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown size category: {s}"))
    }
}

/// Pricing-unit tabs on the detail page, in the fixed order they are
/// visited. The page loads with the per-unit tab active, so that state
/// needs no interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceUnit {
    PerUnit,
    PerTen,
    Bulk,
}

impl PriceUnit {
    /// Fixed visit order; later tiers overwrite earlier ones per quantity
    pub const SEQUENCE: [Self; 3] = [Self::PerUnit, Self::PerTen, Self::Bulk];

    /// Whether this tier is what the page shows without any interaction
    pub fn is_default(&self) -> bool {
        matches!(self, Self::PerUnit)
    }

    /// CSS selector for the tab element that activates this tier
    pub fn tab_selector(&self) -> &'static str {
        match self {
            Self::PerUnit => "li.price-unit-tab[data-unit='1'] a",
            Self::PerTen => "li.price-unit-tab[data-unit='10'] a",
            Self::Bulk => "li.price-unit-tab[data-unit='bulk'] a",
        }
    }

    /// Marker that appears in the rendered output once the price list has
    /// switched to this tier
    pub fn content_marker(&self) -> &'static str {
        match self {
            Self::PerUnit => "data-active-unit=\"1\"",
            Self::PerTen => "data-active-unit=\"10\"",
            Self::Bulk => "data-active-unit=\"bulk\"",
        }
    }
}

impl fmt::Display for PriceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PerUnit => "per-unit",
            Self::PerTen => "per-ten",
            Self::Bulk => "bulk",
        };
        f.write_str(name)
    }
}

/// Sparse quantity → unit price (yen) map. Keys are always members of
/// [`crate::domain::constants::ALLOWED_QUANTITIES`]; absent tiers are
/// omitted, never stored as zero.
pub type PriceTiers = BTreeMap<u32, i64>;

/// Minimal identifying record discovered on listing pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductStub {
    /// Catalog-assigned identifier (terminal path segment of the detail URL)
    pub external_id: String,
    pub display_name: String,
    pub size_category: SizeCategory,
    pub canonical_url: String,
}

impl ProductStub {
    /// Canonical detail-page URL for a catalog id
    pub fn detail_url(external_id: &str) -> String {
        format!("{}{}/", site::DETAIL_BASE_URL, external_id)
    }
}

/// Full product record assembled from a detail page. All attribute fields
/// are nullable; a missing label on the page simply leaves the field unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub external_id: String,
    pub display_name: String,
    pub size_category: SizeCategory,
    pub canonical_url: String,

    pub inner_length: Option<f64>,
    pub inner_width: Option<f64>,
    pub inner_depth: Option<f64>,
    pub outer_length: Option<f64>,
    pub outer_width: Option<f64>,
    pub outer_depth: Option<f64>,
    pub outer_dimension_sum: Option<f64>,

    pub manufacturing_method: Option<String>,
    pub processing_location: Option<String>,
    pub color: Option<String>,
    pub box_type: Option<String>,
    pub material: Option<String>,
    pub thickness: Option<f64>,
    pub standard_width: Option<f64>,

    pub price_tiers: PriceTiers,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductRecord {
    /// Start a record from a listing stub; detail fields are filled in by
    /// the extractor.
    pub fn from_stub(stub: &ProductStub) -> Self {
        let now = Utc::now();
        Self {
            external_id: stub.external_id.clone(),
            display_name: stub.display_name.clone(),
            size_category: stub.size_category,
            canonical_url: stub.canonical_url.clone(),
            inner_length: None,
            inner_width: None,
            inner_depth: None,
            outer_length: None,
            outer_width: None,
            outer_depth: None,
            outer_dimension_sum: None,
            manufacturing_method: None,
            processing_location: None,
            color: None,
            box_type: None,
            material: None,
            thickness: None,
            standard_width: None,
            price_tiers: PriceTiers::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge one tier's (quantity, price) pairs. Later calls overwrite
    /// earlier ones for the same quantity key (last-tier-wins); quantities
    /// outside the allowed table are dropped.
    pub fn merge_price_pairs<I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (u32, i64)>,
    {
        for (quantity, price) in pairs {
            if crate::domain::constants::is_allowed_quantity(quantity) {
                self.price_tiers.insert(quantity, price);
            } else {
                tracing::debug!(quantity, "dropping price pair outside quantity table");
            }
        }
    }
}
