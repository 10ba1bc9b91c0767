//! Search sweeps over the product-search API + item mapping into product records.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shelf_core::{CategoryRef, ProductRecord, SubCategoryRef, TagKind, UNKNOWN_TITLE};
use shelf_paapi::{ApiResponse, SearchItems, SearchRequest};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "shelf-adapters";

pub const ARTICLE_NAME_WORDS: usize = 5;
pub const ARTICLE_DESCRIPTION_CHARS: usize = 150;
pub const ARTICLE_PAGE_CAP: u32 = 10;
/// Width of the storefront's product name columns, in characters.
pub const MAX_NAME_CHARS: usize = 255;
/// Largest `ItemCount` the API accepts on one page.
pub const MAX_ITEMS_PER_PAGE: u32 = 10;

const KEYWORD_SWEEP_PAGES: u32 = 3;
const SUB_CATEGORY_SWEEP_PAGES: u32 = 1;
const LOWEST_BRACKET_PAGES: u32 = 2;

const ITEMS: &str = "/SearchResult/Items";
const PRICE_AMOUNT: &str = "/Offers/Listings/0/Price/Amount";
const SAVINGS_PERCENTAGE: &str = "/Offers/Listings/0/Price/Savings/Percentage";
const TITLE: &str = "/ItemInfo/Title/DisplayValue";
const IMAGE_URL: &str = "/Images/Primary/Large/URL";
const DETAIL_PAGE_URL: &str = "/DetailPageURL";
const SALES_RANK: &str = "/BrowseNodeInfo/BrowseNodes/0/SalesRank";

/// Price bounds in cents, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBracket {
    pub min: u32,
    pub max: u32,
}

/// References attached to every record a sweep produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepTarget {
    pub categories: Vec<CategoryRef>,
    pub sub_categories: Vec<SubCategoryRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    /// Global catalog: full title as name and description.
    Catalog,
    /// Article catalog: shortened name, word-bounded description.
    Article,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sweep {
    PriceBrackets {
        keywords: String,
        brackets: Vec<PriceBracket>,
        target: SweepTarget,
    },
    Keyword {
        keywords: String,
        target: SweepTarget,
    },
    SubCategory {
        keywords: String,
        target: SweepTarget,
    },
    Article {
        keywords: String,
        item_goal: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePolicy {
    Fixed(u32),
    UntilGoal { goal: u32, page_cap: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SweepLeg {
    price: Option<PriceBracket>,
    policy: PagePolicy,
}

impl Sweep {
    pub fn keywords(&self) -> &str {
        match self {
            Sweep::PriceBrackets { keywords, .. }
            | Sweep::Keyword { keywords, .. }
            | Sweep::SubCategory { keywords, .. }
            | Sweep::Article { keywords, .. } => keywords,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Sweep::PriceBrackets { .. } => "price_brackets",
            Sweep::Keyword { .. } => "keyword",
            Sweep::SubCategory { .. } => "sub_category",
            Sweep::Article { .. } => "article",
        }
    }

    fn shape(&self) -> RecordShape {
        match self {
            Sweep::Article { .. } => RecordShape::Article,
            _ => RecordShape::Catalog,
        }
    }

    fn target(&self) -> SweepTarget {
        match self {
            Sweep::PriceBrackets { target, .. }
            | Sweep::Keyword { target, .. }
            | Sweep::SubCategory { target, .. } => target.clone(),
            Sweep::Article { .. } => SweepTarget::default(),
        }
    }

    fn legs(&self) -> Vec<SweepLeg> {
        match self {
            Sweep::PriceBrackets { brackets, .. } => {
                let lowest = brackets.iter().map(|b| b.min).min();
                brackets
                    .iter()
                    .map(|bracket| SweepLeg {
                        price: Some(*bracket),
                        policy: if Some(bracket.min) == lowest {
                            PagePolicy::Fixed(LOWEST_BRACKET_PAGES)
                        } else {
                            PagePolicy::Fixed(1)
                        },
                    })
                    .collect()
            }
            Sweep::Keyword { .. } => vec![SweepLeg {
                price: None,
                policy: PagePolicy::Fixed(KEYWORD_SWEEP_PAGES),
            }],
            Sweep::SubCategory { .. } => vec![SweepLeg {
                price: None,
                policy: PagePolicy::Fixed(SUB_CATEGORY_SWEEP_PAGES),
            }],
            Sweep::Article { item_goal, .. } => vec![SweepLeg {
                price: None,
                policy: PagePolicy::UntilGoal {
                    goal: *item_goal,
                    page_cap: ARTICLE_PAGE_CAP,
                },
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub pages_requested: usize,
    pub pages_unavailable: usize,
    pub items_seen: usize,
    pub items_malformed: usize,
    pub records: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepResult {
    pub records: Vec<ProductRecord>,
    pub stats: SweepStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ItemRejection {
    #[error("item has no numeric Offers.Listings[0].Price.Amount")]
    MissingPrice,
}

/// Runs sweeps through the search API and maps the items it returns.
#[derive(Clone)]
pub struct CatalogFetcher {
    api: Arc<dyn SearchItems>,
    partner_tag: String,
    marketplace: String,
}

impl CatalogFetcher {
    pub fn new(
        api: Arc<dyn SearchItems>,
        partner_tag: impl Into<String>,
        marketplace: impl Into<String>,
    ) -> Self {
        Self {
            api,
            partner_tag: partner_tag.into(),
            marketplace: marketplace.into(),
        }
    }

    pub async fn run(&self, sweep: &Sweep) -> SweepResult {
        let span = info_span!("sweep", kind = sweep.kind(), keywords = sweep.keywords());
        async {
            let target = sweep.target();
            let shape = sweep.shape();
            let mut result = SweepResult::default();

            for leg in sweep.legs() {
                match leg.policy {
                    PagePolicy::Fixed(pages) => {
                        for page in 1..=pages {
                            let request = self.request(sweep.keywords(), leg.price, page);
                            if let Some(items) = self.fetch_page(&request, &mut result.stats).await {
                                self.collect(&items, shape, &target, &mut result);
                            }
                        }
                    }
                    PagePolicy::UntilGoal { goal, page_cap } => {
                        // Pages are offsets of `page_size`, so it must not change between pages.
                        let page_size = goal.min(MAX_ITEMS_PER_PAGE);
                        for page in 1..=page_cap {
                            if result.records.len() as u32 >= goal {
                                break;
                            }
                            let request = self
                                .request(sweep.keywords(), leg.price, page)
                                .item_count(page_size);
                            let Some(items) = self.fetch_page(&request, &mut result.stats).await else {
                                continue;
                            };
                            if items.is_empty() {
                                debug!(page, "search returned no items; ending sweep");
                                break;
                            }
                            self.collect(&items, shape, &target, &mut result);
                        }
                        result.records.truncate(goal as usize);
                    }
                }
            }

            result.stats.records = result.records.len();
            info!(
                records = result.stats.records,
                pages = result.stats.pages_requested,
                unavailable = result.stats.pages_unavailable,
                malformed = result.stats.items_malformed,
                "sweep finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    fn request(&self, keywords: &str, price: Option<PriceBracket>, page: u32) -> SearchRequest {
        let request = SearchRequest::new(keywords, &self.partner_tag, &self.marketplace).page(page);
        match price {
            Some(bracket) => request.price_range(bracket.min, bracket.max),
            None => request,
        }
    }

    /// `None` when the call produced no data; the page is skipped.
    async fn fetch_page(
        &self,
        request: &SearchRequest,
        stats: &mut SweepStats,
    ) -> Option<Vec<JsonValue>> {
        stats.pages_requested += 1;
        match self.api.search_items(request).await {
            ApiResponse::Data(body) => Some(search_result_items(&body).to_vec()),
            ApiResponse::NoData => {
                stats.pages_unavailable += 1;
                warn!(page = ?request.item_page, "no data for page; skipping");
                None
            }
        }
    }

    fn collect(
        &self,
        items: &[JsonValue],
        shape: RecordShape,
        target: &SweepTarget,
        result: &mut SweepResult,
    ) {
        for item in items {
            result.stats.items_seen += 1;
            match map_item(item, shape, target) {
                Ok(record) => result.records.push(record),
                Err(rejection) => {
                    result.stats.items_malformed += 1;
                    debug!(reason = %rejection, "skipping item");
                }
            }
        }
    }
}

/// Items of a SearchItems response; empty when the body has none.
pub fn search_result_items(body: &JsonValue) -> &[JsonValue] {
    body.pointer(ITEMS)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn map_item(
    item: &JsonValue,
    shape: RecordShape,
    target: &SweepTarget,
) -> Result<ProductRecord, ItemRejection> {
    let price = json_f64(item, PRICE_AMOUNT).ok_or(ItemRejection::MissingPrice)?;
    let title = json_str(item, TITLE).unwrap_or(UNKNOWN_TITLE);

    let mut tags = BTreeSet::new();
    let promotion_percent = json_f64(item, SAVINGS_PERCENTAGE).map(|pct| {
        tags.insert(TagKind::Promo);
        pct.round().max(0.0) as u32
    });
    if json_f64(item, SALES_RANK) == Some(1.0) {
        tags.insert(TagKind::TopSeller);
    }

    let (name, description) = match shape {
        RecordShape::Catalog => (truncate_chars(title, MAX_NAME_CHARS), title.to_string()),
        RecordShape::Article => (
            truncate_words(title, ARTICLE_NAME_WORDS),
            truncate_at_word(title, ARTICLE_DESCRIPTION_CHARS),
        ),
    };

    Ok(ProductRecord {
        name,
        price,
        promotion_percent,
        image_url: json_str(item, IMAGE_URL).map(str::to_string),
        detail_page_url: json_str(item, DETAIL_PAGE_URL).map(str::to_string),
        description,
        categories: target.categories.clone(),
        sub_categories: target.sub_categories.clone(),
        tags,
    })
}

fn json_str<'a>(value: &'a JsonValue, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Numbers, or strings holding a number.
fn json_f64(value: &JsonValue, pointer: &str) -> Option<f64> {
    let number = match value.pointer(pointer)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// First `max_words` whitespace-separated words, single-spaced, at most
/// [`MAX_NAME_CHARS`] characters.
pub fn truncate_words(text: &str, max_words: usize) -> String {
    let words = text
        .split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ");
    truncate_chars(&words, MAX_NAME_CHARS)
}

/// First `max_chars` characters, cut on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

/// Cuts to `max_chars` characters, backs off to the last space, and appends `...` when cut.
pub fn truncate_at_word(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut: String = text.chars().take(max_chars).collect();
    let cut = match cut.rfind(' ') {
        Some(last_space) => &cut[..last_space],
        None => cut.as_str(),
    };
    format!("{}...", cut.trim_end())
}
