//! Core domain model for the storefront catalog ingestion pipeline.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "shelf-core";

/// Title used when an API item carries no display title.
pub const UNKNOWN_TITLE: &str = "Inconnu";

/// Closed set of product labels the ingestion jobs attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TagKind {
    Promo,
    TopSeller,
}

impl TagKind {
    pub const ALL: [TagKind; 2] = [TagKind::Promo, TagKind::TopSeller];

    /// Name of the tag row as the storefront displays it.
    pub fn label(self) -> &'static str {
        match self {
            TagKind::Promo => "Promo",
            TagKind::TopSeller => "Top Ventes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubCategoryRef {
    pub id: i64,
    pub name: String,
}

/// Normalized product built from one API item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub name: String,
    pub price: f64,
    pub promotion_percent: Option<u32>,
    pub image_url: Option<String>,
    pub detail_page_url: Option<String>,
    pub description: String,
    pub categories: Vec<CategoryRef>,
    pub sub_categories: Vec<SubCategoryRef>,
    pub tags: BTreeSet<TagKind>,
}

impl ProductRecord {
    pub fn has_tag(&self, tag: TagKind) -> bool {
        self.tags.contains(&tag)
    }
}

/// When the global catalog was last rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStamp {
    pub refreshed_at: DateTime<Utc>,
}

/// Named search attached to an article, with its own item goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleQuery {
    pub id: i64,
    pub keywords: String,
    pub item_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub name: String,
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Days of the month (1..=31) on which the article's products are refreshed.
    pub refresh_days: BTreeSet<u32>,
    pub queries: Vec<ArticleQuery>,
}

impl Article {
    pub fn is_due_on(&self, day_of_month: u32) -> bool {
        self.refresh_days.contains(&day_of_month)
    }
}

/// Category and sub-category references resolved by name once per job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Taxonomy {
    pub categories: HashMap<String, CategoryRef>,
    pub sub_categories: HashMap<String, SubCategoryRef>,
}

impl Taxonomy {
    pub fn category(&self, name: &str) -> Option<&CategoryRef> {
        self.categories.get(name)
    }

    pub fn sub_category(&self, name: &str) -> Option<&SubCategoryRef> {
        self.sub_categories.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_due_only_on_listed_days() {
        let article = Article {
            id: 7,
            name: "Idées cadeaux".into(),
            refreshed_at: None,
            refresh_days: [1, 15].into_iter().collect(),
            queries: vec![],
        };
        assert!(article.is_due_on(15));
        assert!(!article.is_due_on(16));
    }

    #[test]
    fn tag_labels_match_storefront_rows() {
        assert_eq!(TagKind::Promo.label(), "Promo");
        assert_eq!(TagKind::TopSeller.label(), "Top Ventes");
    }
}
