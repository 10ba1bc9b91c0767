use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shelf_core::{Article, CategoryRef, ProductRecord, RefreshStamp, SubCategoryRef, Taxonomy};
use tokio::sync::Mutex;

use crate::{CatalogStore, StoreError};

/// In-memory [`CatalogStore`] used by job tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    categories: Vec<CategoryRef>,
    sub_categories: Vec<SubCategoryRef>,
    products: Vec<ProductRecord>,
    refresh: Option<RefreshStamp>,
    articles: BTreeMap<i64, Article>,
    article_products: BTreeMap<i64, Vec<ProductRecord>>,
    fail_inserts: bool,
    failing_articles: BTreeSet<i64>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds category and sub-category rows, numbered from 1 in order.
    pub fn with_taxonomy(mut self, categories: &[&str], sub_categories: &[&str]) -> Self {
        {
            let state = self.state.get_mut();
            state.categories = categories
                .iter()
                .zip(1..)
                .map(|(name, id)| CategoryRef {
                    id,
                    name: name.to_string(),
                })
                .collect();
            state.sub_categories = sub_categories
                .iter()
                .zip(1..)
                .map(|(name, id)| SubCategoryRef {
                    id,
                    name: name.to_string(),
                })
                .collect();
        }
        self
    }

    pub fn with_products(mut self, products: Vec<ProductRecord>) -> Self {
        self.state.get_mut().products = products;
        self
    }

    pub fn with_article(mut self, article: Article, products: Vec<ProductRecord>) -> Self {
        {
            let state = self.state.get_mut();
            state.article_products.insert(article.id, products);
            state.articles.insert(article.id, article);
        }
        self
    }

    /// Makes every later insert fail, to exercise job failure paths.
    pub async fn fail_inserts(&self) {
        self.state.lock().await.fail_inserts = true;
    }

    /// Makes replacements of this one article fail.
    pub async fn fail_article(&self, article_id: i64) {
        self.state.lock().await.failing_articles.insert(article_id);
    }

    pub async fn products(&self) -> Vec<ProductRecord> {
        self.state.lock().await.products.clone()
    }

    pub async fn refresh_stamp(&self) -> Option<RefreshStamp> {
        self.state.lock().await.refresh
    }

    pub async fn article(&self, id: i64) -> Option<Article> {
        self.state.lock().await.articles.get(&id).cloned()
    }

    pub async fn article_products(&self, id: i64) -> Vec<ProductRecord> {
        self.state
            .lock()
            .await
            .article_products
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn resolve_taxonomy(
        &self,
        category_names: &[String],
        sub_category_names: &[String],
    ) -> Result<Taxonomy, StoreError> {
        let state = self.state.lock().await;
        let mut taxonomy = Taxonomy::default();
        for name in category_names {
            if let Some(found) = state.categories.iter().find(|c| &c.name == name) {
                taxonomy.categories.insert(name.clone(), found.clone());
            }
        }
        for name in sub_category_names {
            if let Some(found) = state.sub_categories.iter().find(|c| &c.name == name) {
                taxonomy.sub_categories.insert(name.clone(), found.clone());
            }
        }
        Ok(taxonomy)
    }

    async fn truncate_catalog(&self, refreshed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.products.clear();
        state.refresh = Some(RefreshStamp { refreshed_at });
        Ok(())
    }

    async fn insert_products(&self, products: &[ProductRecord]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_inserts {
            return Err(StoreError::Injected("insert rejected".to_string()));
        }
        state.products.extend_from_slice(products);
        Ok(products.len())
    }

    async fn load_articles(&self) -> Result<Vec<Article>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .articles
            .values()
            .cloned()
            .map(|mut article| {
                article.queries.sort_by_key(|q| q.id);
                article
            })
            .collect())
    }

    async fn replace_article_products(
        &self,
        article_id: i64,
        products: &[ProductRecord],
        refreshed_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_inserts || state.failing_articles.contains(&article_id) {
            return Err(StoreError::Injected("insert rejected".to_string()));
        }
        let article = state
            .articles
            .get_mut(&article_id)
            .ok_or(StoreError::UnknownArticle(article_id))?;
        article.refreshed_at = Some(refreshed_at);
        state
            .article_products
            .insert(article_id, products.to_vec());
        Ok(products.len())
    }
}
