//! Catalog persistence boundary + single-instance execution locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shelf_core::{Article, ProductRecord, Taxonomy};
use thiserror::Error;

mod lock;
mod memory;
mod pg;

pub use lock::{FileLockProvider, LockError, LockGuard, LockProvider, MemoryLockProvider};
pub use memory::MemoryCatalogStore;
pub use pg::PgCatalogStore;

pub const CRATE_NAME: &str = "shelf-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("article {0} does not exist")]
    UnknownArticle(i64),
    #[error("unreadable {column} for row {id}: {reason}")]
    Corrupt {
        column: &'static str,
        id: i64,
        reason: String,
    },
    #[error("{0}")]
    Injected(String),
}

/// What the ingestion jobs need from the relational store.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Looks up category and sub-category rows by name; unknown names are left out.
    async fn resolve_taxonomy(
        &self,
        category_names: &[String],
        sub_category_names: &[String],
    ) -> Result<Taxonomy, StoreError>;

    /// Empties the product table and its join tables, then replaces the refresh stamp.
    async fn truncate_catalog(&self, refreshed_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Inserts the records as one batch; returns how many were stored.
    async fn insert_products(&self, products: &[ProductRecord]) -> Result<usize, StoreError>;

    /// All articles with their queries, queries ordered by id.
    async fn load_articles(&self) -> Result<Vec<Article>, StoreError>;

    /// Swaps the article's product set for `products` and stamps it, atomically.
    async fn replace_article_products(
        &self,
        article_id: i64,
        products: &[ProductRecord],
        refreshed_at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}
