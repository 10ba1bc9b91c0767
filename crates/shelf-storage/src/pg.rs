use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shelf_core::{
    Article, ArticleQuery, CategoryRef, ProductRecord, SubCategoryRef, TagKind, Taxonomy,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::{info, warn};

use crate::{CatalogStore, StoreError};

/// PostgreSQL store over the storefront's tables (see `sql/schema.sql`).
#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn tag_ids(
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<HashMap<TagKind, i64>, StoreError> {
        let labels: Vec<&str> = TagKind::ALL.iter().map(|t| t.label()).collect();
        let rows: Vec<(i64, String)> = sqlx::query_as("SELECT id, nom FROM tag WHERE nom = ANY($1)")
            .bind(&labels)
            .fetch_all(&mut **tx)
            .await?;

        let mut ids = HashMap::new();
        for kind in TagKind::ALL {
            match rows.iter().find(|(_, nom)| nom == kind.label()) {
                Some((id, _)) => {
                    ids.insert(kind, *id);
                }
                None => warn!(tag = kind.label(), "tag row missing; products keep no such tag"),
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn resolve_taxonomy(
        &self,
        category_names: &[String],
        sub_category_names: &[String],
    ) -> Result<Taxonomy, StoreError> {
        let categories: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, nom FROM categorie WHERE nom = ANY($1) ORDER BY id")
                .bind(category_names)
                .fetch_all(&self.pool)
                .await?;
        let sub_categories: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, nom FROM sous_categorie WHERE nom = ANY($1) ORDER BY id")
                .bind(sub_category_names)
                .fetch_all(&self.pool)
                .await?;

        let mut taxonomy = Taxonomy::default();
        for (id, name) in categories {
            taxonomy
                .categories
                .entry(name.clone())
                .or_insert(CategoryRef { id, name });
        }
        for (id, name) in sub_categories {
            taxonomy
                .sub_categories
                .entry(name.clone())
                .or_insert(SubCategoryRef { id, name });
        }
        Ok(taxonomy)
    }

    async fn truncate_catalog(&self, refreshed_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        // One statement truncates the product table together with every table
        // referencing it, so foreign keys are not checked row by row.
        sqlx::query(
            "TRUNCATE TABLE produit_sous_categorie, produit_tag, produit_categorie, produit, refresh_date RESTART IDENTITY",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO refresh_date (date) VALUES ($1)")
            .bind(refreshed_at.date_naive())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(refreshed_on = %refreshed_at.date_naive(), "catalog truncated");
        Ok(())
    }

    async fn insert_products(&self, products: &[ProductRecord]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let tag_ids = Self::tag_ids(&mut tx).await?;

        for product in products {
            let (produit_id,): (i64,) = sqlx::query_as(
                "INSERT INTO produit (nom, prix, promo, image, lien, description) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            )
            .bind(&product.name)
            .bind(product.price)
            .bind(product.promotion_percent.map(|p| p as i32))
            .bind(&product.image_url)
            .bind(&product.detail_page_url)
            .bind(&product.description)
            .fetch_one(&mut *tx)
            .await?;

            for category in &product.categories {
                sqlx::query("INSERT INTO produit_categorie (produit_id, categorie_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                    .bind(produit_id)
                    .bind(category.id)
                    .execute(&mut *tx)
                    .await?;
            }
            for sub_category in &product.sub_categories {
                sqlx::query("INSERT INTO produit_sous_categorie (produit_id, sous_categorie_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                    .bind(produit_id)
                    .bind(sub_category.id)
                    .execute(&mut *tx)
                    .await?;
            }
            for tag_id in product.tags.iter().filter_map(|t| tag_ids.get(t)) {
                sqlx::query("INSERT INTO produit_tag (produit_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                    .bind(produit_id)
                    .bind(*tag_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(products.len())
    }

    async fn load_articles(&self) -> Result<Vec<Article>, StoreError> {
        let article_rows: Vec<(i64, String, Option<DateTime<Utc>>, Json<serde_json::Value>)> =
            sqlx::query_as(
                "SELECT id, nom, date, jours_rafraichissement FROM article ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await?;
        let query_rows: Vec<(i64, String, i64, i32)> = sqlx::query_as(
            "SELECT id, nom, article_id, nb_produit FROM requetes ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut queries: BTreeMap<i64, Vec<ArticleQuery>> = BTreeMap::new();
        for (id, keywords, article_id, nb_produit) in query_rows {
            queries.entry(article_id).or_default().push(ArticleQuery {
                id,
                keywords,
                item_count: nb_produit.max(0) as u32,
            });
        }

        article_rows
            .into_iter()
            .map(|(id, name, refreshed_at, Json(days))| {
                Ok(Article {
                    id,
                    name,
                    refreshed_at,
                    refresh_days: parse_refresh_days(id, &days)?,
                    queries: queries.remove(&id).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn replace_article_products(
        &self,
        article_id: i64,
        products: &[ProductRecord],
        refreshed_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<(i64,)> = sqlx::query_as("SELECT id FROM article WHERE id = $1 FOR UPDATE")
            .bind(article_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::UnknownArticle(article_id));
        }

        sqlx::query("DELETE FROM produit_article WHERE article_id = $1")
            .bind(article_id)
            .execute(&mut *tx)
            .await?;

        for product in products {
            let tags: Vec<&str> = product.tags.iter().map(|t| t.label()).collect();
            sqlx::query(
                "INSERT INTO produit_article (article_id, nom, description, prix, promo, image, lien, tags) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(article_id)
            .bind(&product.name)
            .bind(&product.description)
            .bind(product.price)
            .bind(product.promotion_percent.map(|p| p as i32))
            .bind(&product.image_url)
            .bind(&product.detail_page_url)
            .bind(Json(tags))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE article SET date = $2 WHERE id = $1")
            .bind(article_id)
            .bind(refreshed_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(products.len())
    }
}

/// Refresh days are stored as a JSON array of integers, or of numeric strings.
fn parse_refresh_days(
    article_id: i64,
    value: &serde_json::Value,
) -> Result<std::collections::BTreeSet<u32>, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        column: "jours_rafraichissement",
        id: article_id,
        reason,
    };
    let items = match value {
        serde_json::Value::Null => return Ok(Default::default()),
        serde_json::Value::Array(items) => items,
        other => return Err(corrupt(format!("expected an array, got {other}"))),
    };

    items
        .iter()
        .map(|item| {
            let day = match item {
                serde_json::Value::Number(n) => n.as_u64(),
                serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            };
            match day {
                Some(day @ 1..=31) => Ok(day as u32),
                _ => Err(corrupt(format!("invalid day of month {item}"))),
            }
        })
        .collect()
}
