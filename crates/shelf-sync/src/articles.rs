use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use shelf_adapters::{CatalogFetcher, Sweep};
use shelf_core::Article;
use shelf_storage::{CatalogStore, LockProvider};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{JobOutcome, JobState, StateLog};

pub const ARTICLES_LOCK: &str = "shelf-refresh-articles";

#[derive(Debug, Clone, Serialize)]
pub struct ArticleRunSummary {
    pub run_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub day_of_month: u32,
    /// Articles due today and processed.
    pub articles_scanned: usize,
    pub articles_refreshed: usize,
    pub articles_kept: usize,
    /// Articles whose replacement failed; their previous set is intact.
    pub articles_failed: Vec<i64>,
    pub products_inserted: usize,
}

/// Refreshes the product sets of articles scheduled for today.
pub struct ArticleCatalogJob {
    store: Arc<dyn CatalogStore>,
    locks: Arc<dyn LockProvider>,
    fetcher: CatalogFetcher,
    timezone: Tz,
}

impl ArticleCatalogJob {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        locks: Arc<dyn LockProvider>,
        fetcher: CatalogFetcher,
        timezone: Tz,
    ) -> Self {
        Self {
            store,
            locks,
            fetcher,
            timezone,
        }
    }

    pub async fn run(&self) -> Result<JobOutcome<ArticleRunSummary>> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<JobOutcome<ArticleRunSummary>> {
        let run_id = Uuid::new_v4();
        self.locked_run(run_id, now)
            .instrument(info_span!("article_refresh", %run_id))
            .await
    }

    async fn locked_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome<ArticleRunSummary>> {
        let mut states = StateLog::new("articles");
        let Some(_guard) = self
            .locks
            .try_acquire(ARTICLES_LOCK)
            .context("acquiring articles lock")?
        else {
            info!("another article refresh holds the lock; nothing to do");
            return Ok(JobOutcome::Skipped);
        };
        states.enter(JobState::Locked);

        match self.refresh(run_id, now, &mut states).await {
            Ok(summary) => {
                states.enter(JobState::Done);
                info!(
                    articles = summary.articles_scanned,
                    products = summary.products_inserted,
                    "article refresh finished"
                );
                Ok(JobOutcome::Completed(summary))
            }
            Err(err) => {
                states.enter(JobState::Failed);
                error!(error = %format!("{err:#}"), "article refresh failed");
                Err(err)
            }
        }
    }

    async fn refresh(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        states: &mut StateLog,
    ) -> Result<ArticleRunSummary> {
        states.enter(JobState::Scanning);
        let day_of_month = now.with_timezone(&self.timezone).day();
        let due: Vec<Article> = self
            .store
            .load_articles()
            .await
            .context("loading articles")?
            .into_iter()
            .filter(|article| article.is_due_on(day_of_month))
            .collect();

        let mut summary = ArticleRunSummary {
            run_id,
            run_at: now,
            day_of_month,
            articles_scanned: due.len(),
            articles_refreshed: 0,
            articles_kept: 0,
            articles_failed: Vec::new(),
            products_inserted: 0,
        };
        if due.is_empty() {
            info!(day_of_month, "no article due today");
            return Ok(summary);
        }

        for article in &due {
            info!(article_id = article.id, name = %article.name, "refreshing article");
            states.enter(JobState::Fetching);
            let mut products = Vec::new();
            for query in &article.queries {
                let sweep = Sweep::Article {
                    keywords: query.keywords.clone(),
                    item_goal: query.item_count,
                };
                products.extend(self.fetcher.run(&sweep).await.records);
            }

            states.enter(JobState::ReplacingOrSkipping);
            if products.is_empty() {
                summary.articles_kept += 1;
                info!(article_id = article.id, "no new products; previous set kept");
                continue;
            }
            match self
                .store
                .replace_article_products(article.id, &products, now)
                .await
            {
                Ok(inserted) => {
                    summary.articles_refreshed += 1;
                    summary.products_inserted += inserted;
                    info!(article_id = article.id, inserted, "article products replaced");
                }
                Err(err) => {
                    summary.articles_failed.push(article.id);
                    warn!(article_id = article.id, error = %err, "replacing article products failed; previous set kept");
                }
            }
        }

        // Every due article has been attempted; a store failure still fails the run.
        if !summary.articles_failed.is_empty() {
            info!(
                articles = summary.articles_scanned,
                refreshed = summary.articles_refreshed,
                products = summary.products_inserted,
                "article refresh incomplete"
            );
            bail!(
                "replacing products failed for articles {:?}",
                summary.articles_failed
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{item, page, FakeSearch};
    use chrono::TimeZone;
    use shelf_core::{ArticleQuery, ProductRecord};
    use shelf_paapi::ApiResponse;
    use shelf_storage::{MemoryCatalogStore, MemoryLockProvider};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, hour, 0, 0).single().unwrap()
    }

    fn article(id: i64, days: &[u32], queries: &[(i64, &str, u32)]) -> Article {
        Article {
            id,
            name: format!("Article {id}"),
            refreshed_at: None,
            refresh_days: days.iter().copied().collect(),
            queries: queries
                .iter()
                .map(|(id, keywords, item_count)| ArticleQuery {
                    id: *id,
                    keywords: keywords.to_string(),
                    item_count: *item_count,
                })
                .collect(),
        }
    }

    fn previous_set() -> Vec<ProductRecord> {
        vec![shelf_adapters::map_item(
            &item("Ancien jouet en bois", 15.0),
            shelf_adapters::RecordShape::Article,
            &Default::default(),
        )
        .unwrap()]
    }

    fn job(
        store: &Arc<MemoryCatalogStore>,
        locks: &Arc<MemoryLockProvider>,
        api: &Arc<FakeSearch>,
    ) -> ArticleCatalogJob {
        ArticleCatalogJob::new(
            store.clone(),
            locks.clone(),
            CatalogFetcher::new(api.clone(), "shelf-21", "www.amazon.fr"),
            chrono_tz::Europe::Paris,
        )
    }

    fn completed(outcome: JobOutcome<ArticleRunSummary>) -> ArticleRunSummary {
        match outcome {
            JobOutcome::Completed(summary) => summary,
            JobOutcome::Skipped => panic!("expected a completed run"),
        }
    }

    #[tokio::test]
    async fn nothing_due_does_no_work() {
        let store = Arc::new(
            MemoryCatalogStore::new().with_article(article(1, &[3], &[(1, "lego", 4)]), previous_set()),
        );
        let locks = Arc::new(MemoryLockProvider::new());
        let api = FakeSearch::answering(|_| page(vec![item("Lego", 30.0)]));

        let summary = completed(job(&store, &locks, &api).run_at(at(19, 8)).await.unwrap());

        assert_eq!(summary.articles_scanned, 0);
        assert_eq!(summary.products_inserted, 0);
        assert!(api.requests().is_empty());
        assert_eq!(store.article_products(1).await, previous_set());
    }

    #[tokio::test]
    async fn failing_query_keeps_previous_set_and_stamp() {
        let store = Arc::new(
            MemoryCatalogStore::new().with_article(article(1, &[19], &[(1, "lego", 4)]), previous_set()),
        );
        let locks = Arc::new(MemoryLockProvider::new());
        let api = FakeSearch::answering(|_| ApiResponse::NoData);

        let summary = completed(job(&store, &locks, &api).run_at(at(19, 8)).await.unwrap());

        assert_eq!(summary.articles_scanned, 1);
        assert_eq!(summary.articles_kept, 1);
        assert_eq!(summary.products_inserted, 0);
        assert_eq!(store.article_products(1).await, previous_set());
        assert_eq!(store.article(1).await.unwrap().refreshed_at, None);
    }

    #[tokio::test]
    async fn three_items_replace_the_set_and_stamp_run_time() {
        let store = Arc::new(
            MemoryCatalogStore::new().with_article(article(1, &[19], &[(1, "lego", 3)]), previous_set()),
        );
        let locks = Arc::new(MemoryLockProvider::new());
        let api = FakeSearch::answering(|_| {
            page(vec![
                item("Lego City Caserne", 49.0),
                item("Lego Friends Maison", 39.0),
                item("Lego Technic Grue", 89.0),
            ])
        });

        let summary = completed(job(&store, &locks, &api).run_at(at(19, 8)).await.unwrap());

        assert_eq!(summary.products_inserted, 3);
        let names: Vec<_> = store
            .article_products(1)
            .await
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, ["Lego City Caserne", "Lego Friends Maison", "Lego Technic Grue"]);
        assert_eq!(store.article(1).await.unwrap().refreshed_at, Some(at(19, 8)));
        assert_eq!(api.requests()[0].item_count, Some(3));
    }

    #[tokio::test]
    async fn queries_run_in_id_order_and_concatenate() {
        let store = Arc::new(MemoryCatalogStore::new().with_article(
            article(2, &[19], &[(8, "puzzle", 1), (5, "lego", 1)]),
            vec![],
        ));
        let locks = Arc::new(MemoryLockProvider::new());
        let api = FakeSearch::answering(|request| {
            page(vec![item(&format!("{} premier", request.keywords), 10.0)])
        });

        let summary = completed(job(&store, &locks, &api).run_at(at(19, 8)).await.unwrap());

        assert_eq!(summary.products_inserted, 2);
        let keywords: Vec<_> = api.requests().into_iter().map(|r| r.keywords).collect();
        assert_eq!(keywords, ["lego", "puzzle"]);
    }

    #[tokio::test]
    async fn second_identical_run_gives_identical_set() {
        let store = Arc::new(
            MemoryCatalogStore::new().with_article(article(1, &[19], &[(1, "lego", 2)]), previous_set()),
        );
        let locks = Arc::new(MemoryLockProvider::new());
        let api = FakeSearch::answering(|_| page(vec![item("Lego A", 1.0), item("Lego B", 2.0)]));
        let job = job(&store, &locks, &api);

        job.run_at(at(19, 8)).await.unwrap();
        let first = store.article_products(1).await;
        job.run_at(at(19, 9)).await.unwrap();

        assert_eq!(store.article_products(1).await, first);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn due_day_follows_configured_timezone() {
        // 23:30 UTC on 31 October is already 1 November in Paris.
        let now = Utc.with_ymd_and_hms(2026, 10, 31, 23, 30, 0).single().unwrap();
        let store = Arc::new(
            MemoryCatalogStore::new().with_article(article(1, &[1], &[(1, "lego", 1)]), vec![]),
        );
        let locks = Arc::new(MemoryLockProvider::new());
        let api = FakeSearch::answering(|_| page(vec![item("Lego", 5.0)]));

        let summary = completed(job(&store, &locks, &api).run_at(now).await.unwrap());

        assert_eq!(summary.day_of_month, 1);
        assert_eq!(summary.articles_refreshed, 1);
    }

    #[tokio::test]
    async fn failed_article_does_not_stop_later_articles() {
        let store = Arc::new(
            MemoryCatalogStore::new()
                .with_article(article(1, &[19], &[(1, "lego", 1)]), previous_set())
                .with_article(article(2, &[19], &[(2, "puzzle", 1)]), vec![]),
        );
        store.fail_article(1).await;
        let locks = Arc::new(MemoryLockProvider::new());
        let api = FakeSearch::answering(|request| page(vec![item(&request.keywords, 5.0)]));

        let err = job(&store, &locks, &api).run_at(at(19, 8)).await.unwrap_err();

        assert!(format!("{err:#}").contains("[1]"));
        assert_eq!(store.article_products(1).await, previous_set());
        assert_eq!(store.article(1).await.unwrap().refreshed_at, None);
        assert_eq!(store.article_products(2).await.len(), 1);
        assert_eq!(store.article(2).await.unwrap().refreshed_at, Some(at(19, 8)));
        assert!(!locks.is_held(ARTICLES_LOCK));
    }

    #[tokio::test]
    async fn store_failure_releases_lock_and_fails_run() {
        let store = Arc::new(
            MemoryCatalogStore::new().with_article(article(1, &[19], &[(1, "lego", 1)]), vec![]),
        );
        store.fail_inserts().await;
        let locks = Arc::new(MemoryLockProvider::new());
        let api = FakeSearch::answering(|_| page(vec![item("Lego", 5.0)]));

        assert!(job(&store, &locks, &api).run_at(at(19, 8)).await.is_err());
        assert!(!locks.is_held(ARTICLES_LOCK));

        let _held = locks.try_acquire(ARTICLES_LOCK).unwrap().unwrap();
        let outcome = job(&store, &locks, &api).run_at(at(19, 8)).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped));
    }
}
