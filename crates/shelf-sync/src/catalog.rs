use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shelf_adapters::{CatalogFetcher, SweepStats};
use shelf_storage::{CatalogStore, LockProvider};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::plan::CatalogPlan;
use crate::{JobOutcome, JobState, StateLog};

pub const CATALOG_LOCK: &str = "shelf-refresh-catalog";

#[derive(Debug, Clone, Serialize)]
pub struct CatalogRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sweeps: usize,
    pub pages_requested: usize,
    pub pages_unavailable: usize,
    pub items_malformed: usize,
    pub products_stored: usize,
}

/// Rebuilds the whole product catalog from the plan's sweeps.
pub struct GlobalCatalogJob {
    store: Arc<dyn CatalogStore>,
    locks: Arc<dyn LockProvider>,
    fetcher: CatalogFetcher,
    plan: CatalogPlan,
}

impl GlobalCatalogJob {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        locks: Arc<dyn LockProvider>,
        fetcher: CatalogFetcher,
        plan: CatalogPlan,
    ) -> Self {
        Self {
            store,
            locks,
            fetcher,
            plan,
        }
    }

    pub async fn run(&self) -> Result<JobOutcome<CatalogRunSummary>> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<JobOutcome<CatalogRunSummary>> {
        let run_id = Uuid::new_v4();
        self.locked_run(run_id, now)
            .instrument(info_span!("catalog_refresh", %run_id))
            .await
    }

    async fn locked_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome<CatalogRunSummary>> {
        let mut states = StateLog::new("catalog");
        let Some(_guard) = self
            .locks
            .try_acquire(CATALOG_LOCK)
            .context("acquiring catalog lock")?
        else {
            info!("another catalog refresh holds the lock; nothing to do");
            return Ok(JobOutcome::Skipped);
        };
        states.enter(JobState::Locked);

        match self.refresh(run_id, now, &mut states).await {
            Ok(summary) => {
                states.enter(JobState::Done);
                info!(products = summary.products_stored, "catalog refresh finished");
                Ok(JobOutcome::Completed(summary))
            }
            Err(err) => {
                states.enter(JobState::Failed);
                error!(error = %format!("{err:#}"), "catalog refresh failed");
                Err(err)
            }
        }
    }

    async fn refresh(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        states: &mut StateLog,
    ) -> Result<CatalogRunSummary> {
        let taxonomy = self
            .store
            .resolve_taxonomy(&self.plan.category_names(), &self.plan.sub_category_names())
            .await
            .context("resolving categories")?;
        let sweeps = self.plan.sweeps(&taxonomy);

        // The catalog stays empty until the sweeps below are persisted.
        states.enter(JobState::Truncating);
        self.store
            .truncate_catalog(now)
            .await
            .context("truncating catalog")?;

        states.enter(JobState::Fetching);
        let mut records = Vec::new();
        let mut stats = SweepStats::default();
        for sweep in &sweeps {
            let result = self.fetcher.run(sweep).await;
            stats.pages_requested += result.stats.pages_requested;
            stats.pages_unavailable += result.stats.pages_unavailable;
            stats.items_malformed += result.stats.items_malformed;
            records.extend(result.records);
        }

        states.enter(JobState::Persisting);
        let products_stored = self
            .store
            .insert_products(&records)
            .await
            .context("inserting products")?;

        Ok(CatalogRunSummary {
            run_id,
            started_at: now,
            finished_at: Utc::now(),
            sweeps: sweeps.len(),
            pages_requested: stats.pages_requested,
            pages_unavailable: stats.pages_unavailable,
            items_malformed: stats.items_malformed,
            products_stored,
        })
    }
}
