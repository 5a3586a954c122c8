//! The ETL reconciler: compares a requested date range against what the fact
//! store already holds, fetches the missing days from the provider, and
//! upserts them idempotently. One bad day never aborts the others.

use std::collections::BTreeSet;
use std::sync::Arc;

use adsight_adapters::{AdsProvider, ProviderError, ProviderRow};
use adsight_core::{DateRange, EntityLevel, EntityMetadata, PerformanceFact};
use adsight_storage::{BackoffPolicy, FactStore, StoreError};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub account_id: String,
    pub level: EntityLevel,
    pub range: DateRange,
    /// Refetch every day in range, present or not.
    pub force: bool,
    /// Materialize a placeholder fact for zero-activity days, and re-check
    /// days previously logged as zero-row.
    pub include_zero_impressions: bool,
}

/// One day that could not be reconciled, after retries where applicable.
#[derive(Debug, Clone, Serialize)]
pub struct DayFailure {
    pub day: NaiveDate,
    pub message: String,
    pub transient: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub rows_upserted: u64,
    pub days_fetched: u64,
    pub days_skipped: u64,
    pub errors: Vec<DayFailure>,
}

impl ReconcileSummary {
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }
}

pub struct EtlReconciler {
    provider: Arc<dyn AdsProvider>,
    store: Arc<dyn FactStore>,
    backoff: BackoffPolicy,
    day_concurrency: usize,
    shutdown: watch::Receiver<bool>,
}

impl EtlReconciler {
    pub fn new(
        provider: Arc<dyn AdsProvider>,
        store: Arc<dyn FactStore>,
        backoff: BackoffPolicy,
        day_concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            provider,
            store,
            backoff,
            day_concurrency: day_concurrency.max(1),
            shutdown,
        }
    }

    /// A receiver that never signals shutdown, for callers without a
    /// process-level lifecycle.
    pub fn never_shutdown() -> watch::Receiver<bool> {
        // the receiver keeps returning the last value after the sender drops
        let (_tx, rx) = watch::channel(false);
        rx
    }

    pub fn store(&self) -> &Arc<dyn FactStore> {
        &self.store
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Days in `range` with neither fact rows nor a sync-log entry. Days
    /// logged as checked-but-empty count as present, so repeated backfills
    /// do not refetch known-quiet days.
    pub async fn missing_days(
        &self,
        account_id: &str,
        level: EntityLevel,
        range: DateRange,
    ) -> Result<Vec<NaiveDate>, StoreError> {
        let fact_days = self.store.fact_days(account_id, level, range).await?;
        let checked = self.store.checked_days(account_id, level, range).await?;
        let present: BTreeSet<NaiveDate> = fact_days.union(&checked).copied().collect();
        Ok(range.days().filter(|d| !present.contains(d)).collect())
    }

    pub async fn reconcile(&self, req: &ReconcileRequest) -> Result<ReconcileSummary, StoreError> {
        let targets: Vec<NaiveDate> = if req.force {
            req.range.days().collect()
        } else {
            let fact_days = self
                .store
                .fact_days(&req.account_id, req.level, req.range)
                .await?;
            // with include_zero_impressions, checked-but-empty days are
            // re-fetched so the placeholder row can be materialized
            let checked = if req.include_zero_impressions {
                BTreeSet::new()
            } else {
                self.store
                    .checked_days(&req.account_id, req.level, req.range)
                    .await?
            };
            req.range
                .days()
                .filter(|d| !fact_days.contains(d) && !checked.contains(d))
                .collect()
        };

        let mut summary = ReconcileSummary {
            days_skipped: (req.range.num_days() as u64).saturating_sub(targets.len() as u64),
            ..Default::default()
        };
        if targets.is_empty() {
            debug!(
                account_id = %req.account_id,
                level = %req.level,
                "nothing to reconcile, all days present"
            );
            return Ok(summary);
        }

        let semaphore = Arc::new(Semaphore::new(self.day_concurrency));
        let mut tasks: JoinSet<Result<u64, DayFailure>> = JoinSet::new();

        for day in targets {
            if *self.shutdown.borrow() {
                info!(%day, "shutdown signalled, not starting further days");
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            let provider = Arc::clone(&self.provider);
            let store = Arc::clone(&self.store);
            let backoff = self.backoff;
            let account_id = req.account_id.clone();
            let level = req.level;
            let include_zero = req.include_zero_impressions;

            tasks.spawn(async move {
                let _permit = permit;
                reconcile_day(&*provider, &*store, &account_id, level, day, backoff, include_zero)
                    .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(rows)) => {
                    summary.days_fetched += 1;
                    summary.rows_upserted += rows;
                }
                Ok(Err(failure)) => {
                    warn!(day = %failure.day, transient = failure.transient, "day failed: {}", failure.message);
                    summary.errors.push(failure);
                }
                Err(join_err) => {
                    warn!("reconcile worker panicked: {join_err}");
                }
            }
        }
        summary.errors.sort_by_key(|e| e.day);

        info!(
            account_id = %req.account_id,
            level = %req.level,
            rows_upserted = summary.rows_upserted,
            days_fetched = summary.days_fetched,
            days_skipped = summary.days_skipped,
            errors = summary.errors.len(),
            "reconcile finished"
        );
        Ok(summary)
    }
}

async fn reconcile_day(
    provider: &dyn AdsProvider,
    store: &dyn FactStore,
    account_id: &str,
    level: EntityLevel,
    day: NaiveDate,
    backoff: BackoffPolicy,
    include_zero: bool,
) -> Result<u64, DayFailure> {
    let rows = fetch_day_with_retry(provider, account_id, level, day, backoff)
        .await
        .map_err(|err| DayFailure {
            day,
            message: err.to_string(),
            transient: err.is_transient(),
        })?;

    let store_failure = |err: StoreError| DayFailure {
        day,
        message: format!("store: {err}"),
        transient: false,
    };

    let mut upserted = 0u64;
    if rows.is_empty() {
        if include_zero {
            upserted = store
                .upsert_facts(&[PerformanceFact::zero(account_id, level, day)])
                .await
                .map_err(store_failure)?;
        }
    } else {
        let facts: Vec<PerformanceFact> = rows.iter().map(|r| r.fact.clone()).collect();
        upserted = store.upsert_facts(&facts).await.map_err(store_failure)?;

        let metadata: Vec<EntityMetadata> = rows
            .iter()
            .filter(|r| r.entity_name.is_some() || r.entity_status.is_some())
            .map(|r| EntityMetadata {
                account_id: account_id.to_string(),
                level,
                entity_id: r.fact.entity_id.clone(),
                name: r.entity_name.clone(),
                status: r.entity_status.clone(),
                updated_at: Utc::now(),
            })
            .collect();
        if !metadata.is_empty() {
            store.upsert_metadata(&metadata).await.map_err(store_failure)?;
        }
    }

    store
        .mark_day_checked(account_id, level, day, rows.len() as u64)
        .await
        .map_err(store_failure)?;
    Ok(upserted)
}

/// Fetch one day, retrying transient provider errors with capped exponential
/// backoff. Permanent errors surface on the first attempt.
pub(crate) async fn fetch_day_with_retry(
    provider: &dyn AdsProvider,
    account_id: &str,
    level: EntityLevel,
    day: NaiveDate,
    policy: BackoffPolicy,
) -> Result<Vec<ProviderRow>, ProviderError> {
    let mut attempt = 0usize;
    loop {
        match provider.fetch_day(account_id, level, day).await {
            Ok(rows) => return Ok(rows),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(%day, attempt, ?delay, "transient provider error, backing off: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
