//! The relational Fact Store: daily performance rows, entity metadata,
//! and the per-day sync log used for gap detection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::debug;

use adsight_core::{DateRange, EntityLevel, EntityMetadata, FactKey, PerformanceFact};

use crate::StoreError;

/// Persistence seam for performance facts. The ETL Reconciler is the sole
/// writer; the Report Assembler reads.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Insert-or-overwrite by (account, level, entity, day). Returns the
    /// number of rows written.
    async fn upsert_facts(&self, rows: &[PerformanceFact]) -> Result<u64, StoreError>;

    /// Last-write-wins refresh of entity names/statuses.
    async fn upsert_metadata(&self, rows: &[EntityMetadata]) -> Result<u64, StoreError>;

    /// Days in `range` that have at least one fact row.
    async fn fact_days(
        &self,
        account_id: &str,
        level: EntityLevel,
        range: DateRange,
    ) -> Result<BTreeSet<NaiveDate>, StoreError>;

    /// Days in `range` already reconciled against the provider, zero-row
    /// days included.
    async fn checked_days(
        &self,
        account_id: &str,
        level: EntityLevel,
        range: DateRange,
    ) -> Result<BTreeSet<NaiveDate>, StoreError>;

    async fn mark_day_checked(
        &self,
        account_id: &str,
        level: EntityLevel,
        date: NaiveDate,
        row_count: u64,
    ) -> Result<(), StoreError>;

    /// All facts in `range`, ordered by date ascending then entity_id.
    async fn facts_in_range(
        &self,
        account_id: &str,
        level: EntityLevel,
        range: DateRange,
    ) -> Result<Vec<PerformanceFact>, StoreError>;

    async fn metadata_for(
        &self,
        account_id: &str,
        level: EntityLevel,
        entity_ids: &[String],
    ) -> Result<HashMap<String, EntityMetadata>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory fact store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryFactsInner {
    facts: BTreeMap<FactKey, PerformanceFact>,
    metadata: HashMap<(String, EntityLevel, String), EntityMetadata>,
    checked: BTreeMap<(String, EntityLevel), BTreeMap<NaiveDate, u64>>,
}

/// RwLock-backed store for tests and databaseless deployments. The write
/// lock serializes same-key upserts.
#[derive(Clone, Default)]
pub struct MemoryFactStore {
    inner: Arc<RwLock<MemoryFactsInner>>,
}

impl MemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FactStore for MemoryFactStore {
    async fn upsert_facts(&self, rows: &[PerformanceFact]) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        for row in rows {
            inner.facts.insert(row.key(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_metadata(&self, rows: &[EntityMetadata]) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        for row in rows {
            inner.metadata.insert(
                (row.account_id.clone(), row.level, row.entity_id.clone()),
                row.clone(),
            );
        }
        Ok(rows.len() as u64)
    }

    async fn fact_days(
        &self,
        account_id: &str,
        level: EntityLevel,
        range: DateRange,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .facts
            .values()
            .filter(|f| {
                f.account_id == account_id && f.level == level && range.contains(f.date)
            })
            .map(|f| f.date)
            .collect())
    }

    async fn checked_days(
        &self,
        account_id: &str,
        level: EntityLevel,
        range: DateRange,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .checked
            .get(&(account_id.to_string(), level))
            .map(|days| {
                days.keys()
                    .filter(|d| range.contains(**d))
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_day_checked(
        &self,
        account_id: &str,
        level: EntityLevel,
        date: NaiveDate,
        row_count: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .checked
            .entry((account_id.to_string(), level))
            .or_default()
            .insert(date, row_count);
        Ok(())
    }

    async fn facts_in_range(
        &self,
        account_id: &str,
        level: EntityLevel,
        range: DateRange,
    ) -> Result<Vec<PerformanceFact>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<_> = inner
            .facts
            .values()
            .filter(|f| {
                f.account_id == account_id && f.level == level && range.contains(f.date)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.entity_id.cmp(&b.entity_id)));
        Ok(out)
    }

    async fn metadata_for(
        &self,
        account_id: &str,
        level: EntityLevel,
        entity_ids: &[String],
    ) -> Result<HashMap<String, EntityMetadata>, StoreError> {
        let inner = self.inner.read().await;
        let mut out = HashMap::new();
        for id in entity_ids {
            let key = (account_id.to_string(), level, id.clone());
            if let Some(meta) = inner.metadata.get(&key) {
                out.insert(id.clone(), meta.clone());
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Postgres fact store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgFactStore {
    pool: PgPool,
}

impl PgFactStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_level(raw: &str) -> Result<EntityLevel, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Decode(format!("unknown stored entity level '{raw}'")))
}

fn fact_from_row(row: &sqlx::postgres::PgRow) -> Result<PerformanceFact, StoreError> {
    let level: String = row.try_get("level")?;
    Ok(PerformanceFact {
        account_id: row.try_get("account_id")?,
        level: parse_level(&level)?,
        entity_id: row.try_get("entity_id")?,
        date: row.try_get("perf_date")?,
        impressions: row.try_get::<i64, _>("impressions")?.max(0) as u64,
        clicks: row.try_get::<i64, _>("clicks")?.max(0) as u64,
        cost_micros: row.try_get("cost_micros")?,
        conversions: row.try_get("conversions")?,
        conversions_value: row.try_get("conversions_value")?,
        device: row.try_get("device")?,
        network: row.try_get("network")?,
        metrics_json: row.try_get("metrics_json")?,
    })
}

#[async_trait]
impl FactStore for PgFactStore {
    async fn upsert_facts(&self, rows: &[PerformanceFact]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO ads_daily_perf
                    (account_id, level, entity_id, perf_date,
                     impressions, clicks, cost_micros, conversions,
                     conversions_value, device, network, metrics_json, pulled_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now())
                ON CONFLICT (account_id, level, entity_id, perf_date)
                DO UPDATE SET
                    impressions = EXCLUDED.impressions,
                    clicks = EXCLUDED.clicks,
                    cost_micros = EXCLUDED.cost_micros,
                    conversions = EXCLUDED.conversions,
                    conversions_value = EXCLUDED.conversions_value,
                    device = EXCLUDED.device,
                    network = EXCLUDED.network,
                    metrics_json = EXCLUDED.metrics_json,
                    pulled_at = now()
                "#,
            )
            .bind(&row.account_id)
            .bind(row.level.as_str())
            .bind(&row.entity_id)
            .bind(row.date)
            .bind(row.impressions as i64)
            .bind(row.clicks as i64)
            .bind(row.cost_micros)
            .bind(row.conversions)
            .bind(row.conversions_value)
            .bind(&row.device)
            .bind(&row.network)
            .bind(&row.metrics_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(rows = rows.len(), "upserted performance facts");
        Ok(rows.len() as u64)
    }

    async fn upsert_metadata(&self, rows: &[EntityMetadata]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO ads_entity (account_id, level, entity_id, name, status, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (account_id, level, entity_id)
                DO UPDATE SET
                    name = EXCLUDED.name,
                    status = EXCLUDED.status,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&row.account_id)
            .bind(row.level.as_str())
            .bind(&row.entity_id)
            .bind(&row.name)
            .bind(&row.status)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn fact_days(
        &self,
        account_id: &str,
        level: EntityLevel,
        range: DateRange,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT perf_date
              FROM ads_daily_perf
             WHERE account_id = $1 AND level = $2
               AND perf_date BETWEEN $3 AND $4
            "#,
        )
        .bind(account_id)
        .bind(level.as_str())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<NaiveDate, _>("perf_date").map_err(StoreError::from))
            .collect()
    }

    async fn checked_days(
        &self,
        account_id: &str,
        level: EntityLevel,
        range: DateRange,
    ) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT perf_date
              FROM sync_day_log
             WHERE account_id = $1 AND level = $2
               AND perf_date BETWEEN $3 AND $4
            "#,
        )
        .bind(account_id)
        .bind(level.as_str())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<NaiveDate, _>("perf_date").map_err(StoreError::from))
            .collect()
    }

    async fn mark_day_checked(
        &self,
        account_id: &str,
        level: EntityLevel,
        date: NaiveDate,
        row_count: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_day_log (account_id, level, perf_date, row_count, checked_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id, level, perf_date)
            DO UPDATE SET row_count = EXCLUDED.row_count, checked_at = EXCLUDED.checked_at
            "#,
        )
        .bind(account_id)
        .bind(level.as_str())
        .bind(date)
        .bind(row_count as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn facts_in_range(
        &self,
        account_id: &str,
        level: EntityLevel,
        range: DateRange,
    ) -> Result<Vec<PerformanceFact>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, level, entity_id, perf_date,
                   impressions, clicks, cost_micros, conversions,
                   conversions_value, device, network, metrics_json
              FROM ads_daily_perf
             WHERE account_id = $1 AND level = $2
               AND perf_date BETWEEN $3 AND $4
             ORDER BY perf_date ASC, entity_id ASC
            "#,
        )
        .bind(account_id)
        .bind(level.as_str())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fact_from_row).collect()
    }

    async fn metadata_for(
        &self,
        account_id: &str,
        level: EntityLevel,
        entity_ids: &[String],
    ) -> Result<HashMap<String, EntityMetadata>, StoreError> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT account_id, level, entity_id, name, status, updated_at
              FROM ads_entity
             WHERE account_id = $1 AND level = $2 AND entity_id = ANY($3)
            "#,
        )
        .bind(account_id)
        .bind(level.as_str())
        .bind(entity_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let level_raw: String = row.try_get("level")?;
            let meta = EntityMetadata {
                account_id: row.try_get("account_id")?,
                level: parse_level(&level_raw)?,
                entity_id: row.try_get("entity_id")?,
                name: row.try_get("name")?,
                status: row.try_get("status")?,
                updated_at: row.try_get("updated_at")?,
            };
            out.insert(meta.entity_id.clone(), meta);
        }
        Ok(out)
    }
}
