//! The report assembler: serves a date range from the fact store, optionally
//! backfilling absent days first, or straight from the provider when asked
//! for a live read.

use std::str::FromStr;
use std::sync::Arc;

use adsight_adapters::{AdsProvider, ProviderError};
use adsight_core::{DateRange, EntityLevel, PerformanceFact};
use adsight_storage::{FactStore, StoreError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::reconcile::{fetch_day_with_retry, EtlReconciler, ReconcileRequest, ReconcileSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportSource {
    /// Fact store, backfilled first when fill_missing is set.
    Auto,
    /// Fact store only; absent days stay absent.
    Db,
    /// Provider only, nothing persisted.
    Live,
}

impl FromStr for ReportSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ReportSource::Auto),
            "db" => Ok(ReportSource::Db),
            "live" => Ok(ReportSource::Live),
            other => Err(format!("unknown report source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Csv,
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            other => Err(format!("unknown report format '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub account_id: String,
    pub level: EntityLevel,
    pub range: DateRange,
    pub source: ReportSource,
    pub fill_missing: bool,
    pub include_zero_impressions: bool,
}

/// One output row: a fact joined with its display metadata. An entity with
/// no stored metadata renders with a null name, it is never dropped.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub date: NaiveDate,
    pub entity_id: String,
    pub name: Option<String>,
    pub status: Option<String>,
    pub impressions: u64,
    pub clicks: u64,
    pub cost_micros: i64,
    pub conversions: f64,
    pub conversions_value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub rows: Vec<ReportRow>,
    /// Present when fill_missing triggered a reconcile; carries its
    /// partial-failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<ReconcileSummary>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("live fetch failed: {0}")]
    Provider(#[from] ProviderError),
}

pub struct ReportAssembler {
    store: Arc<dyn FactStore>,
    provider: Arc<dyn AdsProvider>,
    reconciler: Arc<EtlReconciler>,
}

impl ReportAssembler {
    pub fn new(
        store: Arc<dyn FactStore>,
        provider: Arc<dyn AdsProvider>,
        reconciler: Arc<EtlReconciler>,
    ) -> Self {
        Self {
            store,
            provider,
            reconciler,
        }
    }

    pub async fn get_report(&self, req: &ReportRequest) -> Result<Report, ReportError> {
        match req.source {
            ReportSource::Db => Ok(Report {
                rows: self.rows_from_store(req).await?,
                sync: None,
            }),
            ReportSource::Live => Ok(Report {
                rows: self.rows_from_provider(req).await?,
                sync: None,
            }),
            ReportSource::Auto => {
                let sync = if req.fill_missing {
                    Some(
                        self.reconciler
                            .reconcile(&ReconcileRequest {
                                account_id: req.account_id.clone(),
                                level: req.level,
                                range: req.range,
                                force: false,
                                include_zero_impressions: req.include_zero_impressions,
                            })
                            .await?,
                    )
                } else {
                    None
                };
                Ok(Report {
                    rows: self.rows_from_store(req).await?,
                    sync,
                })
            }
        }
    }

    async fn rows_from_store(&self, req: &ReportRequest) -> Result<Vec<ReportRow>, ReportError> {
        let facts = self
            .store
            .facts_in_range(&req.account_id, req.level, req.range)
            .await?;

        let mut entity_ids: Vec<String> = facts.iter().map(|f| f.entity_id.clone()).collect();
        entity_ids.sort();
        entity_ids.dedup();
        let metadata = self
            .store
            .metadata_for(&req.account_id, req.level, &entity_ids)
            .await?;

        Ok(facts
            .into_iter()
            .map(|fact| {
                let meta = metadata.get(&fact.entity_id);
                to_row(fact, meta.and_then(|m| m.name.clone()), meta.and_then(|m| m.status.clone()))
            })
            .collect())
    }

    /// Live read: provider fetch per day with the usual retry policy, never
    /// persisted. Any day failing after retries fails the whole report.
    async fn rows_from_provider(&self, req: &ReportRequest) -> Result<Vec<ReportRow>, ReportError> {
        let mut rows = Vec::new();
        for day in req.range.days() {
            let fetched = fetch_day_with_retry(
                &*self.provider,
                &req.account_id,
                req.level,
                day,
                *self.reconciler_backoff(),
            )
            .await?;
            for provider_row in fetched {
                rows.push(to_row(
                    provider_row.fact,
                    provider_row.entity_name,
                    provider_row.entity_status,
                ));
            }
        }
        rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.entity_id.cmp(&b.entity_id)));
        Ok(rows)
    }

    fn reconciler_backoff(&self) -> &adsight_storage::BackoffPolicy {
        // live reads reuse the reconciler's fetch policy
        self.reconciler.backoff()
    }
}

fn to_row(fact: PerformanceFact, name: Option<String>, status: Option<String>) -> ReportRow {
    ReportRow {
        date: fact.date,
        entity_id: fact.entity_id,
        name,
        status,
        impressions: fact.impressions,
        clicks: fact.clicks,
        cost_micros: fact.cost_micros,
        conversions: fact.conversions,
        conversions_value: fact.conversions_value,
    }
}

/// CSV rendering with the minimal quoting the column set needs.
pub fn to_csv(rows: &[ReportRow]) -> String {
    let mut out = String::from(
        "date,entity_id,name,status,impressions,clicks,cost_micros,conversions,conversions_value\n",
    );
    for row in rows {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{}\n",
            row.date,
            csv_field(&row.entity_id),
            csv_field(row.name.as_deref().unwrap_or("")),
            csv_field(row.status.as_deref().unwrap_or("")),
            row.impressions,
            row.clicks,
            row.cost_micros,
            row.conversions,
            row.conversions_value,
        ));
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
