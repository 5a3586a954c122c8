//! Core domain model for adsight: performance facts, entity metadata,
//! and embedding records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "adsight-core";

/// Reporting granularity of an advertising entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityLevel {
    Account,
    Campaign,
    AdGroup,
    Ad,
    Keyword,
    SearchTerm,
}

impl EntityLevel {
    pub const ALL: [EntityLevel; 6] = [
        EntityLevel::Account,
        EntityLevel::Campaign,
        EntityLevel::AdGroup,
        EntityLevel::Ad,
        EntityLevel::Keyword,
        EntityLevel::SearchTerm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityLevel::Account => "account",
            EntityLevel::Campaign => "campaign",
            EntityLevel::AdGroup => "ad_group",
            EntityLevel::Ad => "ad",
            EntityLevel::Keyword => "keyword",
            EntityLevel::SearchTerm => "search_term",
        }
    }
}

impl fmt::Display for EntityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity level: {0}")]
pub struct ParseLevelError(pub String);

impl FromStr for EntityLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "account" | "customer" => Ok(EntityLevel::Account),
            "campaign" => Ok(EntityLevel::Campaign),
            "ad_group" | "adgroup" => Ok(EntityLevel::AdGroup),
            "ad" => Ok(EntityLevel::Ad),
            "keyword" => Ok(EntityLevel::Keyword),
            "search_term" | "searchterm" => Ok(EntityLevel::SearchTerm),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid date range: end {end} precedes start {start}")]
pub struct InvalidDateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, InvalidDateRange> {
        if end < start {
            return Err(InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }

    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Iterate every day in the range, ascending.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        let start = self.start;
        (0..self.num_days()).map(move |offset| start + Duration::days(offset))
    }
}

/// Composite key of a performance fact row. Upserts replace, never duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub account_id: String,
    pub level: EntityLevel,
    pub entity_id: String,
    pub date: NaiveDate,
}

/// One day of performance measures for one entity. The provider is the
/// source of truth: measure columns are overwritten on refetch, never
/// accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceFact {
    pub account_id: String,
    pub level: EntityLevel,
    pub entity_id: String,
    pub date: NaiveDate,
    pub impressions: u64,
    pub clicks: u64,
    pub cost_micros: i64,
    pub conversions: f64,
    pub conversions_value: f64,
    /// Account-level device mix, absent at finer levels.
    #[serde(default)]
    pub device: Option<String>,
    /// Account-level network mix, absent at finer levels.
    #[serde(default)]
    pub network: Option<String>,
    /// Measures outside the fixed column set (interactions, ctr, ...).
    #[serde(default)]
    pub metrics_json: Option<serde_json::Value>,
}

impl PerformanceFact {
    pub fn key(&self) -> FactKey {
        FactKey {
            account_id: self.account_id.clone(),
            level: self.level,
            entity_id: self.entity_id.clone(),
            date: self.date,
        }
    }

    /// Placeholder row for a day the provider reported no activity,
    /// materialized only when zero-impression rows are requested.
    pub fn zero(account_id: &str, level: EntityLevel, date: NaiveDate) -> Self {
        Self {
            account_id: account_id.to_string(),
            level,
            entity_id: account_id.to_string(),
            date,
            impressions: 0,
            clicks: 0,
            cost_micros: 0,
            conversions: 0.0,
            conversions_value: 0.0,
            device: None,
            network: None,
            metrics_json: None,
        }
    }
}

/// Denormalized display name/status per entity, last-write-wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub account_id: String,
    pub level: EntityLevel,
    pub entity_id: String,
    pub name: Option<String>,
    pub status: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Key of an embedding record: one vector per entity per owning scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EmbeddingKey {
    pub entity_type: EntityLevel,
    pub entity_id: String,
    pub scope_id: String,
}

/// A stored vector plus the staleness metadata the freshness loop needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub entity_type: EntityLevel,
    pub entity_id: String,
    pub scope_id: String,
    pub vector: Vec<f32>,
    /// sha256 of the canonical text; equal hash means re-embed is a no-op.
    pub source_text_hash: String,
    pub computed_at: DateTime<Utc>,
    pub model: String,
    pub title: Option<String>,
    pub text: String,
}

impl EmbeddingRecord {
    pub fn key(&self) -> EmbeddingKey {
        EmbeddingKey {
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            scope_id: self.scope_id.clone(),
        }
    }
}

/// Textual snapshot of one entity as supplied by the provider, before
/// canonical-text rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityText {
    pub entity_id: String,
    pub title: Option<String>,
    pub body: String,
}

/// Deterministic rendering of an entity snapshot used as embedding input.
/// Identical snapshots must produce byte-identical text, since the content
/// hash of this string is the re-embed short-circuit.
pub fn canonical_text(level: EntityLevel, snapshot: &EntityText) -> String {
    match &snapshot.title {
        Some(title) => format!("{} {} '{}'. {}", level, snapshot.entity_id, title, snapshot.body),
        None => format!("{} {}. {}", level, snapshot.entity_id, snapshot.body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn level_round_trips_through_str() {
        for level in EntityLevel::ALL {
            assert_eq!(level.as_str().parse::<EntityLevel>().unwrap(), level);
        }
        assert!("banner".parse::<EntityLevel>().is_err());
    }

    #[test]
    fn date_range_is_inclusive() {
        let range = DateRange::new(d("2025-01-01"), d("2025-01-03")).unwrap();
        let days: Vec<_> = range.days().collect();
        assert_eq!(days, vec![d("2025-01-01"), d("2025-01-02"), d("2025-01-03")]);
        assert_eq!(range.num_days(), 3);
        assert!(range.contains(d("2025-01-03")));
    }

    #[test]
    fn single_day_range_is_valid() {
        let range = DateRange::new(d("2025-06-15"), d("2025-06-15")).unwrap();
        assert_eq!(range.num_days(), 1);
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!(DateRange::new(d("2025-01-10"), d("2025-01-01")).is_err());
    }

    #[test]
    fn canonical_text_is_deterministic() {
        let snap = EntityText {
            entity_id: "123".into(),
            title: Some("Brand - Search".into()),
            body: "Status ENABLED. MTD impressions 1000, clicks 50.".into(),
        };
        let a = canonical_text(EntityLevel::Campaign, &snap);
        let b = canonical_text(EntityLevel::Campaign, &snap);
        assert_eq!(a, b);
        assert!(a.starts_with("campaign 123 'Brand - Search'."));
    }
}
