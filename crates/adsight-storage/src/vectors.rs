//! The Vector Store: embedding records with staleness metadata and
//! nearest-neighbor search.
//!
//! Two Postgres implementations exist behind the same trait, selected once
//! at startup by capability detection: `PgNativeVectorStore` orders by
//! pgvector cosine distance in SQL, `PgScanVectorStore` pulls the filtered
//! candidate set and scans in process. The scan path is O(n) in candidate
//! count and acceptable only below ~1e5 rows.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::info;

use adsight_core::{EmbeddingKey, EmbeddingRecord, EntityLevel};

use crate::StoreError;

/// Optional entity_type/scope restriction applied to search and staleness
/// queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub entity_type: Option<EntityLevel>,
    pub scope_id: Option<String>,
}

impl SearchFilter {
    pub fn matches(&self, record: &EmbeddingRecord) -> bool {
        if let Some(t) = self.entity_type {
            if record.entity_type != t {
                return false;
            }
        }
        if let Some(scope) = &self.scope_id {
            if &record.scope_id != scope {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: EmbeddingRecord,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn get(&self, key: &EmbeddingKey) -> Result<Option<EmbeddingRecord>, StoreError>;

    /// Insert-or-replace one record. Rejects vectors whose dimensionality
    /// disagrees with the store; never truncates or pads.
    async fn upsert(&self, record: EmbeddingRecord) -> Result<(), StoreError>;

    /// Top-k by cosine similarity, descending, ties broken by more recent
    /// computed_at.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError>;

    /// Records whose computed_at is older than the cutoff, oldest first.
    async fn stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<EmbeddingRecord>, StoreError>;

    /// Dimensionality of stored vectors, None while empty.
    async fn dimensions(&self) -> Result<Option<usize>, StoreError>;
}

/// Cosine similarity in [-1, 1]; zero for empty or zero-norm inputs.
/// Callers must have verified equal lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

fn rank_scored(mut scored: Vec<ScoredRecord>, k: usize) -> Vec<ScoredRecord> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.record.computed_at.cmp(&a.record.computed_at))
            .then_with(|| a.record.entity_id.cmp(&b.record.entity_id))
    });
    scored.truncate(k);
    scored
}

// ---------------------------------------------------------------------------
// In-memory store (tests, databaseless mode); also the reference
// brute-force scan.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryVectorsInner {
    records: HashMap<EmbeddingKey, EmbeddingRecord>,
    dimensions: Option<usize>,
}

#[derive(Clone, Default)]
pub struct MemoryVectorStore {
    inner: Arc<RwLock<MemoryVectorsInner>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn get(&self, key: &EmbeddingKey) -> Result<Option<EmbeddingRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.records.get(key).cloned())
    }

    async fn upsert(&self, record: EmbeddingRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.dimensions {
            Some(dim) if dim != record.vector.len() => {
                return Err(StoreError::DimensionMismatch {
                    expected: dim,
                    actual: record.vector.len(),
                });
            }
            None => inner.dimensions = Some(record.vector.len()),
            _ => {}
        }
        inner.records.insert(record.key(), record);
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        let inner = self.inner.read().await;
        if let Some(dim) = inner.dimensions {
            if dim != query.len() {
                return Err(StoreError::DimensionMismatch {
                    expected: dim,
                    actual: query.len(),
                });
            }
        }
        let scored = inner
            .records
            .values()
            .filter(|r| filter.matches(r))
            .map(|r| ScoredRecord {
                score: cosine_similarity(query, &r.vector),
                record: r.clone(),
            })
            .collect();
        Ok(rank_scored(scored, k))
    }

    async fn stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<_> = inner
            .records
            .values()
            .filter(|r| filter.matches(r) && r.computed_at < older_than)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.computed_at.cmp(&b.computed_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn dimensions(&self) -> Result<Option<usize>, StoreError> {
        Ok(self.inner.read().await.dimensions)
    }
}

// ---------------------------------------------------------------------------
// Postgres stores
// ---------------------------------------------------------------------------

const EMBEDDING_COLUMNS: &str =
    "entity_type, entity_id, scope_id, embedding, dim, source_text_hash, computed_at, model, title, body";

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<EmbeddingRecord, StoreError> {
    let entity_type_raw: String = row.try_get("entity_type")?;
    let entity_type = entity_type_raw
        .parse()
        .map_err(|_| StoreError::Decode(format!("unknown stored entity type '{entity_type_raw}'")))?;
    let embedding_json: serde_json::Value = row.try_get("embedding")?;
    let vector: Vec<f32> = serde_json::from_value(embedding_json)?;
    Ok(EmbeddingRecord {
        entity_type,
        entity_id: row.try_get("entity_id")?,
        scope_id: row.try_get("scope_id")?,
        vector,
        source_text_hash: row.try_get("source_text_hash")?,
        computed_at: row.try_get("computed_at")?,
        model: row.try_get("model")?,
        title: row.try_get("title")?,
        text: row.try_get("body")?,
    })
}

/// pgvector text literal: `[0.1,0.2,...]`.
fn vector_literal(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 10 + 2);
    out.push('[');
    for (i, v) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!("{v}"));
    }
    out.push(']');
    out
}

async fn upsert_pg(
    pool: &PgPool,
    record: &EmbeddingRecord,
    expected_dim: usize,
    with_vector_column: bool,
) -> Result<(), StoreError> {
    if record.vector.len() != expected_dim {
        return Err(StoreError::DimensionMismatch {
            expected: expected_dim,
            actual: record.vector.len(),
        });
    }
    let embedding_json = serde_json::to_value(&record.vector)?;
    if with_vector_column {
        sqlx::query(
            r#"
            INSERT INTO ad_embeddings
                (entity_type, entity_id, scope_id, embedding, embedding_vec,
                 dim, source_text_hash, computed_at, model, title, body)
            VALUES ($1, $2, $3, $4, $5::vector, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (entity_type, entity_id, scope_id)
            DO UPDATE SET
                embedding = EXCLUDED.embedding,
                embedding_vec = EXCLUDED.embedding_vec,
                dim = EXCLUDED.dim,
                source_text_hash = EXCLUDED.source_text_hash,
                computed_at = EXCLUDED.computed_at,
                model = EXCLUDED.model,
                title = EXCLUDED.title,
                body = EXCLUDED.body
            "#,
        )
        .bind(record.entity_type.as_str())
        .bind(&record.entity_id)
        .bind(&record.scope_id)
        .bind(&embedding_json)
        .bind(vector_literal(&record.vector))
        .bind(record.vector.len() as i32)
        .bind(&record.source_text_hash)
        .bind(record.computed_at)
        .bind(&record.model)
        .bind(&record.title)
        .bind(&record.text)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            r#"
            INSERT INTO ad_embeddings
                (entity_type, entity_id, scope_id, embedding,
                 dim, source_text_hash, computed_at, model, title, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (entity_type, entity_id, scope_id)
            DO UPDATE SET
                embedding = EXCLUDED.embedding,
                dim = EXCLUDED.dim,
                source_text_hash = EXCLUDED.source_text_hash,
                computed_at = EXCLUDED.computed_at,
                model = EXCLUDED.model,
                title = EXCLUDED.title,
                body = EXCLUDED.body
            "#,
        )
        .bind(record.entity_type.as_str())
        .bind(&record.entity_id)
        .bind(&record.scope_id)
        .bind(&embedding_json)
        .bind(record.vector.len() as i32)
        .bind(&record.source_text_hash)
        .bind(record.computed_at)
        .bind(&record.model)
        .bind(&record.title)
        .bind(&record.text)
        .execute(pool)
        .await?;
    }
    Ok(())
}

async fn get_pg(pool: &PgPool, key: &EmbeddingKey) -> Result<Option<EmbeddingRecord>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {EMBEDDING_COLUMNS} FROM ad_embeddings \
         WHERE entity_type = $1 AND entity_id = $2 AND scope_id = $3"
    ))
    .bind(key.entity_type.as_str())
    .bind(&key.entity_id)
    .bind(&key.scope_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

async fn stale_pg(
    pool: &PgPool,
    older_than: DateTime<Utc>,
    limit: usize,
    filter: &SearchFilter,
) -> Result<Vec<EmbeddingRecord>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {EMBEDDING_COLUMNS} FROM ad_embeddings \
          WHERE computed_at < $1 \
            AND ($2::text IS NULL OR entity_type = $2) \
            AND ($3::text IS NULL OR scope_id = $3) \
          ORDER BY computed_at ASC \
          LIMIT $4"
    ))
    .bind(older_than)
    .bind(filter.entity_type.map(|t| t.as_str()))
    .bind(&filter.scope_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    rows.iter().map(record_from_row).collect()
}

async fn dimensions_pg(pool: &PgPool) -> Result<Option<usize>, StoreError> {
    let row = sqlx::query("SELECT dim FROM ad_embeddings LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row
        .map(|r| r.try_get::<i32, _>("dim"))
        .transpose()?
        .map(|d| d as usize))
}

/// Native nearest-neighbor search via the pgvector `<=>` cosine operator.
#[derive(Clone)]
pub struct PgNativeVectorStore {
    pool: PgPool,
    expected_dim: usize,
}

#[async_trait]
impl VectorStore for PgNativeVectorStore {
    async fn get(&self, key: &EmbeddingKey) -> Result<Option<EmbeddingRecord>, StoreError> {
        get_pg(&self.pool, key).await
    }

    async fn upsert(&self, record: EmbeddingRecord) -> Result<(), StoreError> {
        upsert_pg(&self.pool, &record, self.expected_dim, true).await
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        if query.len() != self.expected_dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.expected_dim,
                actual: query.len(),
            });
        }
        let rows = sqlx::query(&format!(
            "SELECT {EMBEDDING_COLUMNS}, \
                    1 - (embedding_vec <=> $1::vector) AS score \
               FROM ad_embeddings \
              WHERE ($2::text IS NULL OR entity_type = $2) \
                AND ($3::text IS NULL OR scope_id = $3) \
              ORDER BY embedding_vec <=> $1::vector ASC, computed_at DESC \
              LIMIT $4"
        ))
        .bind(vector_literal(query))
        .bind(filter.entity_type.map(|t| t.as_str()))
        .bind(&filter.scope_id)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let record = record_from_row(row)?;
                let score: f64 = row.try_get("score")?;
                Ok(ScoredRecord {
                    record,
                    score: score as f32,
                })
            })
            .collect()
    }

    async fn stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<EmbeddingRecord>, StoreError> {
        stale_pg(&self.pool, older_than, limit, filter).await
    }

    async fn dimensions(&self) -> Result<Option<usize>, StoreError> {
        dimensions_pg(&self.pool).await
    }
}

/// Fallback when pgvector is absent: pull the filtered candidates and rank
/// in process. Same results, O(n) latency.
#[derive(Clone)]
pub struct PgScanVectorStore {
    pool: PgPool,
    expected_dim: usize,
}

#[async_trait]
impl VectorStore for PgScanVectorStore {
    async fn get(&self, key: &EmbeddingKey) -> Result<Option<EmbeddingRecord>, StoreError> {
        get_pg(&self.pool, key).await
    }

    async fn upsert(&self, record: EmbeddingRecord) -> Result<(), StoreError> {
        upsert_pg(&self.pool, &record, self.expected_dim, false).await
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        if query.len() != self.expected_dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.expected_dim,
                actual: query.len(),
            });
        }
        let rows = sqlx::query(&format!(
            "SELECT {EMBEDDING_COLUMNS} FROM ad_embeddings \
              WHERE ($1::text IS NULL OR entity_type = $1) \
                AND ($2::text IS NULL OR scope_id = $2)"
        ))
        .bind(filter.entity_type.map(|t| t.as_str()))
        .bind(&filter.scope_id)
        .fetch_all(&self.pool)
        .await?;

        let scored = rows
            .iter()
            .map(|row| {
                let record = record_from_row(row)?;
                Ok(ScoredRecord {
                    score: cosine_similarity(query, &record.vector),
                    record,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(rank_scored(scored, k))
    }

    async fn stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<EmbeddingRecord>, StoreError> {
        stale_pg(&self.pool, older_than, limit, filter).await
    }

    async fn dimensions(&self) -> Result<Option<usize>, StoreError> {
        dimensions_pg(&self.pool).await
    }
}

/// Detect pgvector once at startup and hand back the matching
/// implementation. With the extension present the typed column is created
/// (idempotently) and native ordering is used; otherwise every search is an
/// in-process scan.
pub async fn connect_pg_vector_store(
    pool: PgPool,
    dimensions: usize,
) -> Result<Arc<dyn VectorStore>, StoreError> {
    let has_vector: bool =
        sqlx::query("SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'vector') AS present")
            .fetch_one(&pool)
            .await?
            .try_get("present")?;

    if has_vector {
        sqlx::query(&format!(
            "ALTER TABLE ad_embeddings ADD COLUMN IF NOT EXISTS embedding_vec vector({dimensions})"
        ))
        .execute(&pool)
        .await?;
        info!(dimensions, "vector store: pgvector native nearest-neighbor");
        Ok(Arc::new(PgNativeVectorStore {
            pool,
            expected_dim: dimensions,
        }))
    } else {
        info!(dimensions, "vector store: pgvector absent, using in-process scan");
        Ok(Arc::new(PgScanVectorStore {
            pool,
            expected_dim: dimensions,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(entity_id: &str, vector: Vec<f32>, computed_hour: u32) -> EmbeddingRecord {
        EmbeddingRecord {
            entity_type: EntityLevel::Campaign,
            entity_id: entity_id.into(),
            scope_id: "7414394764".into(),
            vector,
            source_text_hash: format!("hash-{entity_id}"),
            computed_at: Utc
                .with_ymd_and_hms(2025, 6, 1, computed_hour, 0, 0)
                .single()
                .unwrap(),
            model: "text-embedding-3-small".into(),
            title: None,
            text: format!("campaign {entity_id}"),
        }
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        let sim = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn search_ranks_by_similarity_descending() {
        let store = MemoryVectorStore::new();
        store.upsert(record("far", vec![0.0, 1.0], 1)).await.unwrap();
        store.upsert(record("near", vec![1.0, 0.05], 1)).await.unwrap();
        store.upsert(record("exact", vec![1.0, 0.0], 1)).await.unwrap();

        let hits = store
            .search(&[1.0, 0.0], 2, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.entity_id, "exact");
        assert_eq!(hits[1].record.entity_id, "near");
    }

    #[tokio::test]
    async fn search_is_deterministic_with_ties_broken_by_recency() {
        let store = MemoryVectorStore::new();
        // identical vectors -> identical scores; newer computed_at wins
        store.upsert(record("older", vec![1.0, 0.0], 1)).await.unwrap();
        store.upsert(record("newer", vec![1.0, 0.0], 9)).await.unwrap();

        for _ in 0..5 {
            let hits = store
                .search(&[1.0, 0.0], 2, &SearchFilter::default())
                .await
                .unwrap();
            assert_eq!(hits[0].record.entity_id, "newer");
            assert_eq!(hits[1].record.entity_id, "older");
        }
    }

    #[tokio::test]
    async fn search_respects_type_and_scope_filters() {
        let store = MemoryVectorStore::new();
        let mut other_scope = record("c1", vec![1.0, 0.0], 1);
        other_scope.scope_id = "999".into();
        store.upsert(other_scope).await.unwrap();
        store.upsert(record("c2", vec![1.0, 0.0], 1)).await.unwrap();

        let filter = SearchFilter {
            entity_type: Some(EntityLevel::Campaign),
            scope_id: Some("7414394764".into()),
        };
        let hits = store.search(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.entity_id, "c2");
    }

    #[tokio::test]
    async fn upsert_rejects_dimension_mismatch() {
        let store = MemoryVectorStore::new();
        store.upsert(record("c1", vec![1.0, 0.0], 1)).await.unwrap();
        let err = store
            .upsert(record("c2", vec![1.0, 0.0, 0.0], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn query_dimension_mismatch_is_rejected_not_coerced() {
        let store = MemoryVectorStore::new();
        store.upsert(record("c1", vec![1.0, 0.0], 1)).await.unwrap();
        let err = store
            .search(&[1.0, 0.0, 0.0], 1, &SearchFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn stale_returns_oldest_first_up_to_limit() {
        let store = MemoryVectorStore::new();
        store.upsert(record("a", vec![1.0, 0.0], 1)).await.unwrap();
        store.upsert(record("b", vec![1.0, 0.0], 2)).await.unwrap();
        store.upsert(record("c", vec![1.0, 0.0], 3)).await.unwrap();

        let cutoff = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).single().unwrap();
        let stale = store
            .stale(cutoff, 2, &SearchFilter::default())
            .await
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn vector_literal_is_bracketed_csv() {
        assert_eq!(vector_literal(&[0.5, -1.0, 2.0]), "[0.5,-1,2]");
    }
}
