//! The embedding pipeline: renders entities to canonical text, skips
//! unchanged content by hash, and writes fresh vectors. Writes to one
//! embedding key are mutually exclusive; disjoint keys proceed in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use adsight_adapters::{AdsProvider, Embedder};
use adsight_core::{canonical_text, EmbeddingKey, EmbeddingRecord, EntityLevel, EntityText};
use adsight_storage::{content_hash, SearchFilter, StoreError, VectorStore};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

const DEFAULT_EMBED_BATCH: usize = 64;

/// Canonical-text candidate for one entity.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entity_id: String,
    pub title: Option<String>,
    pub text: String,
}

impl Candidate {
    pub fn from_snapshot(level: EntityLevel, snapshot: &EntityText) -> Self {
        Self {
            entity_id: snapshot.entity_id.clone(),
            title: snapshot.title.clone(),
            text: canonical_text(level, snapshot),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateFailure {
    pub entity_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbedReport {
    pub embedded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<CandidateFailure>,
}

impl EmbedReport {
    pub fn merge(&mut self, other: EmbedReport) {
        self.embedded.extend(other.embedded);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Dimensionality or storage failures are fatal to the batch, they are
    /// never silently coerced.
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("embedding model mismatch: configured '{configured}', requested '{requested}'")]
    ModelMismatch { configured: String, requested: String },
    /// A stored vector was computed by a different model than the active
    /// embedder; mixing vector spaces needs a forced re-embed, never a
    /// silent overwrite-or-skip.
    #[error("stored embedding model '{stored}' does not match active model '{active}'")]
    StoredModel { active: String, stored: String },
}

pub struct EmbeddingPipeline {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    provider: Arc<dyn AdsProvider>,
    key_locks: Mutex<HashMap<EmbeddingKey, Arc<Mutex<()>>>>,
    batch_size: usize,
    shutdown: watch::Receiver<bool>,
}

impl EmbeddingPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        provider: Arc<dyn AdsProvider>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            provider,
            key_locks: Mutex::new(HashMap::new()),
            batch_size: DEFAULT_EMBED_BATCH,
            shutdown,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn vectors(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    async fn lock_key(&self, key: EmbeddingKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().await;
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    /// Embed the candidates that need it. A candidate whose stored hash
    /// matches its canonical text is skipped unless `force`; an embedder
    /// failure marks its chunk failed and the rest proceed.
    pub async fn ensure_embedded(
        &self,
        entity_type: EntityLevel,
        scope_id: &str,
        candidates: Vec<Candidate>,
        force: bool,
    ) -> Result<EmbedReport, PipelineError> {
        let mut report = EmbedReport::default();

        // hold every key lock for the duration of the batch. Duplicate
        // entity ids are collapsed first so a batch cannot self-deadlock,
        // and locks are taken in key order so two overlapping batches
        // cannot deadlock each other either.
        let mut seen = HashSet::new();
        let mut candidates: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| seen.insert(c.entity_id.clone()))
            .collect();
        candidates.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        let mut guards = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            guards.push(
                self.lock_key(EmbeddingKey {
                    entity_type,
                    entity_id: candidate.entity_id.clone(),
                    scope_id: scope_id.to_string(),
                })
                .await,
            );
        }

        let mut pending = Vec::new();
        for candidate in candidates {
            let hash = content_hash(&candidate.text);
            let key = EmbeddingKey {
                entity_type,
                entity_id: candidate.entity_id.clone(),
                scope_id: scope_id.to_string(),
            };
            let existing = self.vectors.get(&key).await?;
            if !force {
                if let Some(existing) = &existing {
                    if existing.model != self.embedder.model() {
                        return Err(PipelineError::StoredModel {
                            active: self.embedder.model().to_string(),
                            stored: existing.model.clone(),
                        });
                    }
                }
                if existing.as_ref().is_some_and(|r| r.source_text_hash == hash) {
                    debug!(entity_id = %candidate.entity_id, "content unchanged, skipping embed");
                    report.skipped.push(candidate.entity_id);
                    continue;
                }
            }
            pending.push((candidate, hash));
        }

        for chunk in pending.chunks(self.batch_size) {
            if *self.shutdown.borrow() {
                info!("shutdown signalled, not starting further embed chunks");
                break;
            }
            let texts: Vec<String> = chunk.iter().map(|(c, _)| c.text.clone()).collect();
            let vectors = match self.embedder.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(err) => {
                    warn!(chunk = chunk.len(), "embed batch failed: {err}");
                    report.failed.extend(chunk.iter().map(|(c, _)| CandidateFailure {
                        entity_id: c.entity_id.clone(),
                        message: err.to_string(),
                    }));
                    continue;
                }
            };

            for ((candidate, hash), vector) in chunk.iter().zip(vectors) {
                self.vectors
                    .upsert(EmbeddingRecord {
                        entity_type,
                        entity_id: candidate.entity_id.clone(),
                        scope_id: scope_id.to_string(),
                        vector,
                        source_text_hash: hash.clone(),
                        computed_at: Utc::now(),
                        model: self.embedder.model().to_string(),
                        title: candidate.title.clone(),
                        text: candidate.text.clone(),
                    })
                    .await?;
                report.embedded.push(candidate.entity_id.clone());
            }
        }

        drop(guards);
        Ok(report)
    }

    /// On-demand backfill: snapshot entities from the provider per level and
    /// embed whatever changed. `lookback_days` windows search terms.
    #[allow(clippy::too_many_arguments)]
    pub async fn backfill(
        &self,
        scope_id: &str,
        levels: &[EntityLevel],
        include_search_terms: bool,
        lookback_days: Option<u32>,
        limit: Option<usize>,
        model: Option<&str>,
        force: bool,
    ) -> Result<EmbedReport, PipelineError> {
        if let Some(requested) = model {
            if requested != self.embedder.model() {
                return Err(PipelineError::ModelMismatch {
                    configured: self.embedder.model().to_string(),
                    requested: requested.to_string(),
                });
            }
        }

        let mut targets: Vec<EntityLevel> = levels.to_vec();
        if include_search_terms && !targets.contains(&EntityLevel::SearchTerm) {
            targets.push(EntityLevel::SearchTerm);
        }

        let mut report = EmbedReport::default();
        let mut remaining = limit.unwrap_or(usize::MAX);
        for level in targets {
            if remaining == 0 {
                break;
            }
            let lookback = (level == EntityLevel::SearchTerm)
                .then(|| lookback_days.unwrap_or(30));
            let snapshots = match self.provider.fetch_entity_text(level, scope_id, lookback).await {
                Ok(snapshots) => snapshots,
                Err(err) => {
                    warn!(%level, scope_id, "entity snapshot fetch failed: {err}");
                    report.failed.push(CandidateFailure {
                        entity_id: format!("{level}:*"),
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            let candidates: Vec<Candidate> = snapshots
                .iter()
                .take(remaining)
                .map(|s| Candidate::from_snapshot(level, s))
                .collect();
            remaining = remaining.saturating_sub(candidates.len());
            report.merge(self.ensure_embedded(level, scope_id, candidates, force).await?);
        }

        info!(
            scope_id,
            embedded = report.embedded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "embedding backfill finished"
        );
        Ok(report)
    }

    /// One freshness pass: re-render entities whose stored vector is older
    /// than `max_age` and embed the ones whose content actually changed.
    /// Age makes a record eligible; only a hash change (or `force`) spends
    /// an embedder call. When the filter names a concrete entity type and
    /// scope, entities that have never been embedded are picked up too,
    /// within the same `limit`.
    pub async fn refresh_stale(
        &self,
        max_age: Duration,
        limit: usize,
        filter: &SearchFilter,
        force: bool,
    ) -> Result<EmbedReport, PipelineError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(24));
        let stale = self.vectors.stale(cutoff, limit, filter).await?;
        let mut first_sight_budget = limit.saturating_sub(stale.len());

        // group by (type, scope) so each provider snapshot is fetched once
        let mut groups: HashMap<(EntityLevel, String), Vec<String>> = HashMap::new();
        for record in stale {
            groups
                .entry((record.entity_type, record.scope_id))
                .or_default()
                .push(record.entity_id);
        }
        // record-less entities are only discoverable under a fully scoped
        // filter; make sure their group exists even with no stale rows
        let scoped = match (filter.entity_type, filter.scope_id.as_ref()) {
            (Some(entity_type), Some(scope_id)) => {
                groups.entry((entity_type, scope_id.clone())).or_default();
                Some((entity_type, scope_id.clone()))
            }
            _ => None,
        };
        if groups.is_empty() {
            debug!("no stale embedding records");
            return Ok(EmbedReport::default());
        }

        let mut report = EmbedReport::default();
        for ((entity_type, scope_id), entity_ids) in groups {
            if *self.shutdown.borrow() {
                info!("shutdown signalled, stopping freshness pass");
                break;
            }
            let lookback = (entity_type == EntityLevel::SearchTerm).then_some(30);
            let snapshots = match self
                .provider
                .fetch_entity_text(entity_type, &scope_id, lookback)
                .await
            {
                Ok(snapshots) => snapshots,
                Err(err) => {
                    warn!(%entity_type, scope_id, "entity snapshot fetch failed: {err}");
                    report.failed.extend(entity_ids.into_iter().map(|entity_id| {
                        CandidateFailure {
                            entity_id,
                            message: err.to_string(),
                        }
                    }));
                    continue;
                }
            };
            let by_id: HashMap<&str, &EntityText> =
                snapshots.iter().map(|s| (s.entity_id.as_str(), s)).collect();

            let mut candidates = Vec::new();
            for entity_id in &entity_ids {
                match by_id.get(entity_id.as_str()) {
                    Some(snapshot) => {
                        candidates.push(Candidate::from_snapshot(entity_type, snapshot))
                    }
                    // entity no longer exists upstream; its record stays as-is
                    None => report.skipped.push(entity_id.clone()),
                }
            }

            if scoped.as_ref() == Some(&(entity_type, scope_id.clone())) {
                for snapshot in &snapshots {
                    if first_sight_budget == 0 {
                        break;
                    }
                    if entity_ids.iter().any(|id| id == &snapshot.entity_id) {
                        continue;
                    }
                    let key = EmbeddingKey {
                        entity_type,
                        entity_id: snapshot.entity_id.clone(),
                        scope_id: scope_id.clone(),
                    };
                    if self.vectors.get(&key).await?.is_none() {
                        candidates.push(Candidate::from_snapshot(entity_type, snapshot));
                        first_sight_budget -= 1;
                    }
                }
            }

            report.merge(
                self.ensure_embedded(entity_type, &scope_id, candidates, force)
                    .await?,
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::EtlReconciler;
    use adsight_adapters::{EmbedError, ProviderError, ProviderRow};
    use adsight_storage::MemoryVectorStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic embedder that counts batch calls. Vectors are derived
    /// from text length so different texts land in different directions.
    struct CountingEmbedder {
        calls: AtomicUsize,
        fail_on: Option<String>,
    }

    impl CountingEmbedder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_on: None,
            })
        }

        fn failing_on(needle: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_on: Some(needle.to_string()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model(&self) -> &str {
            "test-embedder-1"
        }

        fn dimensions(&self) -> usize {
            3
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(needle) = &self.fail_on {
                if texts.iter().any(|t| t.contains(needle)) {
                    return Err(EmbedError::Rejected("poisoned batch".into()));
                }
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0, 0.0])
                .collect())
        }
    }

    struct SnapshotProvider {
        snapshots: HashMap<EntityLevel, Vec<EntityText>>,
    }

    impl SnapshotProvider {
        fn new(snapshots: Vec<(EntityLevel, Vec<EntityText>)>) -> Arc<Self> {
            Arc::new(Self {
                snapshots: snapshots.into_iter().collect(),
            })
        }

        fn empty() -> Arc<Self> {
            Self::new(vec![])
        }
    }

    #[async_trait]
    impl AdsProvider for SnapshotProvider {
        async fn fetch_day(
            &self,
            _account_id: &str,
            _level: EntityLevel,
            _date: NaiveDate,
        ) -> Result<Vec<ProviderRow>, ProviderError> {
            Ok(Vec::new())
        }

        async fn fetch_entity_text(
            &self,
            entity_type: EntityLevel,
            _scope_id: &str,
            _lookback_days: Option<u32>,
        ) -> Result<Vec<EntityText>, ProviderError> {
            Ok(self.snapshots.get(&entity_type).cloned().unwrap_or_default())
        }
    }

    fn snapshot(entity_id: &str, body: &str) -> EntityText {
        EntityText {
            entity_id: entity_id.into(),
            title: None,
            body: body.into(),
        }
    }

    fn candidates(level: EntityLevel, snaps: &[EntityText]) -> Vec<Candidate> {
        snaps.iter().map(|s| Candidate::from_snapshot(level, s)).collect()
    }

    fn pipeline(embedder: Arc<CountingEmbedder>) -> EmbeddingPipeline {
        EmbeddingPipeline::new(
            embedder,
            Arc::new(MemoryVectorStore::new()),
            SnapshotProvider::empty(),
            EtlReconciler::never_shutdown(),
        )
    }

    #[tokio::test]
    async fn unchanged_content_is_skipped_without_an_embed_call() {
        let embedder = CountingEmbedder::new();
        let pipeline = pipeline(Arc::clone(&embedder));
        let snaps = vec![snapshot("c1", "status ENABLED"), snapshot("c2", "status PAUSED")];

        let first = pipeline
            .ensure_embedded(EntityLevel::Campaign, "acct", candidates(EntityLevel::Campaign, &snaps), false)
            .await
            .unwrap();
        assert_eq!(first.embedded.len(), 2);
        assert_eq!(embedder.calls(), 1);

        let second = pipeline
            .ensure_embedded(EntityLevel::Campaign, "acct", candidates(EntityLevel::Campaign, &snaps), false)
            .await
            .unwrap();
        assert_eq!(second.skipped.len(), 2);
        assert!(second.embedded.is_empty());
        assert_eq!(embedder.calls(), 1, "no embed call for unchanged content");
    }

    #[tokio::test]
    async fn a_single_changed_character_forces_exactly_one_reembed() {
        let embedder = CountingEmbedder::new();
        let pipeline = pipeline(Arc::clone(&embedder));

        let snaps = vec![snapshot("c1", "status ENABLED"), snapshot("c2", "status PAUSED")];
        pipeline
            .ensure_embedded(EntityLevel::Campaign, "acct", candidates(EntityLevel::Campaign, &snaps), false)
            .await
            .unwrap();

        let changed = vec![snapshot("c1", "status ENABLED"), snapshot("c2", "status PAUSeD")];
        let report = pipeline
            .ensure_embedded(EntityLevel::Campaign, "acct", candidates(EntityLevel::Campaign, &changed), false)
            .await
            .unwrap();
        assert_eq!(report.embedded, vec!["c2".to_string()]);
        assert_eq!(report.skipped, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn force_bypasses_the_hash_check() {
        let embedder = CountingEmbedder::new();
        let pipeline = pipeline(Arc::clone(&embedder));
        let snaps = vec![snapshot("c1", "status ENABLED")];

        pipeline
            .ensure_embedded(EntityLevel::Campaign, "acct", candidates(EntityLevel::Campaign, &snaps), false)
            .await
            .unwrap();
        let forced = pipeline
            .ensure_embedded(EntityLevel::Campaign, "acct", candidates(EntityLevel::Campaign, &snaps), true)
            .await
            .unwrap();
        assert_eq!(forced.embedded.len(), 1);
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn one_failed_chunk_does_not_abort_the_batch() {
        let embedder = CountingEmbedder::failing_on("poison");
        let pipeline = pipeline(embedder).with_batch_size(1);
        let snaps = vec![
            snapshot("c1", "fine"),
            snapshot("c2", "poison pill"),
            snapshot("c3", "also fine"),
        ];

        let report = pipeline
            .ensure_embedded(EntityLevel::Campaign, "acct", candidates(EntityLevel::Campaign, &snaps), false)
            .await
            .unwrap();
        assert_eq!(report.embedded, vec!["c1".to_string(), "c3".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].entity_id, "c2");
    }

    #[tokio::test]
    async fn backfill_rejects_a_model_override_mismatch() {
        let pipeline = pipeline(CountingEmbedder::new());
        let err = pipeline
            .backfill("acct", &[EntityLevel::Campaign], false, None, None, Some("other-model"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelMismatch { .. }));
    }

    #[tokio::test]
    async fn backfill_pulls_snapshots_per_level_and_honors_limit() {
        let embedder = CountingEmbedder::new();
        let provider = SnapshotProvider::new(vec![
            (
                EntityLevel::Campaign,
                vec![snapshot("c1", "a"), snapshot("c2", "b")],
            ),
            (EntityLevel::SearchTerm, vec![snapshot("s1", "query x")]),
        ]);
        let pipeline = EmbeddingPipeline::new(
            Arc::clone(&embedder) as Arc<dyn Embedder>,
            Arc::new(MemoryVectorStore::new()),
            provider,
            EtlReconciler::never_shutdown(),
        );

        let report = pipeline
            .backfill("acct", &[EntityLevel::Campaign], true, Some(7), Some(2), None, false)
            .await
            .unwrap();
        assert_eq!(report.embedded.len(), 2, "limit caps candidates across levels");
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn refresh_embeds_only_stale_rows_whose_content_changed() {
        let embedder = CountingEmbedder::new();
        let vectors = Arc::new(MemoryVectorStore::new());
        let unchanged = snapshot("c1", "same text");
        let changed_old = snapshot("c2", "old text");
        let changed_new = snapshot("c2", "new text");
        let provider = SnapshotProvider::new(vec![(
            EntityLevel::Campaign,
            vec![unchanged.clone(), changed_new],
        )]);

        let stale_at = Utc::now() - chrono::Duration::hours(48);
        for snap in [&unchanged, &changed_old] {
            let text = canonical_text(EntityLevel::Campaign, snap);
            vectors
                .upsert(EmbeddingRecord {
                    entity_type: EntityLevel::Campaign,
                    entity_id: snap.entity_id.clone(),
                    scope_id: "acct".into(),
                    vector: vec![1.0, 0.0, 0.0],
                    source_text_hash: content_hash(&text),
                    computed_at: stale_at,
                    model: "test-embedder-1".into(),
                    title: None,
                    text,
                })
                .await
                .unwrap();
        }

        let pipeline = EmbeddingPipeline::new(
            Arc::clone(&embedder) as Arc<dyn Embedder>,
            vectors,
            provider,
            EtlReconciler::never_shutdown(),
        );
        let report = pipeline
            .refresh_stale(Duration::from_secs(24 * 3600), 10, &SearchFilter::default(), false)
            .await
            .unwrap();

        assert_eq!(report.embedded, vec!["c2".to_string()]);
        assert_eq!(report.skipped, vec!["c1".to_string()]);
        assert_eq!(embedder.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_batches_in_opposite_orders_complete() {
        let embedder = CountingEmbedder::new();
        let pipeline = Arc::new(pipeline(Arc::clone(&embedder)));

        let snaps: Vec<EntityText> =
            (0..200).map(|i| snapshot(&format!("c{i:03}"), "body")).collect();
        let ascending = candidates(EntityLevel::Campaign, &snaps);
        let mut descending = ascending.clone();
        descending.reverse();

        let first = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline
                    .ensure_embedded(EntityLevel::Campaign, "acct", ascending, true)
                    .await
            })
        };
        let second = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline
                    .ensure_embedded(EntityLevel::Campaign, "acct", descending, true)
                    .await
            })
        };

        let (first, second) = tokio::time::timeout(Duration::from_secs(5), async {
            (first.await.unwrap(), second.await.unwrap())
        })
        .await
        .expect("overlapping batches over the same keys must not deadlock");
        assert_eq!(first.unwrap().embedded.len(), 200);
        assert_eq!(second.unwrap().embedded.len(), 200);
    }

    #[tokio::test]
    async fn a_record_from_another_model_is_rejected_unless_forced() {
        let embedder = CountingEmbedder::new();
        let vectors = Arc::new(MemoryVectorStore::new());
        let snap = snapshot("c1", "same text");
        let text = canonical_text(EntityLevel::Campaign, &snap);
        vectors
            .upsert(EmbeddingRecord {
                entity_type: EntityLevel::Campaign,
                entity_id: "c1".into(),
                scope_id: "acct".into(),
                vector: vec![1.0, 0.0, 0.0],
                source_text_hash: content_hash(&text),
                computed_at: Utc::now(),
                model: "legacy-model".into(),
                title: None,
                text,
            })
            .await
            .unwrap();
        let pipeline = EmbeddingPipeline::new(
            Arc::clone(&embedder) as Arc<dyn Embedder>,
            Arc::clone(&vectors) as Arc<dyn VectorStore>,
            SnapshotProvider::empty(),
            EtlReconciler::never_shutdown(),
        );

        let err = pipeline
            .ensure_embedded(
                EntityLevel::Campaign,
                "acct",
                candidates(EntityLevel::Campaign, &[snap.clone()]),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StoredModel { .. }));
        assert_eq!(embedder.calls(), 0);

        // force is the migration path: the record moves to the active model
        let report = pipeline
            .ensure_embedded(
                EntityLevel::Campaign,
                "acct",
                candidates(EntityLevel::Campaign, &[snap]),
                true,
            )
            .await
            .unwrap();
        assert_eq!(report.embedded, vec!["c1".to_string()]);
        let key = EmbeddingKey {
            entity_type: EntityLevel::Campaign,
            entity_id: "c1".into(),
            scope_id: "acct".into(),
        };
        let migrated = vectors.get(&key).await.unwrap().unwrap();
        assert_eq!(migrated.model, "test-embedder-1");
    }

    #[tokio::test]
    async fn refresh_embeds_first_sight_entities_under_a_scoped_filter() {
        let embedder = CountingEmbedder::new();
        let provider = SnapshotProvider::new(vec![(
            EntityLevel::Campaign,
            vec![snapshot("c9", "brand new campaign")],
        )]);
        let pipeline = EmbeddingPipeline::new(
            Arc::clone(&embedder) as Arc<dyn Embedder>,
            Arc::new(MemoryVectorStore::new()),
            provider,
            EtlReconciler::never_shutdown(),
        );

        // without a concrete type+scope there is nothing to enumerate
        let report = pipeline
            .refresh_stale(Duration::from_secs(3600), 10, &SearchFilter::default(), false)
            .await
            .unwrap();
        assert!(report.embedded.is_empty());

        let filter = SearchFilter {
            entity_type: Some(EntityLevel::Campaign),
            scope_id: Some("acct".into()),
        };
        let report = pipeline
            .refresh_stale(Duration::from_secs(3600), 10, &filter, false)
            .await
            .unwrap();
        assert_eq!(report.embedded, vec!["c9".to_string()]);

        // the record is fresh now, so the next pass has nothing to do
        let report = pipeline
            .refresh_stale(Duration::from_secs(3600), 10, &filter, false)
            .await
            .unwrap();
        assert!(report.embedded.is_empty());
        assert_eq!(embedder.calls(), 1);
    }

    struct SignalAfterFirstCall {
        inner: Arc<CountingEmbedder>,
        shutdown: watch::Sender<bool>,
    }

    #[async_trait]
    impl Embedder for SignalAfterFirstCall {
        fn model(&self) -> &str {
            self.inner.model()
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            let out = self.inner.embed_batch(texts).await;
            let _ = self.shutdown.send(true);
            out
        }
    }

    #[tokio::test]
    async fn shutdown_finishes_the_current_chunk_and_starts_no_more() {
        let counting = CountingEmbedder::new();
        let (tx, rx) = watch::channel(false);
        let embedder = Arc::new(SignalAfterFirstCall {
            inner: Arc::clone(&counting),
            shutdown: tx,
        });
        let pipeline = EmbeddingPipeline::new(
            embedder,
            Arc::new(MemoryVectorStore::new()),
            SnapshotProvider::empty(),
            rx,
        )
        .with_batch_size(1);

        let snaps = vec![snapshot("c1", "a"), snapshot("c2", "b"), snapshot("c3", "c")];
        let report = pipeline
            .ensure_embedded(
                EntityLevel::Campaign,
                "acct",
                candidates(EntityLevel::Campaign, &snaps),
                false,
            )
            .await
            .unwrap();

        assert_eq!(report.embedded, vec!["c1".to_string()]);
        assert_eq!(counting.calls(), 1, "no chunk starts after the signal");
    }
}
