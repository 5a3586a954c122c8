//! Background re-embed loop. At most one pass runs per process; a tick that
//! fires while a pass is still running is skipped, never queued.

use std::sync::Arc;

use adsight_storage::SearchFilter;
use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::ReembedConfig;
use crate::embed::{EmbedReport, EmbeddingPipeline, PipelineError};

pub struct FreshnessScheduler {
    pipeline: Arc<EmbeddingPipeline>,
    config: ReembedConfig,
    pass_gate: Mutex<()>,
}

impl FreshnessScheduler {
    pub fn new(pipeline: Arc<EmbeddingPipeline>, config: ReembedConfig) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            config,
            pass_gate: Mutex::new(()),
        })
    }

    /// Run one freshness pass, or return None when a pass is already in
    /// flight. Scheduler failures are reported, never fatal to the service.
    pub async fn run_pass(&self) -> Option<Result<EmbedReport, PipelineError>> {
        let Ok(_running) = self.pass_gate.try_lock() else {
            info!("re-embed pass still running, tick skipped");
            return None;
        };
        let filter = SearchFilter {
            entity_type: self.config.entity_type,
            scope_id: self.config.scope_id.clone(),
        };
        Some(
            self.pipeline
                .refresh_stale(self.config.max_age, self.config.limit, &filter, false)
                .await,
        )
    }

    /// Build the cron-driven scheduler when the loop is enabled. The caller
    /// owns starting and shutting it down.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.cron.clone();
        let this = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                match this.run_pass().await {
                    None => {}
                    Some(Ok(report)) => info!(
                        embedded = report.embedded.len(),
                        skipped = report.skipped.len(),
                        failed = report.failed.len(),
                        "re-embed pass finished"
                    ),
                    Some(Err(err)) => warn!("re-embed pass failed: {err}"),
                }
            })
        })
        .with_context(|| format!("creating re-embed job for cron {cron}"))?;
        sched.add(job).await.context("adding re-embed job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::EtlReconciler;
    use adsight_adapters::{AdsProvider, EmbedError, Embedder, ProviderError, ProviderRow};
    use adsight_core::{canonical_text, EmbeddingRecord, EntityLevel, EntityText};
    use adsight_storage::{content_hash, MemoryVectorStore, VectorStore};
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn model(&self) -> &str {
            "slow-embedder"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct OneSnapshotProvider {
        snapshot: EntityText,
    }

    #[async_trait]
    impl AdsProvider for OneSnapshotProvider {
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
            _entity_type: EntityLevel,
            _scope_id: &str,
            _lookback_days: Option<u32>,
        ) -> Result<Vec<EntityText>, ProviderError> {
            Ok(vec![self.snapshot.clone()])
        }
    }

    fn config() -> ReembedConfig {
        ReembedConfig {
            enabled: true,
            cron: "0 0 * * * *".into(),
            limit: 10,
            max_age: Duration::from_secs(3600),
            entity_type: None,
            scope_id: None,
        }
    }

    #[tokio::test]
    async fn overlapping_ticks_are_skipped_not_queued() {
        // one stale record whose upstream text changed, so a pass must
        // spend exactly one embed call
        let snapshot = EntityText {
            entity_id: "c1".into(),
            title: None,
            body: "fresh text".into(),
        };
        let vectors = Arc::new(MemoryVectorStore::new());
        let old_text = canonical_text(
            EntityLevel::Campaign,
            &EntityText {
                entity_id: "c1".into(),
                title: None,
                body: "old text".into(),
            },
        );
        vectors
            .upsert(EmbeddingRecord {
                entity_type: EntityLevel::Campaign,
                entity_id: "c1".into(),
                scope_id: "acct".into(),
                vector: vec![0.0, 1.0],
                source_text_hash: content_hash(&old_text),
                computed_at: Utc::now() - chrono::Duration::hours(5),
                model: "slow-embedder".into(),
                title: None,
                text: old_text,
            })
            .await
            .unwrap();

        let embedder = Arc::new(SlowEmbedder {
            calls: AtomicUsize::new(0),
        });
        let pipeline = Arc::new(EmbeddingPipeline::new(
            Arc::clone(&embedder) as Arc<dyn Embedder>,
            vectors,
            Arc::new(OneSnapshotProvider { snapshot }),
            EtlReconciler::never_shutdown(),
        ));
        let scheduler = FreshnessScheduler::new(pipeline, config());

        let first = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_pass().await })
        };
        // let the first pass take the gate before the second tick fires
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = scheduler.run_pass().await;
        assert!(second.is_none(), "overlapping tick must be skipped");

        let first = first.await.unwrap().expect("first pass ran");
        let report = first.unwrap();
        assert_eq!(report.embedded, vec!["c1".to_string()]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        // gate released, the next tick runs (and skips by hash)
        let third = scheduler.run_pass().await.expect("gate released").unwrap();
        assert!(third.embedded.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_loop_builds_no_scheduler() {
        let vectors = Arc::new(MemoryVectorStore::new());
        let pipeline = Arc::new(EmbeddingPipeline::new(
            Arc::new(SlowEmbedder {
                calls: AtomicUsize::new(0),
            }),
            vectors,
            Arc::new(OneSnapshotProvider {
                snapshot: EntityText {
                    entity_id: "c1".into(),
                    title: None,
                    body: "x".into(),
                },
            }),
            EtlReconciler::never_shutdown(),
        ));
        let scheduler = FreshnessScheduler::new(
            pipeline,
            ReembedConfig {
                enabled: false,
                ..config()
            },
        );
        assert!(scheduler.maybe_build_scheduler().await.unwrap().is_none());
    }
}
