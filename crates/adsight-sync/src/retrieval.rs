//! Semantic retrieval: embed the query, rank stored vectors by cosine
//! similarity, and optionally hand the top matches to the answer composer.

use std::sync::Arc;

use adsight_adapters::{AnswerComposer, ComposeError, ContextSnippet, EmbedError, Embedder};
use adsight_core::EntityLevel;
use adsight_storage::{SearchFilter, StoreError, VectorStore};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("embedding the query failed: {0}")]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("composing the answer failed: {0}")]
    Compose(#[from] ComposeError),
    #[error("embedder returned no vector for the query")]
    EmptyEmbedding,
    /// The index holds vectors from a different model than the one embedding
    /// queries; a mixed vector space is a configuration error.
    #[error("stored embedding model '{stored}' does not match query model '{active}'")]
    ModelMismatch { active: String, stored: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub entity_id: String,
    pub entity_type: EntityLevel,
    pub scope_id: String,
    pub score: f32,
    pub title: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComposedAnswer {
    pub answer: String,
    /// True when zero matches were retrieved; the composer still ran, with
    /// empty context.
    pub retrieval_empty: bool,
    pub hits: Vec<SearchHit>,
}

pub struct RetrievalService {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    composer: Arc<dyn AnswerComposer>,
}

impl RetrievalService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        composer: Arc<dyn AnswerComposer>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            composer,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        let mut embedded = self.embedder.embed_batch(&[query.to_string()]).await?;
        let query_vector = match embedded.pop() {
            Some(v) if !v.is_empty() => v,
            _ => return Err(RetrievalError::EmptyEmbedding),
        };

        let scored = self.vectors.search(&query_vector, k, filter).await?;
        if let Some(foreign) = scored
            .iter()
            .find(|s| s.record.model != self.embedder.model())
        {
            return Err(RetrievalError::ModelMismatch {
                active: self.embedder.model().to_string(),
                stored: foreign.record.model.clone(),
            });
        }
        debug!(query, k, hits = scored.len(), "search finished");
        Ok(scored
            .into_iter()
            .map(|s| SearchHit {
                entity_id: s.record.entity_id,
                entity_type: s.record.entity_type,
                scope_id: s.record.scope_id,
                score: s.score,
                title: s.record.title,
                text: s.record.text,
            })
            .collect())
    }

    /// Retrieve then compose. Zero matches still invoke the composer with
    /// empty context; the flag lets callers surface the difference. `model`
    /// overrides the composer's configured model for this call only.
    pub async fn answer(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
        model: Option<&str>,
    ) -> Result<ComposedAnswer, RetrievalError> {
        let hits = self.search(query, k, filter).await?;
        let snippets: Vec<ContextSnippet> = hits
            .iter()
            .map(|h| ContextSnippet {
                entity_id: h.entity_id.clone(),
                title: h.title.clone(),
                text: h.text.clone(),
            })
            .collect();
        let answer = self.composer.compose(query, &snippets, model).await?;
        Ok(ComposedAnswer {
            answer,
            retrieval_empty: hits.is_empty(),
            hits,
        })
    }
}
