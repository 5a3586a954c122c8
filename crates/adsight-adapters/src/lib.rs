//! External-collaborator seams: the advertising provider, the embedding
//! capability, and the answer composer, plus fixture-first and HTTP-backed
//! implementations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use adsight_core::{EntityLevel, EntityText, PerformanceFact};

pub const CRATE_NAME: &str = "adsight-adapters";

/// Provider failures split along the retry boundary: transient errors are
/// retried with backoff, permanent ones surface immediately.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// One fetched performance row plus the display metadata observed with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRow {
    pub fact: PerformanceFact,
    #[serde(default)]
    pub entity_name: Option<String>,
    #[serde(default)]
    pub entity_status: Option<String>,
}

/// Opaque fetch capability over the advertising provider. Rate limiting,
/// auth, and transport live behind this seam.
#[async_trait]
pub trait AdsProvider: Send + Sync {
    /// All performance rows for one (account, level, day).
    /// An empty vec is a valid answer: the day had no activity.
    async fn fetch_day(
        &self,
        account_id: &str,
        level: EntityLevel,
        date: NaiveDate,
    ) -> Result<Vec<ProviderRow>, ProviderError>;

    /// Current textual snapshots of all entities of one type in a scope.
    /// `lookback_days` windows time-bounded entity kinds (search terms).
    async fn fetch_entity_text(
        &self,
        entity_type: EntityLevel,
        scope_id: &str,
        lookback_days: Option<u32>,
    ) -> Result<Vec<EntityText>, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("embedding capability unavailable: {0}")]
    Unavailable(String),
    #[error("embedding request rejected: {0}")]
    Rejected(String),
}

impl EmbedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedError::Unavailable(_))
    }
}

/// Text-to-vector capability. All vectors from one embedder carry the same
/// model identifier and dimensionality; mixing versions without a migration
/// is an error state the stores reject.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;
    fn dimensions(&self) -> usize;

    /// Batch form; order of outputs matches order of inputs.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("answer composer unavailable: {0}")]
    Unavailable(String),
    #[error("answer composer rejected request: {0}")]
    Rejected(String),
}

/// A retrieved snippet handed to the composer as context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnippet {
    pub entity_id: String,
    pub title: Option<String>,
    pub text: String,
}

/// Final answer-composition capability. The retrieval service returns its
/// output verbatim. `model` overrides the configured model for one call.
#[async_trait]
pub trait AnswerComposer: Send + Sync {
    async fn compose(
        &self,
        query: &str,
        context: &[ContextSnippet],
        model: Option<&str>,
    ) -> Result<String, ComposeError>;
}

// ---------------------------------------------------------------------------
// Fixture-first provider
// ---------------------------------------------------------------------------

/// Reads provider responses from a fixture directory:
/// `<root>/<account_id>/<level>/<YYYY-MM-DD>.json` for day rows and
/// `<root>/<account_id>/<level>/entities.json` for entity snapshots.
/// A missing day file is a zero-activity day, not an error.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    root: PathBuf,
}

impl FixtureProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn level_dir(&self, account_id: &str, level: EntityLevel) -> PathBuf {
        self.root.join(account_id).join(level.as_str())
    }
}

fn read_fixture_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ProviderError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| ProviderError::Transient(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|e| ProviderError::Permanent(format!("malformed fixture {}: {e}", path.display())))
}

#[async_trait]
impl AdsProvider for FixtureProvider {
    async fn fetch_day(
        &self,
        account_id: &str,
        level: EntityLevel,
        date: NaiveDate,
    ) -> Result<Vec<ProviderRow>, ProviderError> {
        let path = self
            .level_dir(account_id, level)
            .join(format!("{}.json", date.format("%Y-%m-%d")));
        if !path.exists() {
            debug!(account_id, %level, %date, "no fixture for day, treating as zero-activity");
            return Ok(Vec::new());
        }
        read_fixture_json(&path)
    }

    async fn fetch_entity_text(
        &self,
        entity_type: EntityLevel,
        scope_id: &str,
        _lookback_days: Option<u32>,
    ) -> Result<Vec<EntityText>, ProviderError> {
        let path = self.level_dir(scope_id, entity_type).join("entities.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_fixture_json(&path)
    }
}

// ---------------------------------------------------------------------------
// HTTP embedding capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub timeout: Duration,
}

/// OpenAI-style `/embeddings` client.
#[derive(Debug)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: HttpEmbedderConfig,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

fn classify_reqwest(err: &reqwest::Error) -> bool {
    // timeout/connect failures are worth retrying; everything else is not
    err.is_timeout() || err.is_connect() || err.is_request()
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building embedder http client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.config.model
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(&EmbedRequest {
            model: &self.config.model,
            input: texts,
        });
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if classify_reqwest(&e) {
                EmbedError::Unavailable(e.to_string())
            } else {
                EmbedError::Rejected(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(EmbedError::Unavailable(format!("http status {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EmbedError::Rejected(format!("http status {status}: {body}")));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Rejected(format!("decoding embeddings response: {e}")))?;
        if parsed.data.len() != texts.len() {
            return Err(EmbedError::Rejected(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ---------------------------------------------------------------------------
// HTTP answer composer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpComposerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

/// Chat-completions-style client used for final answer composition.
#[derive(Debug)]
pub struct HttpComposer {
    client: reqwest::Client,
    config: HttpComposerConfig,
}

#[derive(Debug, Serialize)]
struct ComposeMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ComposeRequest<'a> {
    model: &'a str,
    messages: Vec<ComposeMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ComposeResponse {
    choices: Vec<ComposeChoice>,
}

#[derive(Debug, Deserialize)]
struct ComposeChoice {
    message: ComposeChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ComposeChoiceMessage {
    content: String,
}

const COMPOSER_SYSTEM_PROMPT: &str = "You answer questions about advertising \
performance using only the provided context snippets. If the context is \
empty, say so and answer from general knowledge, clearly flagged.";

impl HttpComposer {
    pub fn new(config: HttpComposerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building composer http client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl AnswerComposer for HttpComposer {
    async fn compose(
        &self,
        query: &str,
        context: &[ContextSnippet],
        model: Option<&str>,
    ) -> Result<String, ComposeError> {
        let mut context_block = String::new();
        for snippet in context {
            match &snippet.title {
                Some(title) => {
                    context_block.push_str(&format!("- [{} | {}] {}\n", snippet.entity_id, title, snippet.text));
                }
                None => context_block.push_str(&format!("- [{}] {}\n", snippet.entity_id, snippet.text)),
            }
        }
        let user_content = format!("Context:\n{context_block}\nQuestion: {query}");

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut req = self.client.post(&url).json(&ComposeRequest {
            model: model.unwrap_or(&self.config.model),
            messages: vec![
                ComposeMessage {
                    role: "system",
                    content: COMPOSER_SYSTEM_PROMPT,
                },
                ComposeMessage {
                    role: "user",
                    content: &user_content,
                },
            ],
        });
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if classify_reqwest(&e) {
                ComposeError::Unavailable(e.to_string())
            } else {
                ComposeError::Rejected(e.to_string())
            }
        })?;
        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ComposeError::Unavailable(format!("http status {status}")));
        }
        if !status.is_success() {
            return Err(ComposeError::Rejected(format!("http status {status}")));
        }

        let parsed: ComposeResponse = resp
            .json()
            .await
            .map_err(|e| ComposeError::Rejected(format!("decoding composer response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ComposeError::Rejected("composer returned no choices".into()))
    }
}
