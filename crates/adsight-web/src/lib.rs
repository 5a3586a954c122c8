//! JSON API over the sync engine: reports, ETL backfill, embedding
//! maintenance, and semantic search/answer endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use adsight_adapters::{
    AdsProvider, AnswerComposer, Embedder, FixtureProvider, HttpComposer, HttpComposerConfig,
    HttpEmbedder, HttpEmbedderConfig,
};
use adsight_core::{DateRange, EntityLevel};
use adsight_storage::{
    connect_pg_vector_store, FactStore, MemoryFactStore, MemoryVectorStore, PgFactStore,
    SearchFilter, VectorStore,
};
use adsight_sync::{
    report::to_csv, ConfigError, DayFailure, EmbedReport, EmbeddingPipeline, EtlReconciler,
    FreshnessScheduler, PipelineError, ReconcileRequest, ReconcileSummary, ReportAssembler,
    ReportError, ReportFormat, ReportRequest, ReportSource, RetrievalError, RetrievalService,
    SyncConfig,
};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub const CRATE_NAME: &str = "adsight-web";

/// Default levels for ETL and embedding backfills when a request names none.
const DEFAULT_LEVELS: [EntityLevel; 4] = [
    EntityLevel::Campaign,
    EntityLevel::AdGroup,
    EntityLevel::Ad,
    EntityLevel::Keyword,
];

#[derive(Clone)]
pub struct AppState {
    pub config: SyncConfig,
    pub reconciler: Arc<EtlReconciler>,
    pub assembler: Arc<ReportAssembler>,
    pub pipeline: Arc<EmbeddingPipeline>,
    pub retrieval: Arc<RetrievalService>,
}

impl AppState {
    /// Wire the engine from its seams. The scheduler is built separately so
    /// request handling never depends on it.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn FactStore>,
        vectors: Arc<dyn VectorStore>,
        provider: Arc<dyn AdsProvider>,
        embedder: Arc<dyn Embedder>,
        composer: Arc<dyn AnswerComposer>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let reconciler = Arc::new(EtlReconciler::new(
            Arc::clone(&provider),
            Arc::clone(&store),
            config.backoff,
            config.day_concurrency,
            shutdown.clone(),
        ));
        let assembler = Arc::new(ReportAssembler::new(
            store,
            Arc::clone(&provider),
            Arc::clone(&reconciler),
        ));
        let pipeline = Arc::new(EmbeddingPipeline::new(
            Arc::clone(&embedder),
            Arc::clone(&vectors),
            provider,
            shutdown,
        ));
        let retrieval = Arc::new(RetrievalService::new(embedder, vectors, composer));
        Self {
            config,
            reconciler,
            assembler,
            pipeline,
            retrieval,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/report", get(report_handler))
        .route("/etl/backfill", post(etl_backfill_handler))
        .route("/etl/missing-days", get(missing_days_handler))
        .route("/embeddings/backfill", post(embeddings_backfill_handler))
        .route("/embeddings/reembed", post(reembed_handler))
        .route("/search", get(search_handler))
        .route("/answer", post(answer_handler))
        .with_state(Arc::new(state))
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// A numeric env value that is present but unparseable is a startup error;
/// an absent one gets the default.
fn parse_env_number<T: std::str::FromStr>(
    var: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError {
            var,
            value,
            reason: "expected an unsigned integer".into(),
        }),
    }
}

/// Process-level wiring read from the environment: Postgres when
/// DATABASE_URL is set (in-memory stores otherwise), fixture-backed provider,
/// HTTP embedding and composer capabilities.
pub async fn build_state_from_env(shutdown: watch::Receiver<bool>) -> anyhow::Result<AppState> {
    let config = SyncConfig::from_env()?;
    let timeout = Duration::from_secs(parse_env_number(
        "ADSIGHT_HTTP_TIMEOUT_SECS",
        std::env::var("ADSIGHT_HTTP_TIMEOUT_SECS").ok(),
        20u64,
    )?);
    let embed_dim: usize = parse_env_number(
        "ADSIGHT_EMBED_DIM",
        std::env::var("ADSIGHT_EMBED_DIM").ok(),
        1536,
    )?;
    let (store, vectors): (Arc<dyn FactStore>, Arc<dyn VectorStore>) =
        match std::env::var("DATABASE_URL") {
            Ok(url) => {
                let pool = sqlx::PgPool::connect(&url).await?;
                adsight_storage::migrate(&pool).await?;
                let vectors = connect_pg_vector_store(pool.clone(), embed_dim).await?;
                (Arc::new(PgFactStore::new(pool)), vectors)
            }
            Err(_) => {
                info!("DATABASE_URL not set, using in-memory stores");
                (
                    Arc::new(MemoryFactStore::new()),
                    Arc::new(MemoryVectorStore::new()),
                )
            }
        };

    let fixtures_dir =
        std::env::var("ADSIGHT_FIXTURES_DIR").unwrap_or_else(|_| "./fixtures".to_string());
    let provider: Arc<dyn AdsProvider> = Arc::new(FixtureProvider::new(fixtures_dir));

    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(HttpEmbedderConfig {
        base_url: std::env::var("ADSIGHT_EMBED_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        api_key: std::env::var("ADSIGHT_EMBED_API_KEY").ok(),
        model: std::env::var("ADSIGHT_EMBED_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
        dimensions: embed_dim,
        timeout,
    })?);
    let composer: Arc<dyn AnswerComposer> = Arc::new(HttpComposer::new(HttpComposerConfig {
        base_url: std::env::var("ADSIGHT_COMPOSER_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        api_key: std::env::var("ADSIGHT_EMBED_API_KEY").ok(),
        model: std::env::var("ADSIGHT_COMPOSER_MODEL")
            .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        timeout,
    })?);

    Ok(AppState::new(
        config, store, vectors, provider, embedder, composer, shutdown,
    ))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = parse_env_number(
        "ADSIGHT_WEB_PORT",
        std::env::var("ADSIGHT_WEB_PORT").ok(),
        8000,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = build_state_from_env(shutdown_rx.clone()).await?;

    let scheduler =
        FreshnessScheduler::new(Arc::clone(&state.pipeline), state.config.reembed.clone());
    if let Some(sched) = scheduler.maybe_build_scheduler().await? {
        sched.start().await?;
        info!("re-embed scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    let mut shutdown_rx = shutdown_rx;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!("request failed: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn upstream_error(err: impl std::fmt::Display) -> Response {
    error!("upstream call failed: {err}");
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn retrieval_error(err: RetrievalError) -> Response {
    match err {
        RetrievalError::Store(e) => server_error(e),
        err @ RetrievalError::ModelMismatch { .. } => server_error(err),
        other => upstream_error(other),
    }
}

fn pipeline_error(err: PipelineError) -> Response {
    match err {
        PipelineError::ModelMismatch { .. } => bad_request(err.to_string()),
        PipelineError::StoredModel { .. } => server_error(err),
        PipelineError::Store(e) => server_error(e),
    }
}

fn parse_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange, Response> {
    DateRange::new(start, end).map_err(|e| bad_request(e.to_string()))
}

fn parse_level(raw: Option<&str>) -> Result<EntityLevel, Response> {
    match raw {
        None => Ok(EntityLevel::Campaign),
        Some(s) => s.parse().map_err(|_| bad_request(format!("unknown entity level '{s}'"))),
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    account_id: Option<String>,
    level: Option<String>,
    start: NaiveDate,
    end: NaiveDate,
    source: Option<String>,
    #[serde(default)]
    fill_missing: bool,
    #[serde(default)]
    include_zero_impressions: bool,
    format: Option<String>,
}

async fn report_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportQuery>,
) -> Response {
    let range = match parse_range(query.start, query.end) {
        Ok(range) => range,
        Err(resp) => return resp,
    };
    let level = match parse_level(query.level.as_deref()) {
        Ok(level) => level,
        Err(resp) => return resp,
    };
    let source = match query.source.as_deref().unwrap_or("auto").parse::<ReportSource>() {
        Ok(source) => source,
        Err(e) => return bad_request(e),
    };
    let format = match query.format.as_deref().unwrap_or("json").parse::<ReportFormat>() {
        Ok(format) => format,
        Err(e) => return bad_request(e),
    };

    let req = ReportRequest {
        account_id: query
            .account_id
            .unwrap_or_else(|| state.config.default_account.clone()),
        level,
        range,
        source,
        fill_missing: query.fill_missing,
        include_zero_impressions: query.include_zero_impressions,
    };
    match state.assembler.get_report(&req).await {
        Ok(report) => match format {
            ReportFormat::Json => Json(report).into_response(),
            ReportFormat::Csv => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
                to_csv(&report.rows),
            )
                .into_response(),
        },
        Err(ReportError::Provider(e)) => upstream_error(e),
        Err(ReportError::Store(e)) => server_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct BackfillBody {
    account_id: Option<String>,
    start: NaiveDate,
    end: NaiveDate,
    levels: Option<Vec<EntityLevel>>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    include_zero_impressions: bool,
}

#[derive(Debug, Serialize)]
struct LevelDayFailure {
    level: EntityLevel,
    day: NaiveDate,
    message: String,
    transient: bool,
}

#[derive(Debug, Serialize)]
struct BackfillResponse {
    days_fetched: u64,
    rows_upserted: u64,
    errors: Vec<LevelDayFailure>,
    per_level: BTreeMap<String, ReconcileSummary>,
}

async fn etl_backfill_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BackfillBody>,
) -> Response {
    let range = match parse_range(body.start, body.end) {
        Ok(range) => range,
        Err(resp) => return resp,
    };
    let account_id = body
        .account_id
        .unwrap_or_else(|| state.config.default_account.clone());
    let levels = body.levels.unwrap_or_else(|| DEFAULT_LEVELS.to_vec());

    let mut response = BackfillResponse {
        days_fetched: 0,
        rows_upserted: 0,
        errors: Vec::new(),
        per_level: BTreeMap::new(),
    };
    for level in levels {
        let summary = match state
            .reconciler
            .reconcile(&ReconcileRequest {
                account_id: account_id.clone(),
                level,
                range,
                force: body.force,
                include_zero_impressions: body.include_zero_impressions,
            })
            .await
        {
            Ok(summary) => summary,
            Err(e) => return server_error(e),
        };
        response.days_fetched += summary.days_fetched;
        response.rows_upserted += summary.rows_upserted;
        response
            .errors
            .extend(summary.errors.iter().map(|f: &DayFailure| LevelDayFailure {
                level,
                day: f.day,
                message: f.message.clone(),
                transient: f.transient,
            }));
        response.per_level.insert(level.to_string(), summary);
    }
    Json(response).into_response()
}

#[derive(Debug, Deserialize)]
struct MissingDaysQuery {
    account_id: Option<String>,
    level: Option<String>,
    start: NaiveDate,
    end: NaiveDate,
}

async fn missing_days_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MissingDaysQuery>,
) -> Response {
    let range = match parse_range(query.start, query.end) {
        Ok(range) => range,
        Err(resp) => return resp,
    };
    let level = match parse_level(query.level.as_deref()) {
        Ok(level) => level,
        Err(resp) => return resp,
    };
    let account_id = query
        .account_id
        .unwrap_or_else(|| state.config.default_account.clone());

    match state.reconciler.missing_days(&account_id, level, range).await {
        Ok(days) => Json(serde_json::json!({
            "account_id": account_id,
            "level": level,
            "missing_days": days,
        }))
        .into_response(),
        Err(e) => server_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsBackfillBody {
    account_id: Option<String>,
    levels: Option<Vec<EntityLevel>>,
    #[serde(default)]
    include_search_terms: bool,
    days: Option<u32>,
    limit: Option<usize>,
    model: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct EmbedResponse {
    embedded: usize,
    skipped: usize,
    failed: usize,
    report: EmbedReport,
}

impl From<EmbedReport> for EmbedResponse {
    fn from(report: EmbedReport) -> Self {
        Self {
            embedded: report.embedded.len(),
            skipped: report.skipped.len(),
            failed: report.failed.len(),
            report,
        }
    }
}

async fn embeddings_backfill_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EmbeddingsBackfillBody>,
) -> Response {
    let scope_id = body
        .account_id
        .unwrap_or_else(|| state.config.default_account.clone());
    let levels = body.levels.unwrap_or_else(|| DEFAULT_LEVELS.to_vec());

    match state
        .pipeline
        .backfill(
            &scope_id,
            &levels,
            body.include_search_terms,
            body.days,
            body.limit,
            body.model.as_deref(),
            body.force,
        )
        .await
    {
        Ok(report) => Json(EmbedResponse::from(report)).into_response(),
        Err(e) => pipeline_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ReembedBody {
    max_age_hours: Option<u64>,
    limit: Option<usize>,
    entity_type: Option<EntityLevel>,
    scope_id: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn reembed_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReembedBody>,
) -> Response {
    let max_age = Duration::from_secs(body.max_age_hours.unwrap_or(24) * 3600);
    let filter = SearchFilter {
        entity_type: body.entity_type,
        scope_id: body.scope_id,
    };
    match state
        .pipeline
        .refresh_stale(max_age, body.limit.unwrap_or(200), &filter, body.force)
        .await
    {
        Ok(report) => Json(EmbedResponse::from(report)).into_response(),
        Err(e) => pipeline_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    k: Option<usize>,
    entity_type: Option<String>,
    scope_id: Option<String>,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let entity_type = match query.entity_type.as_deref() {
        None => None,
        Some(s) => match s.parse::<EntityLevel>() {
            Ok(level) => Some(level),
            Err(_) => return bad_request(format!("unknown entity level '{s}'")),
        },
    };
    let filter = SearchFilter {
        entity_type,
        scope_id: query.scope_id,
    };
    match state
        .retrieval
        .search(&query.q, query.k.unwrap_or(10), &filter)
        .await
    {
        Ok(hits) => Json(serde_json::json!({ "hits": hits })).into_response(),
        Err(e) => retrieval_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct AnswerBody {
    query: String,
    k: Option<usize>,
    entity_type: Option<EntityLevel>,
    scope_id: Option<String>,
    model: Option<String>,
}

async fn answer_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AnswerBody>,
) -> Response {
    let filter = SearchFilter {
        entity_type: body.entity_type,
        scope_id: body.scope_id,
    };
    match state
        .retrieval
        .answer(&body.query, body.k.unwrap_or(5), &filter, body.model.as_deref())
        .await
    {
        Ok(answer) => Json(answer).into_response(),
        Err(e) => retrieval_error(e),
    }
}
