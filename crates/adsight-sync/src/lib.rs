//! The synchronization and freshness engine: ETL reconciliation against the
//! advertising provider, report assembly, the embedding pipeline, the
//! background re-embed scheduler, and semantic retrieval.

pub mod config;
pub mod embed;
pub mod reconcile;
pub mod report;
pub mod retrieval;
pub mod scheduler;

pub use config::{ConfigError, ReembedConfig, SyncConfig, DEFAULT_ACCOUNT_ID};
pub use embed::{Candidate, CandidateFailure, EmbedReport, EmbeddingPipeline, PipelineError};
pub use reconcile::{DayFailure, EtlReconciler, ReconcileRequest, ReconcileSummary};
pub use report::{Report, ReportAssembler, ReportError, ReportFormat, ReportRequest, ReportRow, ReportSource};
pub use retrieval::{ComposedAnswer, RetrievalError, RetrievalService, SearchHit};
pub use scheduler::FreshnessScheduler;

pub const CRATE_NAME: &str = "adsight-sync";
