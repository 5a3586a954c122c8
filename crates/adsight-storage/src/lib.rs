//! Fact Store and Vector Store implementations (in-memory and Postgres),
//! plus the retry/backoff primitives shared by callers of rate-limited
//! externals.

use sha2::{Digest, Sha256};

pub mod facts;
pub mod retry;
pub mod vectors;

pub use facts::{FactStore, MemoryFactStore, PgFactStore};
pub use retry::{BackoffPolicy, RetryDisposition};
pub use vectors::{
    connect_pg_vector_store, MemoryVectorStore, PgNativeVectorStore, PgScanVectorStore,
    ScoredRecord, SearchFilter, VectorStore,
};

pub const CRATE_NAME: &str = "adsight-storage";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt stored value: {0}")]
    Decode(String),
    #[error("embedding dimensionality mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// sha256 hex digest of a canonical text; the content-change detector for
/// embedding records.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Run the schema migrations against a Postgres pool.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!().run(pool).await
}
