//! Enrichment cache: maps a source-specific identifier to a previously
//! fetched document with TTL-based expiry.
//!
//! An empty cached document is meaningful: it records that the identifier was
//! queried and the source had nothing, so later runs can short-circuit
//! instead of asking again. That is distinct from a cache miss (`None`).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod in_memory;
pub mod mongodb_store;

pub use in_memory::InMemoryCache;
pub use mongodb_store::MongoDbCache;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("MongoDB error: {0}")]
    MongoDb(#[from] mongodb::error::Error),

    #[error("failed to encode cached document: {0}")]
    Encoding(#[from] mongodb::bson::ser::Error),
}

/// A cached query result for one identifier. `fields` empty means "queried,
/// found nothing".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedDoc {
    pub id: String,
    pub fields: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl CachedDoc {
    /// True when this entry marks a known-absent identifier.
    pub fn is_absent_marker(&self) -> bool {
        self.fields.is_empty()
    }
}

pub type DynCache = Arc<dyn Cache + Send + Sync>;

/// Cache contract consumed by the enrichers. Keys are lowercased by the
/// caller where the identifier space is case-insensitive. Writes are
/// idempotent upserts; expiry is delegated to the store.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<CachedDoc>, CacheError>;

    async fn set(&self, id: &str, fields: Map<String, Value>) -> Result<(), CacheError>;

    /// Verifies (or creates) the indexes backing lookup and TTL expiry.
    /// Called once before a middleware becomes usable.
    async fn ensure_indexes(&self, ttl: Duration) -> Result<(), CacheError>;
}
