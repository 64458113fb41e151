//! In-memory cache store, used by tests and cacheless single runs.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::{Cache, CacheError, CachedDoc};

#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CachedDoc>>,
    ttl: RwLock<Option<Duration>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait::async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, id: &str) -> Result<Option<CachedDoc>, CacheError> {
        let entry = self.entries.read().get(id).cloned();
        let Some(doc) = entry else { return Ok(None) };

        if let Some(ttl) = *self.ttl.read() {
            let age = Utc::now().signed_duration_since(doc.updated_at);
            if age.num_milliseconds() >= 0 && age.to_std().unwrap_or_default() > ttl {
                self.entries.write().remove(id);
                return Ok(None);
            }
        }

        Ok(Some(doc))
    }

    async fn set(&self, id: &str, fields: Map<String, Value>) -> Result<(), CacheError> {
        let doc = CachedDoc {
            id: id.to_owned(),
            fields,
            updated_at: Utc::now(),
        };
        self.entries.write().insert(id.to_owned(), doc);
        Ok(())
    }

    async fn ensure_indexes(&self, ttl: Duration) -> Result<(), CacheError> {
        *self.ttl.write() = Some(ttl);
        Ok(())
    }
}
