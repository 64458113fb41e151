//! MongoDB-backed cache store: one collection per source, TTL expiry handled
//! by the server through an `expireAfterSeconds` index.

use std::time::Duration;

use mongodb::{
    Collection, Database, IndexModel,
    bson::{self, doc},
    options::IndexOptions,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Cache, CacheError, CachedDoc};

/// BSON dates carry millisecond precision; out-of-range values collapse to
/// the epoch, which reads as long expired.
fn to_chrono_utc(dt: bson::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or_default()
}

/// Wire shape of a cache entry. `updated_at` is a real BSON date so the TTL
/// index can expire it.
#[derive(Serialize, Deserialize)]
struct CacheEntry {
    id: String,
    fields: Map<String, Value>,
    updated_at: bson::DateTime,
}

pub struct MongoDbCache {
    database: Database,
    coll_name: String,
}

impl MongoDbCache {
    /// `coll_name` is conventionally the source name ("crossref",
    /// "unpaywall", ...), giving each source its own keyspace.
    pub fn new(database: Database, coll_name: String) -> Self {
        Self {
            database,
            coll_name,
        }
    }

    fn collection(&self) -> Collection<CacheEntry> {
        self.database.collection(&self.coll_name)
    }
}

#[async_trait::async_trait]
impl Cache for MongoDbCache {
    async fn get(&self, id: &str) -> Result<Option<CachedDoc>, CacheError> {
        let filter = doc! { "id": id };
        let entry = self.collection().find_one(filter).await?;

        Ok(entry.map(|e| CachedDoc {
            id: e.id,
            fields: e.fields,
            updated_at: to_chrono_utc(e.updated_at),
        }))
    }

    async fn set(&self, id: &str, fields: Map<String, Value>) -> Result<(), CacheError> {
        let filter = doc! { "id": id };
        let update = doc! {
            "$set": {
                "fields": bson::to_bson(&fields)?,
                "updated_at": bson::DateTime::now(),
            },
            "$setOnInsert": { "id": id },
        };

        self.collection()
            .update_one(filter, update)
            .upsert(true)
            .await?;

        Ok(())
    }

    async fn ensure_indexes(&self, ttl: Duration) -> Result<(), CacheError> {
        let lookup = IndexModel::builder()
            .keys(doc! { "id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();

        let expiry = IndexModel::builder()
            .keys(doc! { "updated_at": 1 })
            .options(IndexOptions::builder().expire_after(ttl).build())
            .build();

        self.collection().create_index(lookup).await?;
        self.collection().create_index(expiry).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bson_dates_convert_to_chrono_at_millisecond_precision() {
        let millis = 1_700_000_000_123_i64;
        let converted = to_chrono_utc(bson::DateTime::from_millis(millis));
        assert_eq!(converted.timestamp_millis(), millis);
    }

    #[test]
    fn out_of_range_bson_dates_read_as_the_epoch() {
        let converted = to_chrono_utc(bson::DateTime::from_millis(i64::MIN));
        assert_eq!(converted, DateTime::<Utc>::default());
    }
}
