//! Generic packet handler shared by every external-enrichment source.
//!
//! A source plugs in as a [`SourceClient`]: it names the identifiers a record
//! carries, validates their format, runs one batched query, and maps result
//! fields onto the record. Everything else lives here, once: cache
//! short-circuiting, retry with backoff, the on-fail policy, result
//! distribution, and exactly-once release.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::buffered::{BufferOptions, Packet, PacketHandler, Verdict};
use crate::cache::{CacheError, DynCache};
use crate::config::{EnrichSettings, OnFailPolicy};
use crate::pipeline::EventContext;
use crate::report::Report;

pub mod crossref;
pub mod unpaywall;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("failed to send request: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected status: {0}")]
    Status(reqwest::StatusCode),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("failed to query {0} {1} times in a row")]
    RetriesExhausted(String, u32),

    #[error("failed to ensure indexes for the cache of {0}")]
    CacheInit(String, #[source] CacheError),
}

/// One result document: the fields to merge plus every identifier the
/// document answers for (a Crossref work matches both its DOI and its
/// alternative IDs, for instance).
#[derive(Debug, Clone)]
pub struct SourceDoc {
    pub ids: Vec<String>,
    pub fields: Map<String, Value>,
}

/// Capability set a source supplies to the generic engine.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Short name used in logs, counters and cache collections.
    fn name(&self) -> &'static str;

    /// Queryable identifiers of a record, lowercased. Empty means the source
    /// has nothing to look up for this record.
    fn identifiers(&self, ec: &EventContext) -> Vec<String>;

    /// Format validation. A record carrying a malformed identifier is
    /// skipped and counted, never queried.
    fn validate(&self, _id: &str) -> bool {
        true
    }

    /// One batched query for the given identifiers.
    async fn query(&self, ids: &[String]) -> Result<Vec<SourceDoc>, QueryError>;

    /// Merges a result document into a record. Fields the record already has
    /// win; enrichment only fills what is missing.
    fn enrich(&self, ec: &mut EventContext, fields: &Map<String, Value>) {
        for (field, value) in fields {
            ec.set_if_absent(field, value.clone());
        }
    }

    /// Server-reported minimum gap between queries, observed on the last
    /// response, if the source exposes one.
    fn rate_limit_gap(&self) -> Option<Duration> {
        None
    }
}

/// Resolved runtime options for one enricher.
#[derive(Debug, Clone)]
pub struct EnrichOptions {
    pub cache_enabled: bool,
    pub ttl: Duration,
    pub throttle: Duration,
    pub packet_size: usize,
    pub buffer_size: usize,
    pub max_attempts: u32,
    pub on_fail: OnFailPolicy,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            ttl: Duration::from_secs(3600 * 24 * 7),
            throttle: Duration::from_millis(200),
            packet_size: 50,
            buffer_size: 1000,
            max_attempts: 5,
            on_fail: OnFailPolicy::Abort,
        }
    }
}

impl EnrichOptions {
    /// Applies configured settings on top of a source's defaults. Zero-valued
    /// sizes and attempt counts fall back to the defaults.
    pub fn resolved(settings: &EnrichSettings, defaults: EnrichOptions) -> Self {
        Self {
            cache_enabled: settings.cache.unwrap_or(defaults.cache_enabled),
            ttl: settings
                .ttl_sec
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.ttl),
            throttle: settings
                .throttle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.throttle),
            packet_size: settings
                .packet_size
                .filter(|v| *v > 0)
                .unwrap_or(defaults.packet_size),
            buffer_size: settings
                .buffer_size
                .filter(|v| *v > 0)
                .unwrap_or(defaults.buffer_size),
            max_attempts: settings
                .max_attempts
                .filter(|v| *v > 0)
                .unwrap_or(defaults.max_attempts),
            on_fail: settings.on_fail.unwrap_or(defaults.on_fail),
        }
    }

    pub fn buffer_options(&self) -> BufferOptions {
        BufferOptions {
            buffer_size: self.buffer_size,
            packet_size: self.packet_size,
            group_by: None,
        }
    }
}

/// The generic buffered enricher: a [`PacketHandler`] parameterized by a
/// [`SourceClient`].
pub struct Enricher<C: SourceClient> {
    client: C,
    cache: Option<DynCache>,
    backoff: Backoff,
    max_attempts: u32,
    on_fail: OnFailPolicy,
    report: Report,
}

impl<C: SourceClient> Enricher<C> {
    /// Verifies cache indexes before the enricher becomes usable; a failure
    /// here is a configuration error and the middleware never activates.
    pub async fn new(
        client: C,
        cache: Option<DynCache>,
        options: &EnrichOptions,
        report: Report,
    ) -> Result<Self, EnrichError> {
        let cache = if options.cache_enabled { cache } else { None };
        info!(
            source = client.name(),
            cache = cache.is_some(),
            throttle_ms = options.throttle.as_millis() as u64,
            packet_size = options.packet_size,
            buffer_size = options.buffer_size,
            "enrichment activated"
        );

        if let Some(cache) = &cache {
            cache
                .ensure_indexes(options.ttl)
                .await
                .map_err(|err| EnrichError::CacheInit(client.name().to_owned(), err))?;
        }

        for suffix in ["queries", "query-fails", "cache-fails", "invalid-ids"] {
            report.set(&format!("{}-{}", client.name(), suffix), 0);
        }

        Ok(Self {
            client,
            cache,
            backoff: Backoff::new(options.throttle).with_jitter(),
            max_attempts: options.max_attempts,
            on_fail: options.on_fail,
            report,
        })
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn counter(&self, suffix: &str) -> String {
        format!("{}-{}", self.client.name(), suffix)
    }

    /// Runs the retry loop for one packet query. Waits one throttle interval
    /// before every attempt, doubling per failed attempt. Under the `retry`
    /// policy the loop never gives up; the backoff cap bounds the delay.
    async fn query_with_retry(&mut self, ids: &[String]) -> Result<Vec<SourceDoc>, EnrichError> {
        let name = self.client.name();
        let mut attempt: u32 = 0;

        loop {
            if attempt >= self.max_attempts && self.on_fail != OnFailPolicy::Retry {
                return Err(EnrichError::RetriesExhausted(name.to_owned(), attempt));
            }

            sleep(self.backoff.delay(attempt)).await;
            self.report.inc(&self.counter("queries"));

            let outcome = self.client.query(ids).await;

            if let Some(gap) = self.client.rate_limit_gap() {
                if gap != self.backoff.throttle() {
                    info!(source = name, gap_ms = gap.as_millis() as u64, "rate limit reported, adjusting throttle");
                    self.backoff.set_throttle(gap);
                }
            }

            match outcome {
                Ok(docs) => return Ok(docs),
                Err(err) => {
                    error!(source = name, attempt, "{err}");
                    self.report.inc(&self.counter("query-fails"));
                    attempt += 1;
                }
            }
        }
    }

    /// Persists one document (possibly the empty known-absent marker) under
    /// one identifier. Cache write failures are soft: counted, never fatal.
    async fn cache_put(&self, id: &str, fields: &Map<String, Value>) {
        let Some(cache) = &self.cache else { return };

        if let Err(err) = cache.set(id, fields.clone()).await {
            warn!(source = self.client.name(), id, "cache write failed: {err}");
            self.report.inc(&self.counter("cache-fails"));
        }
    }

    /// Cache lookup treating read failures as misses.
    async fn cache_get(&self, id: &str) -> Option<crate::cache::CachedDoc> {
        let cache = self.cache.as_ref()?;

        match cache.get(id).await {
            Ok(doc) => doc,
            Err(err) => {
                warn!(source = self.client.name(), id, "cache read failed: {err}");
                self.report.inc(&self.counter("cache-fails"));
                None
            }
        }
    }
}

#[async_trait]
impl<C: SourceClient> PacketHandler for Enricher<C> {
    /// Keeps only records worth a query: drops records with no identifier,
    /// records with a malformed identifier (counted), and records answered
    /// by the cache (enriched on the spot when the cached document is not
    /// the known-absent marker).
    async fn filter(&mut self, ec: &mut EventContext) -> Result<Verdict, anyhow::Error> {
        let ids = self.client.identifiers(ec);
        if ids.is_empty() {
            return Ok(Verdict::Drop);
        }

        for id in &ids {
            if !self.client.validate(id) {
                self.report.inc(&self.counter("invalid-ids"));
                return Ok(Verdict::Drop);
            }
        }

        for id in &ids {
            if let Some(doc) = self.cache_get(id).await {
                if !doc.is_absent_marker() {
                    self.client.enrich(ec, &doc.fields);
                }
                return Ok(Verdict::Drop);
            }
        }

        Ok(Verdict::Keep)
    }

    async fn on_packet(&mut self, packet: Packet) -> anyhow::Result<()> {
        let name = self.client.name();

        // unique identifiers of the packet, in arrival order
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for (ec, _) in &packet.ecs {
            for id in self.client.identifiers(ec) {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }

        if ids.is_empty() {
            packet.release_all();
            return Ok(());
        }

        let docs = match self.query_with_retry(&ids).await {
            Ok(docs) => docs,
            Err(err) => {
                if self.on_fail == OnFailPolicy::Ignore {
                    error!(source = name, "ignoring packet enrichment: {err}");
                    packet.release_all();
                    return Ok(());
                }

                let shared = Arc::new(anyhow::Error::from(err));
                packet.reject_all(&shared);
                return Err(anyhow::anyhow!(shared));
            }
        };

        // index every document by each identifier it carries
        let mut results: HashMap<String, Map<String, Value>> = HashMap::new();
        for doc in docs {
            for id in &doc.ids {
                let id = id.to_lowercase();
                self.cache_put(&id, &doc.fields).await;
                results.insert(id, doc.fields.clone());
            }
        }

        // distribute: enrich matched records, mark unmatched identifiers as
        // known absent, release every record exactly once
        for (mut ec, cont) in packet.ecs {
            for id in self.client.identifiers(&ec) {
                if let Some(fields) = results.get(&id) {
                    self.client.enrich(&mut ec, fields);
                } else {
                    self.cache_put(&id, &Map::new()).await;
                }
            }
            cont.release(ec);
        }

        Ok(())
    }
}
