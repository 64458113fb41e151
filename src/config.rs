//! Job configuration, loaded once from a TOML file before any record is
//! processed. Invalid values (unknown provider, unknown on-fail policy) fail
//! the load; the pipeline never starts half-configured.

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub enrichers: Vec<EnricherConfig>,
    /// Shared cache backend. Absent means every enricher runs with an
    /// in-memory cache scoped to the job.
    pub cache: Option<CacheServiceConfig>,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let cfg = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&cfg)?)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct CacheServiceConfig {
    pub connection_string: String,
    pub db_name: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "provider")]
pub enum EnricherConfig {
    #[serde(rename = "crossref")]
    Crossref {
        #[serde(default)]
        include_license: bool,
        #[serde(flatten)]
        settings: EnrichSettings,
    },
    #[serde(rename = "unpaywall")]
    Unpaywall {
        email: String,
        #[serde(flatten)]
        settings: EnrichSettings,
    },
}

impl EnricherConfig {
    pub fn provider(&self) -> &'static str {
        match self {
            EnricherConfig::Crossref { .. } => "crossref",
            EnricherConfig::Unpaywall { .. } => "unpaywall",
        }
    }

    pub fn settings(&self) -> &EnrichSettings {
        match self {
            EnricherConfig::Crossref { settings, .. } => settings,
            EnricherConfig::Unpaywall { settings, .. } => settings,
        }
    }
}

/// Per-enricher tuning. Every field is optional; unset or out-of-range
/// values fall back to the source adapter's documented defaults.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct EnrichSettings {
    pub cache: Option<bool>,
    pub ttl_sec: Option<u64>,
    pub throttle_ms: Option<u64>,
    pub packet_size: Option<usize>,
    pub buffer_size: Option<usize>,
    pub max_attempts: Option<u32>,
    pub on_fail: Option<OnFailPolicy>,
}

/// What to do with a packet once its retry budget is exhausted.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFailPolicy {
    /// Stop the whole stream (the default).
    #[default]
    Abort,
    /// Release the affected records unenriched and keep going.
    Ignore,
    /// Keep retrying, with the backoff delay capped.
    Retry,
}
