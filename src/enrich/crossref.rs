//! Crossref source adapter: batched DOI / alternative-ID lookups against the
//! `works` endpoint, with field mapping onto EC names and adaptive throttling
//! from the rate-limit headers Crossref returns on every response.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::{Map, Value, json};
use url::Url;

use super::{EnrichOptions, QueryError, SourceClient, SourceDoc};
use crate::backoff::rate_limit_gap;
use crate::pipeline::EventContext;

const DEFAULT_BASE_URL: &str = "https://api.crossref.org";

static DOI_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^10\.[0-9]{4,}/[a-z0-9\-._: ;()/]+$").unwrap());

pub struct CrossrefClient {
    client: reqwest::Client,
    base_url: Url,
    rows: usize,
    include_license: bool,
    rate_limit: Mutex<Option<Duration>>,
}

impl CrossrefClient {
    pub fn new(rows: usize, include_license: bool) -> anyhow::Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, rows, include_license)
    }

    pub fn with_base_url(base_url: &str, rows: usize, include_license: bool) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            rows,
            include_license,
            rate_limit: Mutex::new(None),
        })
    }

    /// Crossref defaults: 50 DOIs per query, 1000 buffered ECs, 200 ms
    /// throttle, 5 attempts, abort on exhaustion.
    pub fn default_options() -> EnrichOptions {
        EnrichOptions::default()
    }

    fn observe_rate_limit(&self, headers: &HeaderMap) {
        let limit = headers
            .get("x-rate-limit-limit")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let interval = headers
            .get("x-rate-limit-interval")
            .and_then(|v| v.to_str().ok());

        if let (Some(limit), Some(interval)) = (limit, interval) {
            *self.rate_limit.lock() = rate_limit_gap(limit, interval);
        }
    }

    /// Identifiers a work answers for: its DOI and its alternative IDs.
    fn doc_ids(item: &Value) -> Vec<String> {
        let mut ids = Vec::new();

        if let Some(doi) = item.get("DOI").and_then(Value::as_str) {
            ids.push(doi.to_lowercase());
        }
        if let Some(alternatives) = item.get("alternative-id").and_then(Value::as_array) {
            for alt in alternatives {
                if let Some(alt) = alt.as_str() {
                    ids.push(alt.to_lowercase());
                }
            }
        }

        ids
    }

    /// Maps a Crossref work onto EC field names.
    fn map_fields(&self, item: &Value) -> Map<String, Value> {
        let mut fields = Map::new();
        let mut set = |field: &str, value: Option<Value>| {
            if let Some(value) = value {
                fields.insert(field.to_owned(), value);
            }
        };

        let first_of = |field: &str| {
            item.get(field)
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .cloned()
        };

        set("publication_title", first_of("container-title"));
        set("title", first_of("title"));
        set("doi", item.get("DOI").cloned());
        set("publisher_name", item.get("publisher").cloned());
        set("type", item.get("type").cloned());

        let issued_year = item
            .pointer("/issued/date-parts/0/0")
            .and_then(Value::as_i64);
        set("publication_date", issued_year.map(Value::from));

        let subject = item.get("subject").and_then(Value::as_array).map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        });
        set("subject", subject.map(Value::from));

        if let Some(issn_types) = item.get("issn-type").and_then(Value::as_array) {
            for issn in issn_types {
                let value = issn.get("value").cloned();
                match issn.get("type").and_then(Value::as_str) {
                    Some("print") => set("print_identifier", value),
                    Some("electronic") => set("online_identifier", value),
                    _ => {}
                }
            }
        } else if let Some(issns) = item.get("ISSN").and_then(Value::as_array) {
            set("print_identifier", issns.first().cloned());
            set("online_identifier", issns.get(1).cloned());
        }

        if self.include_license {
            if let Some(license) = item.get("license") {
                set("license", Some(json!(license.to_string())));
            }
        }

        fields
    }
}

#[async_trait]
impl SourceClient for CrossrefClient {
    fn name(&self) -> &'static str {
        "crossref"
    }

    fn identifiers(&self, ec: &EventContext) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(doi) = ec.str_field("doi") {
            ids.push(doi.to_lowercase());
        }
        if let Some(pii) = ec.str_field("pii") {
            ids.push(pii.to_lowercase());
        }
        ids
    }

    /// Anything shaped like a DOI must match the DOI pattern; other
    /// identifiers (PIIs) pass through.
    fn validate(&self, id: &str) -> bool {
        !id.starts_with("10.") || DOI_PATTERN.is_match(id)
    }

    async fn query(&self, ids: &[String]) -> Result<Vec<SourceDoc>, QueryError> {
        let filter = ids
            .iter()
            .map(|id| {
                if DOI_PATTERN.is_match(id) {
                    format!("doi:{id}")
                } else {
                    format!("alternative-id:{id}")
                }
            })
            .collect::<Vec<_>>()
            .join(",");

        let url = self
            .base_url
            .join("/works")
            .map_err(|err| QueryError::InvalidResponse(err.to_string()))?;

        let response = self
            .client
            .get(url)
            .query(&[("filter", filter.as_str()), ("rows", &self.rows.to_string())])
            .send()
            .await?;

        self.observe_rate_limit(response.headers());

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status(status));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| QueryError::InvalidResponse(err.to_string()))?;

        let Some(items) = body.pointer("/message/items").and_then(Value::as_array) else {
            return Err(QueryError::InvalidResponse(
                "missing message.items array".to_owned(),
            ));
        };

        Ok(items
            .iter()
            .map(|item| SourceDoc {
                ids: Self::doc_ids(item),
                fields: self.map_fields(item),
            })
            .collect())
    }

    fn rate_limit_gap(&self) -> Option<Duration> {
        *self.rate_limit.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(base_url: &str) -> CrossrefClient {
        CrossrefClient::with_base_url(base_url, 50, false).unwrap()
    }

    #[test]
    fn doi_pattern_accepts_real_dois() {
        for doi in [
            "10.1234/abc",
            "10.1016/s0140-6736(20)30183-5",
            "10.1002/(sici)1099-0690",
            "10.1007/978-3-030-12345-6_7",
        ] {
            assert!(client("https://example.org").validate(doi), "{doi}");
        }
    }

    #[test]
    fn doi_pattern_rejects_malformed_dois() {
        for doi in ["10.12/short-prefix", "10.1234", "10.1234/", "10.1234/bad|pipe"] {
            assert!(!client("https://example.org").validate(doi), "{doi}");
        }
        // non-DOI identifiers are not pattern-checked
        assert!(client("https://example.org").validate("s0140673620301835"));
    }

    #[test]
    fn identifiers_are_lowercased() {
        let mut ec = EventContext::new();
        ec.set("doi", "10.1234/ABC.DEF");
        ec.set("pii", "S0140673620301835");

        let ids = client("https://example.org").identifiers(&ec);
        assert_eq!(ids, vec!["10.1234/abc.def", "s0140673620301835"]);
    }

    #[tokio::test]
    async fn query_parses_works_and_maps_fields() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "message": {
                "items": [{
                    "DOI": "10.1234/ABC",
                    "alternative-id": ["S0140673620301835"],
                    "title": ["A Study of Caches"],
                    "container-title": ["Journal of Plumbing"],
                    "publisher": "Springer",
                    "type": "journal-article",
                    "subject": ["Caching", "Plumbing"],
                    "issued": {"date-parts": [[2019, 4, 1]]},
                    "issn-type": [
                        {"type": "print", "value": "1234-5678"},
                        {"type": "electronic", "value": "8765-4321"}
                    ]
                }]
            }
        });

        let mock = server
            .mock("GET", "/works")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("rows".into(), "50".into()),
                Matcher::Regex("filter=doi".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let docs = client(&server.url())
            .query(&["10.1234/abc".to_owned()])
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].ids, vec!["10.1234/abc", "s0140673620301835"]);

        let fields = &docs[0].fields;
        assert_eq!(fields["title"], "A Study of Caches");
        assert_eq!(fields["publication_title"], "Journal of Plumbing");
        assert_eq!(fields["publisher_name"], "Springer");
        assert_eq!(fields["type"], "journal-article");
        assert_eq!(fields["subject"], "Caching, Plumbing");
        assert_eq!(fields["publication_date"], 2019);
        assert_eq!(fields["print_identifier"], "1234-5678");
        assert_eq!(fields["online_identifier"], "8765-4321");
        assert!(!fields.contains_key("license"));
    }

    #[tokio::test]
    async fn non_success_status_is_a_query_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/works")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let err = client(&server.url())
            .query(&["10.1234/abc".to_owned()])
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Status(s) if s.as_u16() == 503));
    }

    #[tokio::test]
    async fn missing_items_array_is_an_invalid_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/works")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"message": "nope"}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .query(&["10.1234/abc".to_owned()])
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn rate_limit_headers_become_a_throttle_gap() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/works")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("x-rate-limit-limit", "50")
            .with_header("x-rate-limit-interval", "1s")
            .with_body(r#"{"message": {"items": []}}"#)
            .create_async()
            .await;

        let client = client(&server.url());
        assert_eq!(client.rate_limit_gap(), None);

        client.query(&["10.1234/abc".to_owned()]).await.unwrap();
        assert_eq!(client.rate_limit_gap(), Some(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn license_is_mapped_only_when_requested() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "message": {
                "items": [{
                    "DOI": "10.1234/abc",
                    "license": [{"URL": "https://creativecommons.org/licenses/by/4.0/"}]
                }]
            }
        });
        let _mock = server
            .mock("GET", "/works")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body.to_string())
            .expect(2)
            .create_async()
            .await;

        let with_license = CrossrefClient::with_base_url(&server.url(), 50, true).unwrap();
        let docs = with_license.query(&["10.1234/abc".to_owned()]).await.unwrap();
        assert!(docs[0].fields["license"]
            .as_str()
            .unwrap()
            .contains("creativecommons.org"));

        let without = client(&server.url());
        let docs = without.query(&["10.1234/abc".to_owned()]).await.unwrap();
        assert!(!docs[0].fields.contains_key("license"));
    }
}
