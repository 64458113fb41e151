//! Unpaywall source adapter: one `GET /v2/{doi}` per identifier, driven
//! through the same buffered engine with a small packet size. A 404 is a
//! meaningful answer (no open-access data for this DOI) and becomes the
//! known-absent marker rather than a failure.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use url::Url;

use super::{EnrichOptions, QueryError, SourceClient, SourceDoc};
use crate::pipeline::EventContext;

const DEFAULT_BASE_URL: &str = "https://api.unpaywall.org";

/// result field name -> EC field name
const ENRICHMENT_FIELDS: [(&str, &str); 5] = [
    ("is_oa", "is_oa"),
    ("journal_is_in_doaj", "journal_is_in_doaj"),
    ("journal_is_oa", "journal_is_oa"),
    ("oa_status", "oa_status"),
    ("updated", "oa_updated"),
];

pub struct UnpaywallClient {
    client: reqwest::Client,
    base_url: Url,
    email: String,
}

impl UnpaywallClient {
    pub fn new(email: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, email)
    }

    pub fn with_base_url(base_url: &str, email: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            email: email.into(),
        })
    }

    /// Unpaywall defaults: small packets (one request per DOI), 100 ms
    /// throttle, 200 buffered ECs.
    pub fn default_options() -> EnrichOptions {
        EnrichOptions {
            throttle: Duration::from_millis(100),
            packet_size: 10,
            buffer_size: 200,
            ..EnrichOptions::default()
        }
    }

    async fn query_one(&self, doi: &str) -> Result<SourceDoc, QueryError> {
        let url = self
            .base_url
            .join(&format!("/v2/{doi}"))
            .map_err(|err| QueryError::InvalidResponse(err.to_string()))?;

        let response = self
            .client
            .get(url)
            .query(&[("email", self.email.as_str())])
            .send()
            .await?;

        let status = response.status();

        // 404 means "no open-access data for this DOI": a valid, cacheable answer
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(SourceDoc {
                ids: vec![doi.to_owned()],
                fields: Map::new(),
            });
        }

        if !status.is_success() && status != reqwest::StatusCode::NOT_MODIFIED {
            return Err(QueryError::Status(status));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| QueryError::InvalidResponse(err.to_string()))?;

        let Some(result) = body.as_object() else {
            return Err(QueryError::InvalidResponse("not a JSON object".to_owned()));
        };

        let mut fields = Map::new();
        for (source_field, ec_field) in ENRICHMENT_FIELDS {
            if let Some(value) = result.get(source_field) {
                fields.insert(ec_field.to_owned(), value.clone());
            }
        }
        fields.insert(
            "oa_request_date".to_owned(),
            Value::from(Utc::now().to_rfc3339()),
        );

        Ok(SourceDoc {
            ids: vec![doi.to_owned()],
            fields,
        })
    }
}

#[async_trait]
impl SourceClient for UnpaywallClient {
    fn name(&self) -> &'static str {
        "unpaywall"
    }

    fn identifiers(&self, ec: &EventContext) -> Vec<String> {
        ec.str_field("doi")
            .map(|doi| vec![doi.to_lowercase()])
            .unwrap_or_default()
    }

    /// One request per DOI; the first hard failure fails the packet so the
    /// engine's retry loop can take over.
    async fn query(&self, ids: &[String]) -> Result<Vec<SourceDoc>, QueryError> {
        let mut docs = Vec::with_capacity(ids.len());
        for doi in ids {
            docs.push(self.query_one(doi).await?);
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client(base_url: &str) -> UnpaywallClient {
        UnpaywallClient::with_base_url(base_url, "ops@example.org").unwrap()
    }

    #[tokio::test]
    async fn maps_open_access_fields_and_stamps_request_date() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "is_oa": true,
            "journal_is_in_doaj": false,
            "journal_is_oa": false,
            "oa_status": "green",
            "updated": "2024-11-02T10:00:00.000000",
            "doi_url": "https://doi.org/10.1234/abc"
        });
        let mock = server
            .mock("GET", "/v2/10.1234/abc")
            .match_query(Matcher::UrlEncoded(
                "email".into(),
                "ops@example.org".into(),
            ))
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let docs = client(&server.url())
            .query(&["10.1234/abc".to_owned()])
            .await
            .unwrap();
        mock.assert_async().await;

        let fields = &docs[0].fields;
        assert_eq!(fields["is_oa"], true);
        assert_eq!(fields["oa_status"], "green");
        assert_eq!(fields["oa_updated"], "2024-11-02T10:00:00.000000");
        assert!(fields.contains_key("oa_request_date"));
        assert!(!fields.contains_key("doi_url"), "unmapped fields stay out");
    }

    #[tokio::test]
    async fn not_found_becomes_a_known_absent_document() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v2/10.1234/unknown")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let docs = client(&server.url())
            .query(&["10.1234/unknown".to_owned()])
            .await
            .unwrap();

        assert_eq!(docs[0].ids, vec!["10.1234/unknown"]);
        assert!(docs[0].fields.is_empty());
    }

    #[tokio::test]
    async fn server_errors_fail_the_whole_batch() {
        let mut server = mockito::Server::new_async().await;
        let ok_body = serde_json::json!({"is_oa": false}).to_string();
        let _first = server
            .mock("GET", "/v2/10.1234/good")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(ok_body)
            .create_async()
            .await;
        let _second = server
            .mock("GET", "/v2/10.1234/bad")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let err = client(&server.url())
            .query(&["10.1234/good".to_owned(), "10.1234/bad".to_owned()])
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Status(s) if s.as_u16() == 500));
    }

    #[tokio::test]
    async fn identifiers_require_a_doi() {
        let client = client("https://example.org");

        let mut ec = EventContext::new();
        assert!(client.identifiers(&ec).is_empty());

        ec.set("doi", "10.1234/ABC");
        assert_eq!(client.identifiers(&ec), vec!["10.1234/abc"]);
    }
}
