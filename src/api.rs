//! REST API source with page-number pagination.

use crate::error::{Error, Result};
use crate::extract::Page;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Default timeout for API requests in seconds.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 60;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-API-KEY";

/// HTTP client for one API server.
pub struct ApiSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiSource {
    /// Create a client for `base_url`.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_API_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Api {
                url: String::new(),
                status: 0,
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// URL of page `page` of `service`.
    pub fn page_url(&self, service: &str, page: u64) -> String {
        format!("{}/{}/?page={}", self.base_url, service, page)
    }

    /// Fetch one page body.
    pub async fn fetch_page(&self, service: &str, page: u64) -> Result<JsonValue> {
        let url = self.page_url(service, page);
        debug!("GET {}", url);

        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(|e| Error::Api {
            url: url.clone(),
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                url,
                status: status.as_u16(),
                message: body,
            });
        }

        response.json().await.map_err(|e| Error::Api {
            url,
            status: status.as_u16(),
            message: format!("Invalid JSON body: {}", e),
        })
    }
}

/// Lazy page sequence over one API service.
pub struct ApiExtractor<'a> {
    source: &'a ApiSource,
    service: String,
    total_pages: u64,
    next_page: u64,
}

impl<'a> ApiExtractor<'a> {
    /// Read the page count of `service`.
    #[instrument(skip(source))]
    pub async fn prepare(source: &'a ApiSource, service: &str) -> Result<Self> {
        let first = source.fetch_page(service, 1).await?;
        let total_pages = first
            .pointer("/pagination/total_page")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(0);
        info!("Total pages: {}", total_pages);

        Ok(Self {
            source,
            service: service.to_string(),
            total_pages,
            next_page: 1,
        })
    }

    /// Number of pages announced by the service.
    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    /// Fetch the next page with records.
    pub async fn next_batch(&mut self) -> Result<Option<Page>> {
        while self.next_page <= self.total_pages {
            let page = self.next_page;
            self.next_page += 1;

            let body = self.source.fetch_page(&self.service, page).await?;
            let records = match body.get("records") {
                Some(JsonValue::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            if records.is_empty() {
                debug!("Page {} has no records", page);
                continue;
            }
            info!("[{}/{}] Received {} records", page, self.total_pages, records.len());
            return Ok(Some(Page {
                index: page - 1,
                total: self.total_pages,
                records,
            }));
        }
        Ok(None)
    }

    /// Start again from the first page.
    pub fn restart(&mut self) {
        self.next_page = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_page(server: &MockServer, page: u64, body: JsonValue) {
        Mock::given(method("GET"))
            .and(path("/accounts/"))
            .and(query_param("page", page.to_string()))
            .and(header(API_KEY_HEADER, "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_pages_until_total() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            1,
            json!({"pagination": {"total_page": 3}, "records": [{"id": 1}, {"id": 2}]}),
        )
        .await;
        mount_page(&server, 2, json!({"records": []})).await;
        mount_page(&server, 3, json!({"records": [{"id": 3}]})).await;

        let source = ApiSource::new(server.uri(), Some("secret".into())).unwrap();
        let mut extractor = ApiExtractor::prepare(&source, "accounts").await.unwrap();
        assert_eq!(extractor.total_pages(), 3);

        let mut ids = Vec::new();
        while let Some(page) = extractor.next_batch().await.unwrap() {
            ids.extend(page.records.iter().map(|r| r["id"].as_i64().unwrap()));
        }
        assert_eq!(ids, vec![1, 2, 3]);

        extractor.restart();
        assert_eq!(extractor.next_batch().await.unwrap().unwrap().index, 0);
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let source = ApiSource::new(server.uri(), None).unwrap();
        let err = ApiExtractor::prepare(&source, "accounts").await.err().unwrap();
        match err {
            Error::Api {
                status, message, ..
            } => {
                assert_eq!(status, 403);
                assert_eq!(message, "forbidden");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_page_url() {
        let source = ApiSource::new("https://crm.example.com/api/v3/", None).unwrap();
        assert_eq!(
            source.page_url("products", 2),
            "https://crm.example.com/api/v3/products/?page=2"
        );
    }
}
