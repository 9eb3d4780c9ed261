use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use auction_adapters::parse_page;
use auction_core::PageFetchResult;
use auction_storage::HttpFetcher;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::paginator::PageSource;

/// Replays a search request captured from a logged-in browser session, one page at a time.
#[derive(Debug, Clone)]
pub struct SearchApiPageSource {
    http: HttpFetcher,
    url: String,
    headers: BTreeMap<String, String>,
    body: JsonValue,
}

impl SearchApiPageSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>, headers: BTreeMap<String, String>, body: JsonValue) -> Self {
        Self {
            http,
            url: url.into(),
            headers,
            body,
        }
    }

    /// Request body for one page: the captured body with `skip`/`top` rewritten.
    pub fn page_body(&self, page_number: u32, page_size: u32) -> JsonValue {
        let mut body = match &self.body {
            JsonValue::Object(object) => object.clone(),
            _ => Map::new(),
        };
        let skip = u64::from(page_number.saturating_sub(1)) * u64::from(page_size);
        body.insert("skip".to_string(), JsonValue::from(skip));
        body.insert("top".to_string(), JsonValue::from(page_size));
        JsonValue::Object(body)
    }
}

#[async_trait]
impl PageSource for SearchApiPageSource {
    async fn fetch_page(&self, source_id: &str, page_number: u32, page_size: u32) -> Result<PageFetchResult> {
        let body = self.page_body(page_number, page_size);
        let response = self
            .http
            .post_json(source_id, &self.url, &self.headers, &body)
            .await
            .with_context(|| format!("requesting page {page_number} of {source_id}"))?;
        debug!(
            source_id,
            page = page_number,
            status = response.status.as_u16(),
            bytes = response.body.len(),
            "search response received"
        );
        parse_page(source_id, page_number, &response.body)
            .with_context(|| format!("decoding page {page_number} of {source_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auction_storage::HttpClientConfig;
    use serde_json::json;

    #[test]
    fn page_body_rewrites_skip_and_top_only() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let source = SearchApiPageSource::new(
            http,
            "https://search.example.invalid/lots",
            BTreeMap::new(),
            json!({"search": "*", "filter": "saleId eq 11924", "skip": 0, "top": 24}),
        );
        let body = source.page_body(3, 120);
        assert_eq!(body["skip"], json!(240));
        assert_eq!(body["top"], json!(120));
        assert_eq!(body["filter"], json!("saleId eq 11924"));
        assert_eq!(source.page_body(1, 120)["skip"], json!(0));
    }
}
