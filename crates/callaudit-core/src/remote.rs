//! HTTP implementation of the paged-query and aggregation-endpoint contracts.
//!
//! `GET {base}/calls` answers the paged query; `POST {base}/rpc/call_metrics`
//! answers the aggregation endpoint. Transport errors, 429 and 5xx are retried
//! with exponential backoff; anything else is returned as is.

use crate::error::FetchError;
use crate::sources::{AggregationEndpoint, AggregationRequest, PagedQuery, RecordQuery};
use crate::window::TimeWindow;
use crate::{CallRecord, Page};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 200;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const MAX_ERROR_BODY: usize = 512;

const CALLS_PATH: &str = "calls";
const RPC_PATH: &str = "rpc/call_metrics";

#[derive(Deserialize)]
struct RecordsResponse {
    #[serde(alias = "data")]
    records: Vec<CallRecord>,
    #[serde(default, alias = "totalCount", alias = "count")]
    total_count: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RowsResponse {
    Wrapped {
        #[serde(alias = "data")]
        rows: Vec<Value>,
        #[serde(default, alias = "totalCount", alias = "count")]
        total_count: Option<u64>,
    },
    Bare(Vec<Value>),
}

#[derive(Debug, Clone)]
pub struct HttpRecordSource {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    max_retries: u32,
    initial_backoff: Duration,
}

impl HttpRecordSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build http client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send the request built by `build`, retrying retryable failures.
    async fn send_with_retry<F>(&self, build: F) -> Result<String, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let err = match self.authorize(build()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .text()
                            .await
                            .map_err(|e| FetchError::Network(format!("failed to read body: {}", e)));
                    }
                    let body = response.text().await.unwrap_or_default();
                    FetchError::Http {
                        status: status.as_u16(),
                        message: truncate(&body, MAX_ERROR_BODY),
                    }
                }
                Err(e) => FetchError::Network(e.to_string()),
            };

            attempt += 1;
            if !err.is_retryable() || attempt >= self.max_retries {
                return Err(err);
            }
            let backoff = backoff_for(self.initial_backoff, attempt);
            debug!(attempt, ?backoff, error = %err, "retrying request");
            tokio::time::sleep(backoff).await;
        }
    }
}

#[async_trait]
impl PagedQuery for HttpRecordSource {
    async fn fetch_page(
        &self,
        query: &RecordQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Page<CallRecord>, FetchError> {
        let url = self.url(CALLS_PATH);
        let params = record_query_params(query, offset, limit);
        let body = self
            .send_with_retry(|| self.client.get(&url).query(&params))
            .await?;
        decode_records_page(&body)
    }
}

#[async_trait]
impl AggregationEndpoint for HttpRecordSource {
    async fn fetch_rows(
        &self,
        request: &AggregationRequest,
        offset: usize,
        limit: usize,
    ) -> Result<Page<Value>, FetchError> {
        let url = self.url(RPC_PATH);
        let payload = aggregation_body(request, offset, limit);
        let body = self
            .send_with_retry(|| self.client.post(&url).json(&payload))
            .await?;
        decode_rows_page(&body)
    }
}

fn window_params(window: &TimeWindow) -> [(&'static str, String); 3] {
    [
        ("start", window.start().to_rfc3339()),
        ("end", window.end().to_rfc3339()),
        ("utc_offset", window.utc_offset_seconds().to_string()),
    ]
}

pub(crate) fn record_query_params(
    query: &RecordQuery,
    offset: usize,
    limit: usize,
) -> Vec<(&'static str, String)> {
    let mut params: Vec<(&'static str, String)> = window_params(&query.window).into();
    if let Some(identity) = &query.identity {
        params.push(("identity", identity.clone()));
    }
    if let Some(status) = &query.status {
        params.push(("status", status.clone()));
    }
    params.push(("order", query.sort.to_query_value()));
    params.push(("limit", limit.to_string()));
    params.push(("offset", offset.to_string()));
    params
}

pub(crate) fn aggregation_body(request: &AggregationRequest, offset: usize, limit: usize) -> Value {
    let [(_, start), (_, end), (_, _)] = window_params(&request.window);
    json!({
        "start": start,
        "end": end,
        "utc_offset": request.window.utc_offset_seconds(),
        "identity": request.identity,
        "limit": limit,
        "offset": offset,
    })
}

pub(crate) fn decode_records_page(body: &str) -> Result<Page<CallRecord>, FetchError> {
    let response: RecordsResponse = serde_json::from_str(body)?;
    let total = response.total_count.unwrap_or(0);
    Ok(Page::new(response.records, total))
}

/// A bare array is an unpaged result: its length is the total.
pub(crate) fn decode_rows_page(body: &str) -> Result<Page<Value>, FetchError> {
    match serde_json::from_str::<RowsResponse>(body) {
        Ok(RowsResponse::Wrapped { rows, total_count }) => {
            Ok(Page::new(rows, total_count.unwrap_or(0)))
        }
        Ok(RowsResponse::Bare(rows)) => {
            let total = rows.len() as u64;
            Ok(Page::new(rows, total))
        }
        Err(_) => {
            // Re-parse as plain JSON for a more useful message than the untagged error.
            let value: Value = serde_json::from_str(body)?;
            Err(FetchError::MalformedPayload(format!(
                "expected rows array or {{rows, total_count}}, got {}",
                truncate(&value.to_string(), MAX_ERROR_BODY)
            )))
        }
    }
}

/// `initial * 2^(attempt - 1)`, saturating instead of overflowing.
fn backoff_for(initial: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    initial.saturating_mul(factor)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{SortField, SortKey};

    fn window() -> TimeWindow {
        TimeWindow::new(
            "2024-03-01T00:00:00Z".parse().unwrap(),
            "2024-03-08T00:00:00Z".parse().unwrap(),
            -18_000,
        )
        .unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let source = HttpRecordSource::with_client(reqwest::Client::new(), "https://api.test/v1/");
        assert_eq!(source.base_url(), "https://api.test/v1");
        assert_eq!(source.url(CALLS_PATH), "https://api.test/v1/calls");
    }

    #[test]
    fn test_record_query_params() {
        let query = RecordQuery {
            window: window(),
            identity: Some("Casey".into()),
            status: None,
            sort: SortKey {
                field: SortField::Timestamp,
                descending: false,
            },
        };
        let params = record_query_params(&query, 2000, 1000);
        assert_eq!(
            params,
            vec![
                ("start", "2024-03-01T00:00:00+00:00".to_string()),
                ("end", "2024-03-08T00:00:00+00:00".to_string()),
                ("utc_offset", "-18000".to_string()),
                ("identity", "Casey".to_string()),
                ("order", "timestamp.asc,id.asc".to_string()),
                ("limit", "1000".to_string()),
                ("offset", "2000".to_string()),
            ]
        );
    }

    #[test]
    fn test_aggregation_body() {
        let request = AggregationRequest {
            window: window(),
            identity: None,
        };
        let body = aggregation_body(&request, 0, 500);
        assert_eq!(body["start"], "2024-03-01T00:00:00+00:00");
        assert_eq!(body["utc_offset"], -18_000);
        assert_eq!(body["identity"], Value::Null);
        assert_eq!(body["limit"], 500);
    }

    #[test]
    fn test_decode_records_page() {
        let body = r#"{"records": [{"id": 1, "timestamp": "2024-03-01T10:00:00Z", "sdr": "Casey", "status": "answered"}], "totalCount": 42}"#;
        let page = decode_records_page(body).unwrap();
        assert_eq!(page.total_count, 42);
        assert_eq!(page.records[0].id, "1");
        assert_eq!(page.records[0].identity, "Casey");
    }

    #[test]
    fn test_decode_records_page_malformed() {
        let err = decode_records_page(r#"{"records": "nope"}"#).unwrap_err();
        assert!(matches!(err, FetchError::MalformedPayload(_)));
        let err = decode_records_page("<html>").unwrap_err();
        assert!(matches!(err, FetchError::MalformedPayload(_)));
    }

    #[test]
    fn test_decode_rows_page_shapes() {
        let wrapped = decode_rows_page(r#"{"rows": [{"day": "2024-03-01", "total": 3}], "total_count": 9}"#).unwrap();
        assert_eq!(wrapped.total_count, 9);
        assert_eq!(wrapped.records.len(), 1);

        let bare = decode_rows_page(r#"[{"sdr": "Casey", "calls": 3}, {"sdr": "Drew", "calls": 1}]"#).unwrap();
        assert_eq!(bare.total_count, 2);

        let err = decode_rows_page(r#"{"unexpected": true}"#).unwrap_err();
        assert!(matches!(err, FetchError::MalformedPayload(_)));
    }

    #[test]
    fn test_backoff_doubles_and_saturates() {
        let initial = Duration::from_millis(INITIAL_BACKOFF_MS);
        assert_eq!(backoff_for(initial, 1), Duration::from_millis(200));
        assert_eq!(backoff_for(initial, 3), Duration::from_millis(800));
        assert_eq!(backoff_for(initial, 40), initial.saturating_mul(u32::MAX));
        assert_eq!(backoff_for(Duration::MAX, 2), Duration::MAX);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééé", 3), "é...");
    }
}
