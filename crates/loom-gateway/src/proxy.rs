//! The proxy engine — one pooled client to the upstream API.

use std::time::Duration;

use axum::http::{HeaderMap, Method};
use tracing::debug;

use loom_core::error::{LoomError, Result};

/// Generous read timeout: an LLM stream can sit quiet for a long time
/// between chunks, but not five minutes.
const READ_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request headers that must not cross the proxy boundary.
const DROP_REQUEST_HEADERS: [&str; 2] = ["host", "content-length"];

/// Response headers invalidated by the client's transparent decompression
/// and re-framing.
const DROP_RESPONSE_HEADERS: [&str; 3] = ["content-encoding", "content-length", "transfer-encoding"];

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| LoomError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Forward a request upstream, header-filtered, query preserved.
    pub async fn forward(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
        query: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }

        debug!(%method, %url, "forwarding upstream");

        self.client
            .request(method, &url)
            .headers(filter_request_headers(headers))
            .body(body)
            .send()
            .await
            .map_err(|e| LoomError::Upstream(e.to_string()))
    }
}

pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if DROP_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if DROP_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn request_filter_drops_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("loom.local"));
        headers.insert("content-length", HeaderValue::from_static("123"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-test"));

        let filtered = filter_request_headers(&headers);
        assert!(!filtered.contains_key("host"));
        assert!(!filtered.contains_key("content-length"));
        assert_eq!(filtered.get("x-api-key").unwrap(), "sk-test");
    }

    #[test]
    fn response_filter_drops_framing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("request-id", HeaderValue::from_static("req_1"));

        let filtered = filter_response_headers(&headers);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("request-id").unwrap(), "req_1");
    }
}
