//! The catch-all proxy handler — every request that isn't /health lands
//! here, gets transformed by its pattern, and is forwarded upstream.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{info, warn, Instrument};

use loom_core::metadata::Envelope;
use loom_pattern::{metadata, Pattern, RequestInfo};

use crate::app::AppState;
use crate::proxy::filter_response_headers;
use crate::{quota, trace};

pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method;
    let path = parts.uri.path().trim_start_matches('/').to_string();
    let query = parts.uri.query().map(str::to_string);
    let mut headers = parts.headers;

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("body read failed: {e}")).into_response()
        }
    };

    let is_messages_endpoint = method == Method::POST && path.contains("messages");
    let body_json: Option<Value> = if is_messages_endpoint && !body_bytes.is_empty() {
        match serde_json::from_slice(&body_bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "failed to parse request body as JSON");
                None
            }
        }
    } else {
        None
    };

    // Non-destructive metadata peek: the envelope's trace/session/pattern
    // beat absent headers, so the right pattern and span get picked even
    // when the client only speaks through the hook.
    let peeked = body_json.as_ref().and_then(metadata::peek);
    if let Some(env) = &peeked {
        promote_header(&mut headers, "traceparent", env.traceparent.as_deref());
        promote_header(&mut headers, "x-session-id", env.session_id.as_deref());
        promote_header(&mut headers, "x-loom-pattern", env.pattern.as_deref());
        promote_header(&mut headers, "x-loom-client", env.client.as_deref());
    }

    let pattern = state.patterns.get(header_str(&headers, "x-loom-pattern"));
    let session_id = header_str(&headers, "x-session-id")
        .unwrap_or_default()
        .to_string();
    let model = body_json
        .as_ref()
        .and_then(|b| b.get("model"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let span = tracing::info_span!(
        "loom_request",
        %method,
        path = %path,
        pattern = pattern.name(),
        model = %model,
        session = &session_id[..session_id.len().min(8)],
        trace_id = tracing::field::Empty,
    );

    // The outbound hop gets a child trace context; malformed headers are
    // forwarded untouched.
    if let Some(traceparent) = header_str(&headers, "traceparent").map(str::to_string) {
        if let Some(parsed) = trace::parse(&traceparent) {
            span.record("trace_id", parsed.trace_id.as_str());
        }
        if let Some(child) = trace::child_of(&traceparent) {
            if let Ok(value) = HeaderValue::from_str(&child) {
                headers.insert("traceparent", value);
            }
        }
    }

    run_pipeline(
        state,
        pattern,
        method,
        path,
        query,
        headers,
        body_bytes.to_vec(),
        body_json,
        peeked,
        session_id,
        is_messages_endpoint,
    )
    .instrument(span)
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    state: Arc<AppState>,
    pattern: Arc<dyn Pattern>,
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    raw_body: Vec<u8>,
    mut body_json: Option<Value>,
    peeked: Option<Envelope>,
    session_id: String,
    is_messages_endpoint: bool,
) -> Response {
    if is_messages_endpoint {
        let message_count = body_json
            .as_ref()
            .and_then(|b| b.get("messages"))
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        info!(messages = message_count, "processing messages request");

        // Side effect, decoupled from the response: keep the transcript
        // tailer alive for this session.
        if !session_id.is_empty() {
            state.watchers.ensure(&session_id).await;
        }
    }

    // Transform the request through the pattern.
    let outbound_body = match body_json.as_mut() {
        Some(body) => {
            let info = RequestInfo {
                session_id: session_id.clone(),
                machine_name: header_str(&headers, "x-machine-name")
                    .unwrap_or("unknown")
                    .to_string(),
                client_name: header_str(&headers, "x-loom-client").map(str::to_string),
            };
            if let Err(e) = pattern.request(&info, body, peeked).await {
                warn!(error = %e, "pattern transform failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("pattern transform failed: {e}"),
                )
                    .into_response();
            }
            match serde_json::to_vec(body) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to re-encode body");
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("body re-encode failed: {e}"),
                    )
                        .into_response();
                }
            }
        }
        None => raw_body,
    };

    // Forward upstream. Failures proxy straight back; no retries.
    let upstream = match state
        .proxy
        .forward(method, &path, &headers, outbound_body, query.as_deref())
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "upstream forward failed");
            return (StatusCode::BAD_GATEWAY, format!("upstream error: {e}")).into_response();
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let response_headers = filter_response_headers(&upstream_headers);

    // Quota logging is a side effect the client never waits on.
    {
        let kv = state.kv.clone();
        tokio::spawn(async move { quota::log_quota(&kv, &upstream_headers).await });
    }

    let content_type = response_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.contains("text/event-stream") {
        stream_response(upstream, status, response_headers, pattern)
    } else {
        buffered_response(upstream, status, response_headers, pattern).await
    }
}

/// SSE pass-through: chunks flow untouched, and the pattern's response hook
/// fires once the upstream stream closes.
fn stream_response(
    upstream: reqwest::Response,
    status: StatusCode,
    headers: HeaderMap,
    pattern: Arc<dyn Pattern>,
) -> Response {
    let mut byte_stream = upstream.bytes_stream();

    let stream = async_stream::stream! {
        let mut stream_error: Option<reqwest::Error> = None;
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => yield Ok(bytes),
                Err(e) => {
                    stream_error = Some(e);
                    break;
                }
            }
        }

        // The post-stream hook fires however the stream ended.
        if let Err(e) = pattern.response(None).await {
            warn!(error = %e, "pattern response hook failed");
        }
        if let Some(e) = stream_error {
            warn!(error = %e, "upstream stream error");
            yield Err(e);
        }
    };

    // The request span stays open until the stream drains.
    let stream = tracing_futures::Instrument::instrument(stream, tracing::Span::current());

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Non-streaming: hand the parsed body to the pattern's response hook
/// (best-effort), then return it.
async fn buffered_response(
    upstream: reqwest::Response,
    status: StatusCode,
    headers: HeaderMap,
    pattern: Arc<dyn Pattern>,
) -> Response {
    let mut content = match upstream.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            warn!(error = %e, "failed to read upstream body");
            return (StatusCode::BAD_GATEWAY, format!("upstream read error: {e}")).into_response();
        }
    };

    match serde_json::from_slice::<Value>(&content) {
        Ok(mut parsed) => {
            if let Err(e) = pattern.response(Some(&mut parsed)).await {
                warn!(error = %e, "pattern response hook failed");
            }
            if let Ok(bytes) = serde_json::to_vec(&parsed) {
                content = bytes;
            }
        }
        Err(_) => {
            // Not JSON — pass through as-is.
            if let Err(e) = pattern.response(None).await {
                warn!(error = %e, "pattern response hook failed");
            }
        }
    }

    let mut response = Response::new(Body::from(content));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Set a header from envelope metadata only when the client didn't send it.
fn promote_header(headers: &mut HeaderMap, name: &'static str, value: Option<&str>) {
    if headers.contains_key(name) {
        return;
    }
    if let Some(value) = value {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}
