//! Token counting for context-window awareness.
//!
//! Posts the prepared request to Anthropic's count_tokens endpoint (free,
//! rate-limited) and stashes the result in Redis for Duckpond to display.
//! Fire-and-forget: spawned off the request path, never raises.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use loom_core::config::AnthropicConfig;
use loom_store::kv::KvStore;

const API_VERSION: &str = "2023-06-01";
const COUNT_TIMEOUT: Duration = Duration::from_secs(10);
/// Stale sessions shouldn't keep showing a count.
const STASH_TTL_SECS: u64 = 3600;

/// Count tokens for `body` and stash `{input_tokens}` at
/// `duckpond:context:<session_id>`. Designed for `tokio::spawn`.
pub async fn count_and_stash(
    client: reqwest::Client,
    config: AnthropicConfig,
    kv: KvStore,
    body: Value,
    session_id: String,
) {
    if config.api_key.is_empty() {
        warn!("ANTHROPIC_API_KEY not set, skipping token count");
        return;
    }
    if session_id.is_empty() {
        debug!("no session id, skipping token count");
        return;
    }

    // count_tokens takes the same shape as /v1/messages but only needs
    // model, messages, and optionally system and tools.
    let mut count_body = json!({
        "model": body.get("model").cloned().unwrap_or_else(|| json!("claude-sonnet-4-5")),
        "messages": body.get("messages").cloned().unwrap_or_else(|| json!([])),
    });
    if let Some(system) = body.get("system") {
        count_body["system"] = system.clone();
    }
    if let Some(tools) = body.get("tools") {
        count_body["tools"] = tools.clone();
    }

    let response = client
        .post(&config.count_url)
        .timeout(COUNT_TIMEOUT)
        .header("x-api-key", &config.api_key)
        .header("anthropic-version", API_VERSION)
        .header("content-type", "application/json")
        .json(&count_body)
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "token count request failed");
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        warn!(status, body = %text.chars().take(200).collect::<String>(), "token count API error");
        return;
    }

    let data: Value = match response.json().await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "token count response unparseable");
            return;
        }
    };

    let Some(input_tokens) = data.get("input_tokens").and_then(Value::as_i64) else {
        warn!("no input_tokens in count response");
        return;
    };

    let key = format!("duckpond:context:{session_id}");
    let payload = json!({ "input_tokens": input_tokens }).to_string();
    match kv.set_with_ttl(&key, &payload, STASH_TTL_SECS).await {
        Ok(()) => {
            info!(
                input_tokens,
                session = &session_id[..session_id.len().min(8)],
                "token count stashed"
            );
        }
        Err(e) => warn!(error = %e, "failed to stash token count"),
    }
}
