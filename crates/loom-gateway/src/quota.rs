//! Quota tracking — Anthropic rate-limit headers snapshotted to Redis with
//! automatic expiry, compatible with the Eavesdrop dashboard.

use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use loom_store::kv::KvStore;

const TTL_DAYS: u64 = 14;
const TTL_SECONDS: u64 = TTL_DAYS * 24 * 60 * 60;

/// The headers worth keeping when they show up.
const QUOTA_HEADERS: [&str; 9] = [
    "anthropic-ratelimit-unified-5h-utilization",
    "anthropic-ratelimit-unified-5h-reset",
    "anthropic-ratelimit-unified-5h-status",
    "anthropic-ratelimit-unified-7d-utilization",
    "anthropic-ratelimit-unified-7d-reset",
    "anthropic-ratelimit-unified-7d-status",
    "anthropic-ratelimit-unified-fallback",
    "anthropic-ratelimit-unified-fallback-percentage",
    "anthropic-ratelimit-unified-overage-status",
];

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Snapshot rate-limit headers to `quota:<ISO-8601-utc>` (TTL 14 days).
/// No-op when the response carries no utilization headers.
pub async fn log_quota(kv: &KvStore, headers: &HeaderMap) {
    let util_5h = header_str(headers, "anthropic-ratelimit-unified-5h-utilization");
    let util_7d = header_str(headers, "anthropic-ratelimit-unified-7d-utilization");
    if util_5h.is_none() && util_7d.is_none() {
        return;
    }

    let timestamp = Utc::now().to_rfc3339();
    let request_id = header_str(headers, "request-id").unwrap_or("");

    let mut data = json!({
        "timestamp": timestamp,
        "request_id": request_id,
    });
    for name in QUOTA_HEADERS {
        data[name] = json!(header_str(headers, name).unwrap_or(""));
    }

    // quota:<timestamp> sorts naturally by time
    let key = format!("quota:{timestamp}");
    if let Err(e) = kv.set_with_ttl(&key, &data.to_string(), TTL_SECONDS).await {
        warn!(error = %e, "failed to log quota");
        return;
    }

    let pct = |v: Option<&str>| v.and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0) * 100.0;
    info!(
        "Quota: 5h={:.1}%, 7d={:.1}%",
        pct(util_5h),
        pct(util_7d)
    );
}
