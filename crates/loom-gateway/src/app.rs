use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use loom_core::config::LoomConfig;
use loom_core::error::Result;
use loom_pattern::alpha::AlphaPattern;
use loom_pattern::iota::IotaPattern;
use loom_pattern::passthrough::PassthroughPattern;
use loom_pattern::soul::Soul;
use loom_pattern::PatternRegistry;
use loom_store::db::SummaryStore;
use loom_store::kv::KvStore;

use crate::proxy::UpstreamClient;
use crate::watcher::WatcherRegistry;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: LoomConfig,
    pub patterns: PatternRegistry,
    pub kv: KvStore,
    pub proxy: UpstreamClient,
    pub watchers: Arc<WatcherRegistry>,
}

impl AppState {
    /// Wire everything up. Fails only on a missing identity doc or an
    /// unparseable upstream/redis URL — the stores themselves connect
    /// lazily and degrade per request.
    pub async fn init(config: LoomConfig) -> Result<Self> {
        let soul = Arc::new(Soul::load(&config.soul).await?);
        let kv = KvStore::new(&config.redis.url)?;
        let summaries = Arc::new(SummaryStore::connect(&config.database.url));
        let proxy = UpstreamClient::new(&config.upstream.url)?;
        let watchers = Arc::new(WatcherRegistry::new(kv.clone(), &config.watcher));

        let mut patterns = PatternRegistry::new();
        patterns.register("passthrough", Arc::new(PassthroughPattern));
        patterns.register("iota", Arc::new(IotaPattern::new(&config)));
        patterns.register(
            "alpha",
            Arc::new(AlphaPattern::new(
                soul,
                kv.clone(),
                summaries,
                &config,
            )),
        );

        Ok(Self {
            config,
            patterns,
            kv,
            proxy,
            watchers,
        })
    }
}

/// Assemble the Axum router: one health probe, everything else proxied.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(crate::handler::proxy_handler)
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// GET /health — liveness probe.
async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok", "service": "loom"}))
}
