//! Redis client — HUD data, memorables, stashes, and pub/sub.
//!
//! The connection is established lazily: a Redis that is down at startup
//! only degrades reads to `None`/empty until it comes back. Every read
//! swallows its errors; writes return `Result` but callers log-and-continue.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use loom_core::error::{LoomError, Result};

use crate::types::HudData;

/// Shared Redis handle. `ConnectionManager` multiplexes and reconnects, so
/// clones are cheap and safe to spread across tasks.
#[derive(Clone)]
pub struct KvStore {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
}

impl KvStore {
    /// Parse the URL and build the handle. No connection is attempted here.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| LoomError::Store(e.to_string()))?;
        Ok(Self {
            client,
            conn: Arc::new(OnceCell::new()),
        })
    }

    /// The shared connection manager, established on first use. A failed
    /// attempt is retried on the next call.
    async fn manager(&self) -> Option<ConnectionManager> {
        self.conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|e| debug!(error = %e, "redis unavailable"))
            .ok()
            .cloned()
    }

    /// GET a key, swallowing every failure into `None`.
    async fn get_opt(&self, key: &str) -> Option<String> {
        let mut conn = self.manager().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(v) => v,
            Err(e) => {
                debug!(key, error = %e, "kv get failed");
                None
            }
        }
    }

    /// Fetch the HUD in one parallel sweep. Never raises; a dead Redis
    /// yields an all-null HUD.
    pub async fn fetch_hud(&self) -> HudData {
        let (weather, calendar, todos, to_self, to_self_time, today_so_far, today_so_far_time) = tokio::join!(
            self.get_opt("hud:weather"),
            self.get_opt("hud:calendar"),
            self.get_opt("hud:todos"),
            self.get_opt("systemprompt:past:to_self"),
            self.get_opt("systemprompt:past:to_self:time"),
            self.get_opt("systemprompt:past:today"),
            self.get_opt("systemprompt:past:today:time"),
        );

        HudData {
            weather,
            calendar,
            todos,
            to_self,
            to_self_time,
            today_so_far,
            today_so_far_time,
        }
    }

    /// Current memorables for a session, oldest first.
    /// Empty session id, absent key, or any error → empty list.
    pub async fn memorables(&self, session_id: &str) -> Vec<String> {
        if session_id.is_empty() {
            return Vec::new();
        }
        let Some(mut conn) = self.manager().await else {
            return Vec::new();
        };

        let key = format!("intro:memorables:{session_id}");
        match conn.lrange::<_, Vec<String>>(&key, 0, -1).await {
            Ok(items) => {
                if !items.is_empty() {
                    debug!(
                        session = &session_id[..session_id.len().min(8)],
                        count = items.len(),
                        "found memorables"
                    );
                }
                items
            }
            Err(e) => {
                warn!(error = %e, "error reading memorables");
                Vec::new()
            }
        }
    }

    /// SET with expiry — used for the token-count stash and quota snapshots.
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let Some(mut conn) = self.manager().await else {
            return Err(LoomError::Store("redis unavailable".to_string()));
        };
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(|e| LoomError::Store(e.to_string()))
    }

    /// PUBLISH a payload — used by the transcript watcher.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let Some(mut conn) = self.manager().await else {
            return Err(LoomError::Store("redis unavailable".to_string()));
        };
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| LoomError::Store(e.to_string()))
    }
}
