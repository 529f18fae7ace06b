//! Postgres summary store — the two most recent conversation-period
//! summaries from `cortex.summaries`.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;

use crate::types::Summary;

pub struct SummaryStore {
    pool: Option<PgPool>,
}

impl SummaryStore {
    /// Build a lazy pool — no connection is attempted until the first query,
    /// so a down database only degrades requests, never startup.
    /// An empty URL disables summaries entirely.
    pub fn connect(url: &str) -> Self {
        if url.is_empty() {
            return Self { pool: None };
        }

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy(url)
            .map_err(|e| warn!(error = %e, "bad DATABASE_URL, summaries disabled"))
            .ok();

        Self { pool }
    }

    /// The two most recent summaries, ordered oldest-first.
    /// Zero, one, or two entries; never raises.
    pub async fn fetch_recent(&self) -> Vec<Summary> {
        let Some(ref pool) = self.pool else {
            return Vec::new();
        };

        let rows = sqlx::query_as::<_, Summary>(
            "SELECT period_start, period_end, summary
             FROM cortex.summaries
             ORDER BY period_start DESC
             LIMIT 2",
        )
        .fetch_all(pool)
        .await;

        match rows {
            Ok(mut rows) => {
                // DESC from the query; callers want oldest-first.
                rows.reverse();
                rows
            }
            Err(e) => {
                warn!(error = %e, "summary fetch failed");
                Vec::new()
            }
        }
    }
}
