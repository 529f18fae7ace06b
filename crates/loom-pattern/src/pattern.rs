//! The Pattern contract and the process-wide registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use loom_core::error::Result;
use loom_core::metadata::Envelope;

pub const DEFAULT_PATTERN: &str = "passthrough";

/// Request-scoped context a pattern may care about, pulled off the HTTP
/// headers by the gateway before dispatch.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// `x-session-id` — drives memorables lookup and the token-count stash.
    pub session_id: String,
    /// `x-machine-name` — where the client is running.
    pub machine_name: String,
    /// `x-loom-client` — optional client label (e.g. "duckpond").
    pub client_name: Option<String>,
}

/// A transformation pattern.
///
/// `request` mutates the parsed body in place before it is forwarded; the
/// caller relinquishes ownership of the body until the call returns.
/// `response` runs after the upstream reply: with the parsed body for JSON
/// responses, with `None` once an SSE stream has drained.
#[async_trait]
pub trait Pattern: Send + Sync {
    fn name(&self) -> &'static str;

    async fn request(
        &self,
        info: &RequestInfo,
        body: &mut Value,
        metadata: Option<Envelope>,
    ) -> Result<()>;

    async fn response(&self, _body: Option<&mut Value>) -> Result<()> {
        Ok(())
    }
}

/// Name → pattern mapping. Built once at startup, read-only afterwards.
pub struct PatternRegistry {
    patterns: HashMap<String, Arc<dyn Pattern>>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self {
            patterns: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, pattern: Arc<dyn Pattern>) {
        info!(pattern = name, "registered pattern");
        self.patterns.insert(name.to_string(), pattern);
    }

    /// Look up a pattern by name; unknown names fall back to the default
    /// with a warning. Panics only if the registry was built without a
    /// passthrough, which `loom-gateway` never does.
    pub fn get(&self, name: Option<&str>) -> Arc<dyn Pattern> {
        let requested = name.unwrap_or(DEFAULT_PATTERN);

        if let Some(pattern) = self.patterns.get(requested) {
            debug!(pattern = requested, "pattern selected");
            return Arc::clone(pattern);
        }

        warn!(pattern = requested, "unknown pattern, using default");
        Arc::clone(
            self.patterns
                .get(DEFAULT_PATTERN)
                .expect("default pattern registered at startup"),
        )
    }
}

impl Default for PatternRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passthrough::PassthroughPattern;

    fn registry() -> PatternRegistry {
        let mut reg = PatternRegistry::new();
        reg.register(DEFAULT_PATTERN, Arc::new(PassthroughPattern));
        reg
    }

    #[test]
    fn unknown_name_falls_back_to_default() {
        let reg = registry();
        assert_eq!(reg.get(Some("nope")).name(), "passthrough");
    }

    #[test]
    fn missing_header_selects_default() {
        let reg = registry();
        assert_eq!(reg.get(None).name(), "passthrough");
    }
}
