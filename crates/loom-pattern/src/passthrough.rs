//! Transparent pass-through. Claude, unmodified.

use async_trait::async_trait;
use serde_json::Value;

use loom_core::error::Result;
use loom_core::metadata::Envelope;

use crate::pattern::{Pattern, RequestInfo};

/// The simplest possible pattern: no memory, no system prompt, no identity.
/// Selected by default and whenever a requested pattern doesn't exist.
pub struct PassthroughPattern;

#[async_trait]
impl Pattern for PassthroughPattern {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    async fn request(
        &self,
        _info: &RequestInfo,
        _body: &mut Value,
        _metadata: Option<Envelope>,
    ) -> Result<()> {
        Ok(())
    }
}
