//! The metadata envelope — out-of-band context smuggled inside a user text
//! block by the client-side hook, marked with a canary string.
//!
//! Flow: the hook builds the JSON (session, trace context, surfaced
//! memories), Claude Code appends it to the user message, and the Loom pulls
//! it back out before the request reaches Anthropic.

use serde::Deserialize;

/// One metadata envelope as emitted by the hook.
///
/// Every field is optional on the wire — a partially-filled envelope still
/// identifies the session and is still cleaned from the transcript.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub traceparent: Option<String>,
    #[serde(default)]
    pub sent_at: Option<String>,
    /// The user's actual text (alpha envelopes wrap it; the proxy unwraps it).
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub memories: Vec<Memory>,
}

/// A memory surfaced by the user's prompt, delivered inside the envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub created_at: String,
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub query: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_tolerates_missing_fields() {
        let env: Envelope = serde_json::from_str(r#"{"session_id":"abc"}"#).unwrap();
        assert_eq!(env.session_id.as_deref(), Some("abc"));
        assert!(env.prompt.is_none());
        assert!(env.memories.is_empty());
    }

    #[test]
    fn memory_parses_optional_score() {
        let mem: Memory = serde_json::from_str(
            r#"{"id":42,"created_at":"2026-01-26T15:00:00-08:00","content":"check the pond","score":0.91}"#,
        )
        .unwrap();
        assert_eq!(mem.id, 42);
        assert_eq!(mem.score, Some(0.91));
        assert!(mem.query.is_none());
    }
}
