//! Metadata envelope detection, extraction, and cleanup.
//!
//! Two canary families coexist:
//!
//! - **Alpha**: the envelope IS the entire text of a user text block. The
//!   top-level JSON object carries the canary and the user's real `prompt`,
//!   which replaces the block (with surfaced memories appended).
//! - **Deliverator**: the legacy hook wraps the envelope in additional
//!   context. The JSON is located by brace-matching around the canary, and
//!   the block collapses to a `[Sent <ts>]` stamp.
//!
//! Every user message is scanned, every validated envelope is cleaned from
//! the transcript, and the metadata of the last match is kept (alpha wins
//! over deliverator when both families appear).

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use loom_core::metadata::{Envelope, Memory};
use loom_store::types::HOUSE_TZ;

pub const ALPHA_CANARY: &str = "ALPHA_METADATA_UlVCQkVSRFVDSw";
pub const DELIVERATOR_CANARY: &str = "DELIVERATOR_METADATA_UlVCQkVSRFVDSw";

/// Anti-spoof: a pasted diff that happens to contain the deliverator canary
/// must not be treated as metadata. The real block always carries this
/// prefix from the hook machinery.
const DELIVERATOR_PREFIX: &str = "UserPromptSubmit hook additional context:";

#[derive(Debug, Default)]
pub struct ExtractReport {
    pub envelope: Option<Envelope>,
    /// How many envelope blocks were cleaned from the transcript.
    pub transformed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Family {
    Alpha,
    Deliverator,
}

/// Destructively extract metadata from the request body.
///
/// All user messages are scanned; each validated envelope is replaced by its
/// user-visible form (prompt + memories, or a sent-at stamp) or removed
/// outright when nothing remains. Running again on a cleaned body is a
/// no-op that returns no envelope.
pub fn extract(body: &mut Value) -> ExtractReport {
    extract_at(body, Utc::now().with_timezone(&HOUSE_TZ))
}

fn extract_at(body: &mut Value, now: DateTime<chrono_tz::Tz>) -> ExtractReport {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return ExtractReport::default();
    };

    let mut last_alpha: Option<Envelope> = None;
    let mut last_deliverator: Option<Envelope> = None;
    let mut transformed = 0usize;

    let mut msg_idx = 0;
    while msg_idx < messages.len() {
        let remove_message = {
            let msg = &mut messages[msg_idx];
            if msg.get("role").and_then(Value::as_str) != Some("user") {
                msg_idx += 1;
                continue;
            }

            match msg.get_mut("content") {
                Some(Value::String(text)) => {
                    if let Some((family, envelope, replacement)) = match_envelope(text, now) {
                        transformed += 1;
                        keep_last(family, envelope, &mut last_alpha, &mut last_deliverator);
                        match usable(replacement) {
                            Some(r) => {
                                *text = r;
                                false
                            }
                            None => true,
                        }
                    } else {
                        false
                    }
                }
                Some(Value::Array(blocks)) => {
                    let mut cleaned_here = false;
                    let mut block_idx = 0;
                    while block_idx < blocks.len() {
                        let matched = blocks[block_idx]
                            .get("type")
                            .and_then(Value::as_str)
                            .filter(|t| *t == "text")
                            .and_then(|_| blocks[block_idx].get("text"))
                            .and_then(Value::as_str)
                            .and_then(|text| match_envelope(text, now));

                        match matched {
                            Some((family, envelope, replacement)) => {
                                transformed += 1;
                                cleaned_here = true;
                                keep_last(family, envelope, &mut last_alpha, &mut last_deliverator);
                                match usable(replacement) {
                                    Some(r) => {
                                        blocks[block_idx]["text"] = Value::String(r);
                                        block_idx += 1;
                                    }
                                    None => {
                                        blocks.remove(block_idx);
                                    }
                                }
                            }
                            None => block_idx += 1,
                        }
                    }
                    // Only a message WE emptied gets dropped.
                    cleaned_here && blocks.is_empty()
                }
                _ => false,
            }
        };

        if remove_message {
            debug!(message = msg_idx, "removed emptied metadata message");
            messages.remove(msg_idx);
        } else {
            msg_idx += 1;
        }
    }

    let envelope = last_alpha.or(last_deliverator);
    if let Some(ref env) = envelope {
        debug!(
            session = env.session_id.as_deref().unwrap_or("none"),
            memories = env.memories.len(),
            transformed,
            "extracted metadata"
        );
    }

    ExtractReport {
        envelope,
        transformed,
    }
}

/// Non-destructive scan — same detection rules as [`extract`], no mutation.
/// The gateway uses this to promote traceparent / session / pattern to
/// headers before the pattern runs.
pub fn peek(body: &Value) -> Option<Envelope> {
    let messages = body.get("messages")?.as_array()?;
    let now = Utc::now().with_timezone(&HOUSE_TZ);

    let mut last_alpha: Option<Envelope> = None;
    let mut last_deliverator: Option<Envelope> = None;

    for msg in messages {
        if msg.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        match msg.get("content") {
            Some(Value::String(text)) => {
                if let Some((family, envelope, _)) = match_envelope(text, now) {
                    keep_last(family, envelope, &mut last_alpha, &mut last_deliverator);
                }
            }
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) != Some("text") {
                        continue;
                    }
                    let Some(text) = block.get("text").and_then(Value::as_str) else {
                        continue;
                    };
                    if let Some((family, envelope, _)) = match_envelope(text, now) {
                        keep_last(family, envelope, &mut last_alpha, &mut last_deliverator);
                    }
                }
            }
            _ => {}
        }
    }

    last_alpha.or(last_deliverator)
}

fn keep_last(
    family: Family,
    envelope: Envelope,
    last_alpha: &mut Option<Envelope>,
    last_deliverator: &mut Option<Envelope>,
) {
    match family {
        Family::Alpha => *last_alpha = Some(envelope),
        Family::Deliverator => *last_deliverator = Some(envelope),
    }
}

/// An empty replacement means the block has nothing left to say — drop it
/// (the upstream rejects empty text blocks anyway).
fn usable(replacement: Option<String>) -> Option<String> {
    replacement.filter(|r| !r.trim().is_empty())
}

fn match_envelope(
    text: &str,
    now: DateTime<chrono_tz::Tz>,
) -> Option<(Family, Envelope, Option<String>)> {
    if let Some(envelope) = detect_alpha(text) {
        let replacement = alpha_replacement(&envelope, now);
        return Some((Family::Alpha, envelope, Some(replacement)));
    }
    if let Some(envelope) = detect_deliverator(text) {
        let replacement = envelope.sent_at.as_ref().map(|ts| format!("[Sent {ts}]"));
        return Some((Family::Deliverator, envelope, replacement));
    }
    None
}

/// Alpha family: the envelope must BE the block text, not merely appear in
/// it. Six defenses, all required:
/// text trims to a `{..}` span, parses as JSON, carries a top-level
/// `canary` that exact-matches ours, and has a `prompt` key. (Role and
/// block-type are enforced by the caller's iteration.)
fn detect_alpha(text: &str) -> Option<Envelope> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object()?;
    if obj.get("canary").and_then(Value::as_str) != Some(ALPHA_CANARY) {
        return None;
    }
    if !obj.contains_key("prompt") {
        return None;
    }
    serde_json::from_value(value)
        .map_err(|e| warn!(error = %e, "alpha envelope failed to deserialize"))
        .ok()
}

/// Deliverator family: canary anywhere in the text, but only when the
/// hook's additional-context prefix is also present.
fn detect_deliverator(text: &str) -> Option<Envelope> {
    let canary_pos = text.find(DELIVERATOR_CANARY)?;
    if !text.contains(DELIVERATOR_PREFIX) {
        return None;
    }
    let json = enclosing_object(text, canary_pos)?;
    serde_json::from_str(json)
        .map_err(|e| warn!(error = %e, "deliverator envelope failed to parse"))
        .ok()
}

/// The smallest `{..}` pair enclosing the canary: scan back to the nearest
/// opening brace, then forward to its balanced close.
fn enclosing_object(text: &str, canary_pos: usize) -> Option<&str> {
    let start = text[..canary_pos].rfind('{')?;
    let mut depth = 0i32;
    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// The user-visible form of an alpha envelope: the prompt, then each memory
/// as its own paragraph.
fn alpha_replacement(envelope: &Envelope, now: DateTime<chrono_tz::Tz>) -> String {
    let mut out = envelope.prompt.clone().unwrap_or_default();
    for memory in &envelope.memories {
        out.push_str("\n\n");
        out.push_str(&format_memory(memory, now));
    }
    out
}

fn format_memory(memory: &Memory, now: DateTime<chrono_tz::Tz>) -> String {
    let when = relative_time(&memory.created_at, now);
    let score = memory
        .score
        .map(|s| format!(", score {s:.2}"))
        .unwrap_or_default();
    format!(
        "Memory #{} ({}{}):\n{}",
        memory.id,
        when,
        score,
        memory.content.trim()
    )
}

/// Human-friendly relative stamp in the house timezone.
///
/// today at 3:00 PM / yesterday at 10:30 AM / 4 days ago / 2 weeks ago /
/// Mon Dec 15 2025. Unparseable timestamps fall back to the raw string.
pub fn relative_time(created_at: &str, now: DateTime<chrono_tz::Tz>) -> String {
    let Ok(parsed) = DateTime::parse_from_rfc3339(created_at) else {
        warn!(created_at, "unparseable memory timestamp");
        return created_at.to_string();
    };
    let local = parsed.with_timezone(&HOUSE_TZ);
    let days = now
        .date_naive()
        .signed_duration_since(local.date_naive())
        .num_days();

    match days {
        0 => format!("today at {}", local.format("%-I:%M %p")),
        1 => format!("yesterday at {}", local.format("%-I:%M %p")),
        2..=6 => format!("{days} days ago"),
        7..=29 => {
            let weeks = days / 7;
            format!("{} week{} ago", weeks, if weeks > 1 { "s" } else { "" })
        }
        _ => local.format("%a %b %-d %Y").to_string(),
    }
}
