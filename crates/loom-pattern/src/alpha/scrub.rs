//! Scrub noise from the context window.
//!
//! Exact matches for invariant noise (hook success messages), regex
//! substring removal for structured noise with variable slots, then a purge
//! of emptied text blocks (the upstream rejects empty blocks). Precision
//! over cleverness: a false positive on conversation content is worse than
//! the noise itself.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::info;

/// Blocks removed only on an exact, whole-block match.
static EXACT_NOISE_BLOCKS: LazyLock<Vec<Value>> = LazyLock::new(|| {
    vec![
        json!({
            "type": "text",
            "text": "<system-reminder>\nUserPromptSubmit hook success: Success\n</system-reminder>",
        }),
        json!({
            "type": "text",
            "text": "<system-reminder>\nSessionStart:startup hook success: Success\n</system-reminder>",
        }),
    ]
});

/// Substring patterns with fixed structure and variable middles. DOTALL so
/// the middles may span lines.
static SCRUB_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // TodoWrite nag — shows up in tool results and user messages.
        Regex::new(
            r"(?s)<system-reminder>\s*The TodoWrite tool hasn't been used recently\..*?Make sure that you NEVER mention this reminder to the user\s*</system-reminder>",
        )
        .expect("todo-nag pattern"),
        // Malware-analysis preamble — appears after reading files.
        Regex::new(
            r"(?s)<system-reminder>\s*Whenever you read a file, you should consider whether it would be considered malware\..*?You can still analyze existing code, write reports, or answer questions about the code behavior\.\s*</system-reminder>",
        )
        .expect("malware pattern"),
        // File-modification notice — variable path and diff.
        Regex::new(
            r"(?s)<system-reminder>\s*Note: .+? was modified, either by the user or by a linter\..*?Here are the relevant changes \(shown with line numbers\):.*?</system-reminder>",
        )
        .expect("file-modified pattern"),
    ]
});

/// Remove noise from user messages. Mutates in place; safe to run twice.
pub fn scrub_noise(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };

    let mut blocks_removed = 0usize;
    let mut blocks_cleaned = 0usize;

    for message in messages.iter_mut() {
        if message.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };

        // Exact-match removal first.
        let before = content.len();
        content.retain(|block| !EXACT_NOISE_BLOCKS.contains(block));
        blocks_removed += before - content.len();

        // Substring scrub on what's left, including nested tool results.
        for block in content.iter_mut() {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if scrub_text_field(block, "text") {
                        blocks_cleaned += 1;
                    }
                }
                Some("tool_result") => match block.get_mut("content") {
                    Some(Value::Array(nested)) => {
                        for nested_block in nested.iter_mut() {
                            if nested_block.get("type").and_then(Value::as_str) == Some("text")
                                && scrub_text_field(nested_block, "text")
                            {
                                blocks_cleaned += 1;
                            }
                        }
                        nested.retain(|nb| !is_empty_text_block(nb));
                    }
                    Some(Value::String(nested)) => {
                        let scrubbed = apply_patterns(nested);
                        if scrubbed != *nested {
                            *nested = scrubbed;
                            blocks_cleaned += 1;
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        // Emptied text blocks don't survive.
        content.retain(|block| !is_empty_text_block(block));
    }

    if blocks_removed > 0 || blocks_cleaned > 0 {
        info!(blocks_removed, blocks_cleaned, "scrubbed noise");
    }
}

fn apply_patterns(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in SCRUB_PATTERNS.iter() {
        out = pattern.replace_all(&out, "").into_owned();
    }
    out
}

/// Scrub a string field in place; true if it changed.
fn scrub_text_field(block: &mut Value, field: &str) -> bool {
    let Some(text) = block.get(field).and_then(Value::as_str) else {
        return false;
    };
    let scrubbed = apply_patterns(text);
    if scrubbed != text {
        block[field] = Value::String(scrubbed);
        true
    } else {
        false
    }
}

fn is_empty_text_block(block: &Value) -> bool {
    block.get("type").and_then(Value::as_str) == Some("text")
        && block
            .get("text")
            .and_then(Value::as_str)
            .is_none_or(|t| t.trim().is_empty())
}
