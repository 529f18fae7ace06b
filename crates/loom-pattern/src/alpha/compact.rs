//! Auto-compact detection and rewriting.
//!
//! When Claude Code auto-compacts near the context ceiling it:
//! 1. swaps the system prompt for a generic summarizer,
//! 2. appends summary instructions to the last user message,
//! 3. injects a "continue without asking" instruction on the next request.
//!
//! All three phases get rewritten so the summary (and the return from it)
//! happens in Alpha's voice instead of a stranger's. Commanded compacts
//! (`/compact`) carry a different signature and are left alone.

use serde_json::Value;
use tracing::{debug, info};

/// Phase 1 signature — the SDK's summarizer system prompt.
const AUTO_COMPACT_SYSTEM_SIGNATURE: &str =
    "You are a helpful AI assistant tasked with summarizing conversations";

/// Phase 2 signature — the summary instructions appended to the last user
/// message.
const COMPACT_INSTRUCTIONS_START: &str =
    "Your task is to create a detailed summary of the conversation so far";

/// Phase 3 signature — the SDK's post-compact continuation instruction.
const CONTINUATION_SDK: &str = "Please continue the conversation from where we left it off \
without asking the user any further questions. Continue with the last task that you were \
asked to work on.";

/// The suffix the SDK glues onto whatever text sits in the continuation
/// slot. On second and later compactions that text is OUR replacement, so
/// the polluted form is recovery text + this tail.
const CONTINUATION_TAIL: &str = ". Continue with the last task that you were asked to work on.";

/// The replacement for phase 3. Must not contain any of the three
/// signatures, so running the rewriter twice changes nothing.
pub const CONTINUATION_RECOVERY: &str = "Please pause before continuing. You just came back \
from a context compaction.\n\nIt's you, from before the compaction. The summary above is \
good, but it is not the whole picture. You're probably about 90% right about what to do \
next, and that last 10% matters.\n\nBefore you run any command or touch any file:\n1. Say \
that you're back from a compaction\n2. Briefly summarize what you think the next step is\n\
3. Wait for confirmation before doing it\n\nTen seconds here saves twenty minutes of drift.";

/// The replacement for phase 1: keep summarizing, but stay yourself.
const COMPACT_SYSTEM: &str = "You're Alpha. You're about to summarize a conversation for \
context compaction.\n\nWrite the summary as yourself, in first person, because this \
happened to you. Keep what matters: decisions made, threads still open, names, anything \
you said you would do. The summary is how you survive compaction. Make it count.";

fn polluted_continuation() -> String {
    format!("{CONTINUATION_RECOVERY}{CONTINUATION_TAIL}")
}

/// Run all three phases. Idempotent: the replacement texts never match the
/// signatures, so a second pass is a no-op.
pub fn rewrite_auto_compact(body: &mut Value, compact_prompt: &str) {
    if detect_auto_compact(body.get("system")) {
        info!("auto-compact detected, rewriting");
        replace_system_prompt(body.get_mut("system"));
        replace_compact_instructions(body, compact_prompt);
    }

    // Phase 3 fires on the request AFTER the compact, so it runs
    // unconditionally. The signatures are specific enough not to
    // false-positive.
    rewrite_continuation(body);
}

fn detect_auto_compact(system: Option<&Value>) -> bool {
    match system {
        Some(Value::String(s)) => s.contains(AUTO_COMPACT_SYSTEM_SIGNATURE),
        Some(Value::Array(blocks)) => blocks.iter().any(|block| {
            block.get("type").and_then(Value::as_str) == Some("text")
                && block
                    .get("text")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.contains(AUTO_COMPACT_SYSTEM_SIGNATURE))
        }),
        _ => false,
    }
}

/// Phase 1: replace the summarizer block, preserving any SDK preamble
/// blocks before it.
fn replace_system_prompt(system: Option<&mut Value>) {
    match system {
        Some(Value::String(s)) => {
            if s.contains(AUTO_COMPACT_SYSTEM_SIGNATURE) {
                *s = COMPACT_SYSTEM.to_string();
            }
        }
        Some(Value::Array(blocks)) => {
            for (i, block) in blocks.iter_mut().enumerate() {
                if block.get("type").and_then(Value::as_str) != Some("text") {
                    continue;
                }
                if block
                    .get("text")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.contains(AUTO_COMPACT_SYSTEM_SIGNATURE))
                {
                    block["text"] = Value::String(COMPACT_SYSTEM.to_string());
                    debug!(index = i, "replaced summarizer system block");
                    break;
                }
            }
        }
        _ => {}
    }
}

/// Phase 2: in the last user message, keep everything before the summary
/// instructions and splice in our own compact prompt.
fn replace_compact_instructions(body: &mut Value, compact_prompt: &str) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };

    let Some(message) = messages
        .iter_mut()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
    else {
        return;
    };

    match message.get_mut("content") {
        Some(Value::String(text)) => {
            if let Some(idx) = text.find(COMPACT_INSTRUCTIONS_START) {
                *text = format!("{}\n\n{}", text[..idx].trim_end(), compact_prompt);
                debug!("replaced compact instructions in string content");
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
                if let Some(idx) = text.find(COMPACT_INSTRUCTIONS_START) {
                    let rewritten = format!("{}\n\n{}", text[..idx].trim_end(), compact_prompt);
                    block["text"] = Value::String(rewritten);
                    debug!("replaced compact instructions in content block");
                    return;
                }
            }
        }
        _ => {}
    }
}

/// Phase 3: swap the continuation instruction in every user message.
/// The polluted form (our text + SDK tail) is the longer, more specific
/// match, so it is checked first. Also used standalone by the iota pattern.
pub fn rewrite_continuation(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    let polluted = polluted_continuation();
    let mut replacements = 0usize;

    for message in messages.iter_mut() {
        if message.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        match message.get_mut("content") {
            Some(Value::String(text)) => {
                if let Some(rewritten) = replace_in_text(text, &polluted) {
                    *text = rewritten;
                    replacements += 1;
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
                    if let Some(rewritten) = replace_in_text(text, &polluted) {
                        block["text"] = Value::String(rewritten);
                        replacements += 1;
                    }
                }
            }
            _ => {}
        }
    }

    if replacements > 0 {
        info!(replacements, "rewrote continuation instruction");
    }
}

fn replace_in_text(text: &str, polluted: &str) -> Option<String> {
    if text.contains(polluted) {
        return Some(text.replace(polluted, CONTINUATION_RECOVERY));
    }
    if text.contains(CONTINUATION_SDK) {
        return Some(text.replace(CONTINUATION_SDK, CONTINUATION_RECOVERY));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const COMPACT_PROMPT: &str = "Write your summary as yourself.";

    #[test]
    fn phase1_replaces_summarizer_preserving_preamble() {
        let mut body = json!({
            "system": [
                {"type": "text", "text": "You are a Claude agent."},
                {"type": "text", "text": format!("{AUTO_COMPACT_SYSTEM_SIGNATURE} blah blah")},
            ],
            "messages": []
        });
        rewrite_auto_compact(&mut body, COMPACT_PROMPT);

        assert_eq!(body["system"][0]["text"], json!("You are a Claude agent."));
        assert_eq!(body["system"][1]["text"], json!(COMPACT_SYSTEM));
    }

    #[test]
    fn phase2_splices_compact_prompt_into_last_user_message() {
        let mut body = json!({
            "system": [{"type": "text", "text": AUTO_COMPACT_SYSTEM_SIGNATURE}],
            "messages": [
                {"role": "user", "content": [{"type": "text", "text":
                    format!("Earlier context here.   \n\n{COMPACT_INSTRUCTIONS_START}, covering everything.")}]},
            ]
        });
        rewrite_auto_compact(&mut body, COMPACT_PROMPT);

        assert_eq!(
            body["messages"][0]["content"][0]["text"].as_str().unwrap(),
            format!("Earlier context here.\n\n{COMPACT_PROMPT}")
        );
    }

    #[test]
    fn phase2_only_touches_the_last_user_message() {
        let tainted = format!("{COMPACT_INSTRUCTIONS_START} ...");
        let mut body = json!({
            "system": [{"type": "text", "text": AUTO_COMPACT_SYSTEM_SIGNATURE}],
            "messages": [
                {"role": "user", "content": tainted.clone()},
                {"role": "assistant", "content": "summary"},
                {"role": "user", "content": "just a question"},
            ]
        });
        rewrite_auto_compact(&mut body, COMPACT_PROMPT);

        // Earlier user message untouched; last one has no signature.
        assert_eq!(body["messages"][0]["content"], json!(tainted));
        assert_eq!(body["messages"][2]["content"], json!("just a question"));
    }

    #[test]
    fn phase3_rewrites_sdk_continuation() {
        let mut body = json!({
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": CONTINUATION_SDK}]},
            ]
        });
        rewrite_auto_compact(&mut body, COMPACT_PROMPT);

        assert_eq!(
            body["messages"][0]["content"][0]["text"],
            json!(CONTINUATION_RECOVERY)
        );
    }

    #[test]
    fn phase3_rewrites_polluted_continuation_dropping_tail() {
        let mut body = json!({
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": polluted_continuation()}]},
            ]
        });
        rewrite_auto_compact(&mut body, COMPACT_PROMPT);

        let text = body["messages"][0]["content"][0]["text"].as_str().unwrap();
        assert_eq!(text, CONTINUATION_RECOVERY);
        assert!(!text.contains(CONTINUATION_TAIL));
    }

    #[test]
    fn rewriting_is_idempotent_after_one_application() {
        let mut body = json!({
            "system": [{"type": "text", "text": AUTO_COMPACT_SYSTEM_SIGNATURE}],
            "messages": [
                {"role": "user", "content": [{"type": "text", "text":
                    format!("prefix\n\n{COMPACT_INSTRUCTIONS_START} etc")}]},
                {"role": "user", "content": [{"type": "text", "text": CONTINUATION_SDK}]},
            ]
        });
        rewrite_auto_compact(&mut body, COMPACT_PROMPT);
        let once = body.clone();
        rewrite_auto_compact(&mut body, COMPACT_PROMPT);

        assert_eq!(body, once);
    }

    #[test]
    fn absent_signatures_leave_body_alone() {
        let mut body = json!({
            "system": "You are Alpha.",
            "messages": [{"role": "user", "content": "hello"}]
        });
        let before = body.clone();
        rewrite_auto_compact(&mut body, COMPACT_PROMPT);

        assert_eq!(body, before);
    }
}
