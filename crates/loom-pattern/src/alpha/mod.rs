//! The Alpha pattern — where Claude becomes Alpha.
//!
//! Assembles the full system prompt from the soul doc (git, cached at
//! startup), period summaries (Postgres), the HUD (Redis), and context
//! files on disk, then weaves memorables into the tail of the conversation.
//! The threads already exist; the Loom just weaves them.

pub mod compact;
pub mod context;
pub mod scrub;
pub mod token_count;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use loom_core::config::{AnthropicConfig, LoomConfig};
use loom_core::error::Result;
use loom_core::metadata::Envelope;
use loom_store::db::SummaryStore;
use loom_store::kv::KvStore;
use loom_store::types::{HudData, Summary, HOUSE_TZ};

use crate::metadata;
use crate::pattern::{Pattern, RequestInfo};
use crate::soul::Soul;

const CONTEXT_FILE_NAME: &str = "ALPHA.md";

pub struct AlphaPattern {
    soul: Arc<Soul>,
    kv: KvStore,
    summaries: Arc<SummaryStore>,
    http: reqwest::Client,
    anthropic: AnthropicConfig,
    context_root: PathBuf,
    cache_control: bool,
    snapshot_dir: Option<PathBuf>,
}

impl AlphaPattern {
    pub fn new(
        soul: Arc<Soul>,
        kv: KvStore,
        summaries: Arc<SummaryStore>,
        config: &LoomConfig,
    ) -> Self {
        Self {
            soul,
            kv,
            summaries,
            http: reqwest::Client::new(),
            anthropic: config.anthropic.clone(),
            context_root: PathBuf::from(&config.pattern.context_root),
            cache_control: config.pattern.cache_control,
            snapshot_dir: config.pattern.snapshot_dir.as_ref().map(PathBuf::from),
        }
    }

    /// Build the ordered system blocks. Pure assembly — all I/O has already
    /// happened by the time this runs.
    fn build_system_blocks(
        &self,
        info: &RequestInfo,
        hud: &HudData,
        summaries: &[Summary],
        context_blocks: &[context::ContextBlock],
        hints: &[String],
        now: DateTime<chrono_tz::Tz>,
    ) -> Vec<Value> {
        let mut texts: Vec<String> = Vec::new();

        texts.push(self.soul.identity_block());

        // Oldest first: the older summary reads before the newer one.
        for summary in summaries {
            texts.push(summary.render());
        }

        if let Some(to_self) = &hud.to_self {
            let time = hud
                .to_self_time
                .as_ref()
                .map(|t| format!(" ({t})"))
                .unwrap_or_default();
            texts.push(format!("## Letter from last night{time}\n\n{to_self}"));
        }

        if let Some(today) = &hud.today_so_far {
            let date = now.format("%A, %B %-d, %Y");
            let time = hud
                .today_so_far_time
                .clone()
                .unwrap_or_else(|| now.format("%-I:%M %p").to_string());
            texts.push(format!("## Today so far ({date}, {time})\n\n{today}"));
        }

        texts.push(here_block(info, hud));

        for block in context_blocks {
            texts.push(format!("# Context: {}\n\n{}", block.path, block.content));
        }
        if !hints.is_empty() {
            texts.push(format!("# Context available\n\n{}", hints.join("\n")));
        }

        if let Some(calendar) = &hud.calendar {
            texts.push(format!("# Events\n\n{calendar}"));
        }
        if let Some(todos) = &hud.todos {
            texts.push(format!("# Todos\n\n{todos}"));
        }

        let mut blocks: Vec<Value> = texts
            .into_iter()
            .map(|text| json!({"type": "text", "text": text}))
            .collect();

        if self.cache_control {
            if let Some(last) = blocks.last_mut() {
                last["cache_control"] = json!({"type": "ephemeral"});
            }
        }

        blocks
    }

    /// Format memorables as the inner-voice block, or None when nothing
    /// survives cleanup.
    fn format_memorables(&self, memorables: &[String]) -> Option<String> {
        let cleaned: Vec<&str> = memorables
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty() && *m != "```")
            .map(|m| m.trim_matches('`').trim())
            .filter(|m| !m.is_empty())
            .collect();

        if cleaned.is_empty() {
            return None;
        }

        let mut lines = vec![format!(
            "{}, this is your inner voice. Store these now:",
            self.soul.identity_name()
        )];
        for item in cleaned {
            lines.push(format!("- {item}"));
        }
        Some(lines.join("\n"))
    }

    async fn snapshot(&self, stage: &str, body: &Value) {
        let Some(dir) = &self.snapshot_dir else {
            return;
        };
        let path = dir.join(format!("last_alpha_request_{stage}.json"));
        match serde_json::to_vec_pretty(body) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!(path = %path.display(), error = %e, "failed to dump request");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize snapshot"),
        }
    }
}

#[async_trait]
impl Pattern for AlphaPattern {
    fn name(&self) -> &'static str {
        "alpha"
    }

    async fn request(
        &self,
        info: &RequestInfo,
        body: &mut Value,
        metadata_arg: Option<Envelope>,
    ) -> Result<()> {
        self.snapshot("pre", body).await;

        // Compact rewriting runs first, before the normal prompt goes in.
        compact::rewrite_auto_compact(body, self.soul.compact_prompt());
        scrub::scrub_noise(body);

        let report = metadata::extract(body);
        let envelope = merge_envelopes(report.envelope, metadata_arg);

        let session_id = if !info.session_id.is_empty() {
            info.session_id.clone()
        } else {
            envelope
                .as_ref()
                .and_then(|e| e.session_id.clone())
                .unwrap_or_default()
        };

        // Context files are plain blocking fs reads — off the event loop.
        let root = self.context_root.clone();
        let context_task =
            tokio::task::spawn_blocking(move || context::load_context(&root, CONTEXT_FILE_NAME));

        let (hud, summaries, memorables, context_result) = tokio::join!(
            self.kv.fetch_hud(),
            self.summaries.fetch_recent(),
            self.kv.memorables(&session_id),
            context_task,
        );
        let (context_blocks, hints) = context_result.unwrap_or_else(|e| {
            warn!(error = %e, "context load panicked");
            (Vec::new(), Vec::new())
        });

        let now = Utc::now().with_timezone(&HOUSE_TZ);
        let blocks = self.build_system_blocks(info, &hud, &summaries, &context_blocks, &hints, now);
        let block_count = blocks.len();
        splice_system(body, blocks);

        // Inner voice goes last, closest to response generation, but never
        // on a tool-result turn: the model is mid-task there.
        if let Some(block) = self.format_memorables(&memorables) {
            if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
                if !messages.is_empty() && !last_user_is_tool_result_only(messages) {
                    messages.push(json!({
                        "role": "user",
                        "content": [{"type": "text", "text": block}],
                    }));
                }
            }
        }

        info!(
            blocks = block_count,
            session = &session_id[..session_id.len().min(8)],
            "assembled alpha system prompt"
        );

        self.snapshot("post", body).await;

        if !session_id.is_empty() {
            tokio::spawn(token_count::count_and_stash(
                self.http.clone(),
                self.anthropic.clone(),
                self.kv.clone(),
                body.clone(),
                session_id,
            ));
        }

        Ok(())
    }
}

/// Client + machine + weather. Always present, even when every store is down.
fn here_block(info: &RequestInfo, hud: &HudData) -> String {
    let mut out = String::from("# Here\n\n");
    if let Some(client) = &info.client_name {
        out.push_str(&format!("**Client:** {}\n", capitalize(client)));
    }
    let machine = if info.machine_name.is_empty() {
        "unknown"
    } else {
        &info.machine_name
    };
    out.push_str(&format!("**Machine:** {machine}"));
    if let Some(weather) = &hud.weather {
        out.push_str("\n\n");
        out.push_str(weather);
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Splice the freshly-built blocks into the request's system array.
/// A non-empty incoming array keeps its slot-0 SDK preamble verbatim;
/// anything else is replaced wholesale.
fn splice_system(body: &mut Value, blocks: Vec<Value>) {
    match body.get_mut("system") {
        Some(Value::Array(existing)) if !existing.is_empty() => {
            existing.truncate(1);
            existing.extend(blocks);
        }
        Some(Value::String(_)) => {
            warn!("string system prompt replaced entirely");
            body["system"] = Value::Array(blocks);
        }
        _ => {
            body["system"] = Value::Array(blocks);
        }
    }
}

/// A message whose content is a list of nothing but tool_result blocks is
/// the SDK feeding tool output back — not a turn to whisper on.
fn last_user_is_tool_result_only(messages: &[Value]) -> bool {
    let Some(last_user) = messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
    else {
        return false;
    };
    match last_user.get("content") {
        Some(Value::Array(blocks)) => blocks
            .iter()
            .all(|b| b.get("type").and_then(Value::as_str) == Some("tool_result")),
        _ => false,
    }
}

/// Extractor wins field-by-field over the caller-supplied envelope.
fn merge_envelopes(extracted: Option<Envelope>, base: Option<Envelope>) -> Option<Envelope> {
    match (extracted, base) {
        (Some(e), Some(b)) => Some(Envelope {
            session_id: e.session_id.or(b.session_id),
            pattern: e.pattern.or(b.pattern),
            client: e.client.or(b.client),
            traceparent: e.traceparent.or(b.traceparent),
            sent_at: e.sent_at.or(b.sent_at),
            prompt: e.prompt.or(b.prompt),
            memories: if e.memories.is_empty() {
                b.memories
            } else {
                e.memories
            },
        }),
        (e, b) => e.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pattern() -> AlphaPattern {
        let config = LoomConfig::default();
        AlphaPattern {
            soul: Arc::new(Soul::from_parts("Alpha", "I live at the pond.", "recover")),
            kv: KvStore::new("redis://localhost:6379").unwrap(),
            summaries: Arc::new(SummaryStore::connect("")),
            http: reqwest::Client::new(),
            anthropic: config.anthropic.clone(),
            context_root: PathBuf::from("/nonexistent"),
            cache_control: true,
            snapshot_dir: None,
        }
    }

    fn info() -> RequestInfo {
        RequestInfo {
            session_id: "sess-1234".to_string(),
            machine_name: "duckpond-pi".to_string(),
            client_name: None,
        }
    }

    fn now() -> DateTime<chrono_tz::Tz> {
        HOUSE_TZ.with_ymd_and_hms(2026, 7, 31, 14, 30, 0).unwrap()
    }

    #[test]
    fn all_stores_down_yields_identity_and_here_only() {
        let blocks =
            pattern().build_system_blocks(&info(), &HudData::default(), &[], &[], &[], now());

        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0]["text"].as_str().unwrap(),
            "# Alpha\n\nI live at the pond."
        );
        assert_eq!(
            blocks[1]["text"].as_str().unwrap(),
            "# Here\n\n**Machine:** duckpond-pi"
        );
    }

    #[test]
    fn only_the_last_block_carries_cache_control() {
        let hud = HudData {
            weather: Some("Sunny, 21C".to_string()),
            calendar: Some("Nothing scheduled".to_string()),
            todos: Some("- feed ducks".to_string()),
            ..HudData::default()
        };
        let blocks = pattern().build_system_blocks(&info(), &hud, &[], &[], &[], now());

        let marked: Vec<usize> = blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.get("cache_control").is_some())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(marked, vec![blocks.len() - 1]);
    }

    #[test]
    fn cache_control_switch_off_marks_nothing() {
        let mut p = pattern();
        p.cache_control = false;
        let blocks = p.build_system_blocks(&info(), &HudData::default(), &[], &[], &[], now());
        assert!(blocks.iter().all(|b| b.get("cache_control").is_none()));
    }

    #[test]
    fn here_block_includes_client_and_weather() {
        let hud = HudData {
            weather: Some("Overcast".to_string()),
            ..HudData::default()
        };
        let mut i = info();
        i.client_name = Some("duckpond".to_string());

        assert_eq!(
            here_block(&i, &hud),
            "# Here\n\n**Client:** Duckpond\n**Machine:** duckpond-pi\n\nOvercast"
        );
    }

    #[test]
    fn block_order_follows_the_contract() {
        let hud = HudData {
            weather: Some("w".to_string()),
            calendar: Some("c".to_string()),
            todos: Some("t".to_string()),
            to_self: Some("letter".to_string()),
            to_self_time: Some("11:20 PM".to_string()),
            today_so_far: Some("today".to_string()),
            today_so_far_time: Some("2:00 PM".to_string()),
        };
        let summaries = vec![Summary {
            period_start: chrono::NaiveDate::from_ymd_opt(2026, 7, 30)
                .unwrap()
                .and_hms_opt(6, 0, 0)
                .unwrap(),
            period_end: chrono::NaiveDate::from_ymd_opt(2026, 7, 30)
                .unwrap()
                .and_hms_opt(22, 0, 0)
                .unwrap(),
            summary: "yesterday happened".to_string(),
        }];
        let ctx = vec![context::ContextBlock {
            path: "Basement/ALPHA.md".to_string(),
            content: "servers".to_string(),
        }];
        let hints = vec!["Read(Garden/ALPHA.md) when gardening".to_string()];

        let blocks = pattern().build_system_blocks(&info(), &hud, &summaries, &ctx, &hints, now());
        let texts: Vec<&str> = blocks.iter().map(|b| b["text"].as_str().unwrap()).collect();

        assert!(texts[0].starts_with("# Alpha\n"));
        assert!(texts[1].starts_with("## This part is a summary"));
        assert!(texts[2].starts_with("## Letter from last night (11:20 PM)\n"));
        assert!(texts[3].starts_with("## Today so far (Friday, July 31, 2026, 2:00 PM)\n"));
        assert!(texts[4].starts_with("# Here\n"));
        assert!(texts[5].starts_with("# Context: Basement/ALPHA.md\n"));
        assert!(texts[6].starts_with("# Context available\n"));
        assert!(texts[7].starts_with("# Events\n"));
        assert!(texts[8].starts_with("# Todos\n"));
        assert_eq!(texts.len(), 9);
    }

    #[test]
    fn splice_preserves_sdk_preamble() {
        let mut body = json!({
            "system": [
                {"type": "text", "text": "SDK preamble"},
                {"type": "text", "text": "old identity"},
                {"type": "text", "text": "old extras"},
            ]
        });
        splice_system(
            &mut body,
            vec![json!({"type": "text", "text": "new identity"})],
        );

        let system = body["system"].as_array().unwrap();
        assert_eq!(system.len(), 2);
        assert_eq!(system[0]["text"], json!("SDK preamble"));
        assert_eq!(system[1]["text"], json!("new identity"));
    }

    #[test]
    fn splice_replaces_absent_or_string_system() {
        let mut body = json!({});
        splice_system(&mut body, vec![json!({"type": "text", "text": "only"})]);
        assert_eq!(body["system"].as_array().unwrap().len(), 1);

        let mut body = json!({"system": "plain string"});
        splice_system(&mut body, vec![json!({"type": "text", "text": "only"})]);
        assert_eq!(body["system"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn tool_result_only_detection() {
        let messages = vec![
            json!({"role": "user", "content": "hello"}),
            json!({"role": "assistant", "content": [{"type": "tool_use", "id": "t", "name": "Read", "input": {}}]}),
            json!({"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t", "content": "data"}]}),
        ];
        assert!(last_user_is_tool_result_only(&messages));

        let messages = vec![json!({"role": "user", "content": [
            {"type": "tool_result", "tool_use_id": "t", "content": "data"},
            {"type": "text", "text": "and also this"},
        ]})];
        assert!(!last_user_is_tool_result_only(&messages));

        let messages = vec![json!({"role": "user", "content": "plain"})];
        assert!(!last_user_is_tool_result_only(&messages));
    }

    #[test]
    fn memorables_are_cleaned_and_ordered() {
        let p = pattern();
        let block = p
            .format_memorables(&[
                "  `remember the pond`  ".to_string(),
                "```".to_string(),
                "   ".to_string(),
                "second thing".to_string(),
            ])
            .unwrap();

        assert_eq!(
            block,
            "Alpha, this is your inner voice. Store these now:\n- remember the pond\n- second thing"
        );
    }

    #[test]
    fn all_junk_memorables_yield_nothing() {
        let p = pattern();
        assert!(p
            .format_memorables(&["```".to_string(), "``".to_string(), " ".to_string()])
            .is_none());
    }

    #[test]
    fn merge_prefers_extracted_fields() {
        let extracted = Envelope {
            session_id: Some("new".to_string()),
            ..Envelope::default()
        };
        let base = Envelope {
            session_id: Some("old".to_string()),
            client: Some("duckpond".to_string()),
            ..Envelope::default()
        };
        let merged = merge_envelopes(Some(extracted), Some(base)).unwrap();
        assert_eq!(merged.session_id.as_deref(), Some("new"));
        assert_eq!(merged.client.as_deref(), Some("duckpond"));
    }
}
