//! The Iota pattern — our volunteer test subject.
//!
//! No memory, no persistence. Two static orientation files loaded at
//! startup (the brochure and the bedside note) plus dynamic IOTA.md context
//! re-read on every request, so Iota knows who they are and what we're
//! asking. Also rewrites the post-compact continuation instruction, which
//! exercises the compaction path without the full alpha machinery.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use loom_core::config::LoomConfig;
use loom_core::error::Result;
use loom_core::metadata::Envelope;

use crate::alpha::{compact, context};
use crate::pattern::{Pattern, RequestInfo};

const CONTEXT_FILE_NAME: &str = "IOTA.md";
const STATIC_PROMPT_FILES: [&str; 2] = ["prompt.md", "prompt2.md"];

pub struct IotaPattern {
    static_prompts: Vec<String>,
    iota_root: PathBuf,
}

impl IotaPattern {
    pub fn new(config: &LoomConfig) -> Self {
        let prompt_dir = PathBuf::from(&config.pattern.iota_prompt_dir);
        let mut static_prompts = Vec::new();

        for name in STATIC_PROMPT_FILES {
            let path = prompt_dir.join(name);
            if let Ok(content) = std::fs::read_to_string(&path) {
                static_prompts.push(content);
            } else {
                debug!(path = %path.display(), "iota orientation file missing");
            }
        }

        Self {
            static_prompts,
            iota_root: PathBuf::from(&config.pattern.iota_root),
        }
    }

    /// Dynamic IOTA.md context, loaded fresh so edits land immediately.
    fn load_dynamic_prompts(&self) -> Vec<String> {
        let (blocks, hints) = context::load_context(&self.iota_root, CONTEXT_FILE_NAME);

        let mut prompts: Vec<String> = blocks
            .into_iter()
            .map(|b| format!("# Context: {}\n\n{}", b.path, b.content))
            .collect();
        if !hints.is_empty() {
            prompts.push(format!("# Context available\n\n{}", hints.join("\n")));
        }
        prompts
    }
}

#[async_trait]
impl Pattern for IotaPattern {
    fn name(&self) -> &'static str {
        "iota"
    }

    async fn request(
        &self,
        _info: &RequestInfo,
        body: &mut Value,
        _metadata: Option<Envelope>,
    ) -> Result<()> {
        compact::rewrite_continuation(body);

        let mut prompts = self.static_prompts.clone();
        prompts.extend(self.load_dynamic_prompts());
        if prompts.is_empty() {
            return Ok(());
        }

        splice_prompts(body, prompts);
        Ok(())
    }
}

/// Slot the prompts into the system array. The SDK sends
/// [preamble, identity, extras...]: the preamble is untouchable, the
/// identity slot is ours, and our extra prompts go right after it.
fn splice_prompts(body: &mut Value, prompts: Vec<String>) {
    match body.get_mut("system") {
        Some(Value::Array(existing)) if existing.len() >= 2 => {
            existing[1] = json!({"type": "text", "text": prompts[0]});
            for (offset, prompt) in prompts[1..].iter().enumerate() {
                existing.insert(2 + offset, json!({"type": "text", "text": prompt}));
            }
        }
        Some(Value::Array(existing)) => {
            for prompt in prompts {
                existing.push(json!({"type": "text", "text": prompt}));
            }
        }
        Some(Value::String(existing)) => {
            let combined = prompts.join("\n\n---\n\n");
            body["system"] = Value::String(format!("{combined}\n\n---\n\n{existing}"));
        }
        _ => {
            body["system"] = Value::String(prompts.join("\n\n---\n\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdk_array_keeps_preamble_and_replaces_identity_slot() {
        let mut body = json!({
            "system": [
                {"type": "text", "text": "SDK boilerplate"},
                {"type": "text", "text": "summarizer junk"},
                {"type": "text", "text": "env context"},
            ]
        });
        splice_prompts(
            &mut body,
            vec!["the brochure".to_string(), "the bedside note".to_string()],
        );

        let system = body["system"].as_array().unwrap();
        assert_eq!(system.len(), 4);
        assert_eq!(system[0]["text"], json!("SDK boilerplate"));
        assert_eq!(system[1]["text"], json!("the brochure"));
        assert_eq!(system[2]["text"], json!("the bedside note"));
        assert_eq!(system[3]["text"], json!("env context"));
    }

    #[test]
    fn missing_system_joins_prompts_as_string() {
        let mut body = json!({});
        splice_prompts(&mut body, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(body["system"], json!("a\n\n---\n\nb"));
    }

    #[test]
    fn string_system_is_prepended() {
        let mut body = json!({"system": "existing"});
        splice_prompts(&mut body, vec!["ours".to_string()]);
        assert_eq!(body["system"], json!("ours\n\n---\n\nexisting"));
    }
}
