//! End-to-end exercise of the alpha request transform with every backing
//! store unreachable — the pipeline must still produce a complete, valid
//! request with graceful degradation.

use std::sync::Arc;

use serde_json::{json, Value};

use loom_core::config::LoomConfig;
use loom_pattern::alpha::AlphaPattern;
use loom_pattern::soul::Soul;
use loom_pattern::{Pattern, RequestInfo};
use loom_store::db::SummaryStore;
use loom_store::kv::KvStore;

fn offline_pattern() -> AlphaPattern {
    let mut config = LoomConfig::default();
    // Nothing listens here; every fetch degrades to empty.
    config.redis.url = "redis://127.0.0.1:1".to_string();
    config.database.url = String::new();
    config.pattern.context_root = "/nonexistent/context-root".to_string();

    let soul = Arc::new(Soul::from_parts(
        "Alpha",
        "I live at the pond.",
        "Write the summary as yourself.",
    ));
    let kv = KvStore::new(&config.redis.url).expect("valid redis url");
    let summaries = Arc::new(SummaryStore::connect(&config.database.url));

    AlphaPattern::new(soul, kv, summaries, &config)
}

fn request_info() -> RequestInfo {
    RequestInfo {
        session_id: String::new(),
        machine_name: "test-rig".to_string(),
        client_name: None,
    }
}

#[tokio::test]
async fn canary_prompt_passes_through_with_full_assembly() {
    let pattern = offline_pattern();
    let mut body = json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 1024,
        "system": [
            {"type": "text", "text": "SDK preamble"},
            {"type": "text", "text": "old identity slot"},
        ],
        "messages": [
            {"role": "user", "content": [{"type": "text", "text":
                r#"{"canary":"ALPHA_METADATA_UlVCQkVSRFVDSw","prompt":"hello world","memories":[]}"#}]},
        ],
    });

    pattern
        .request(&request_info(), &mut body, None)
        .await
        .expect("transform succeeds");

    // Envelope cleaned down to the prompt.
    assert_eq!(
        body["messages"][0]["content"][0]["text"],
        json!("hello world")
    );

    let system = body["system"].as_array().unwrap();

    // Slot 0 survives verbatim; our blocks replace everything after it.
    assert_eq!(system[0]["text"], json!("SDK preamble"));
    assert_eq!(
        system[1]["text"],
        json!("# Alpha\n\nI live at the pond.")
    );

    // With all stores down: identity + Here, nothing else.
    assert_eq!(system.len(), 3);
    assert_eq!(system[2]["text"], json!("# Here\n\n**Machine:** test-rig"));

    // Exactly one cache_control marker, on the last block.
    let marked: Vec<usize> = system
        .iter()
        .enumerate()
        .filter(|(_, b)| b.get("cache_control").is_some())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(marked, vec![system.len() - 1]);

    // Opaque request fields are untouched.
    assert_eq!(body["model"], json!("claude-sonnet-4-5"));
    assert_eq!(body["max_tokens"], json!(1024));
}

#[tokio::test]
async fn message_order_and_roles_are_preserved() {
    let pattern = offline_pattern();
    let mut body = json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 512,
        "messages": [
            {"role": "user", "content": "first question"},
            {"role": "assistant", "content": [{"type": "text", "text": "first answer"}]},
            {"role": "user", "content": [{"type": "text", "text": "second question"}]},
        ],
    });

    pattern
        .request(&request_info(), &mut body, None)
        .await
        .expect("transform succeeds");

    let roles: Vec<&str> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "user"]);
    assert_eq!(body["messages"][0]["content"], json!("first question"));
}

#[tokio::test]
async fn empty_messages_only_gain_a_system_array() {
    let pattern = offline_pattern();
    let mut body = json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 512,
        "messages": [],
    });

    pattern
        .request(&request_info(), &mut body, None)
        .await
        .expect("transform succeeds");

    assert_eq!(body["messages"], json!([]));
    assert!(body["system"].is_array());
}

#[tokio::test]
async fn running_the_transform_twice_is_stable() {
    let pattern = offline_pattern();
    let mut body = json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 512,
        "system": [{"type": "text", "text": "SDK preamble"}],
        "messages": [
            {"role": "user", "content": [{"type": "text", "text": "plain question"}]},
        ],
    });

    pattern
        .request(&request_info(), &mut body, None)
        .await
        .expect("first pass");
    let once = body.clone();
    pattern
        .request(&request_info(), &mut body, None)
        .await
        .expect("second pass");

    assert_eq!(body, once);
}

#[tokio::test]
async fn string_system_prompt_is_replaced_wholesale() {
    let pattern = offline_pattern();
    let mut body = json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 512,
        "system": "plain string prompt",
        "messages": [{"role": "user", "content": "hi"}],
    });

    pattern
        .request(&request_info(), &mut body, None)
        .await
        .expect("transform succeeds");

    let system = body["system"].as_array().expect("system became an array");
    assert!(system[0]["text"]
        .as_str()
        .unwrap()
        .starts_with("# Alpha\n"));

    let tainted: Vec<&Value> = system
        .iter()
        .filter(|b| b["text"].as_str().unwrap_or_default() == "plain string prompt")
        .collect();
    assert!(tainted.is_empty());
}
