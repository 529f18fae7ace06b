//! Transcript watcher — tails Claude Code JSONL transcripts and publishes
//! parsed line events to Redis pub/sub for downstream consumers.
//!
//! One watcher per session, spawned on the first request and refreshed by
//! every subsequent one. Polling (not inotify) because the transcripts sit
//! on Docker volume mounts where inotify is unreliable. Only new bytes are
//! read; a shrunken file means rotation and tailing restarts at the new EOF.
//!
//! Lifecycle: spawn at current EOF → publish on every modification →
//! self-terminate after the idle timeout → deregister.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify::{RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loom_core::config::WatcherConfig;
use loom_store::kv::KvStore;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How often the loop re-checks the idle deadline when the file is quiet.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

struct WatcherHandle {
    cancel: CancellationToken,
    /// Epoch millis of the last request seen for this session.
    last_activity: Arc<AtomicU64>,
}

/// The per-session watcher registry — the one piece of mutable shared
/// state in the process. All access goes through `ensure`/`stop`.
pub struct WatcherRegistry {
    kv: KvStore,
    data_dir: PathBuf,
    idle_timeout: Duration,
    active: DashMap<String, WatcherHandle>,
}

impl WatcherRegistry {
    pub fn new(kv: KvStore, config: &WatcherConfig) -> Self {
        Self {
            kv,
            data_dir: PathBuf::from(&config.data_dir),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            active: DashMap::new(),
        }
    }

    /// Main entry point, called on every request that carries a session id:
    /// start a watcher if none exists, otherwise just reset its idle clock.
    pub async fn ensure(self: &Arc<Self>, session_id: &str) {
        if session_id.is_empty() {
            return;
        }

        if let Some(handle) = self.active.get(session_id) {
            handle.last_activity.store(now_ms(), Ordering::Relaxed);
            debug!(session = short(session_id), "watcher refreshed");
            return;
        }

        let Some(path) = find_transcript(&self.data_dir, session_id).await else {
            debug!(session = short(session_id), "no transcript found");
            return;
        };

        let cancel = CancellationToken::new();
        let last_activity = Arc::new(AtomicU64::new(now_ms()));
        self.active.insert(
            session_id.to_string(),
            WatcherHandle {
                cancel: cancel.clone(),
                last_activity: Arc::clone(&last_activity),
            },
        );

        info!(session = short(session_id), path = %path.display(), "watcher started");

        let registry = Arc::clone(self);
        let session = session_id.to_string();
        tokio::spawn(async move {
            registry
                .run_watcher(&session, &path, cancel, last_activity)
                .await;
            registry.active.remove(&session);
            info!(session = short(&session), "watcher stopped");
        });
    }

    /// Cancel a session's watcher, if any.
    #[allow(dead_code)]
    pub fn stop(&self, session_id: &str) {
        if let Some((_, handle)) = self.active.remove(session_id) {
            handle.cancel.cancel();
        }
    }

    #[allow(dead_code)]
    pub fn active_sessions(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    async fn run_watcher(
        &self,
        session_id: &str,
        path: &Path,
        cancel: CancellationToken,
        last_activity: Arc<AtomicU64>,
    ) {
        // Start at current EOF — only NEW content is interesting.
        let mut pos = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "transcript went away before watching");
                return;
            }
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Result<notify::Event>>(32);
        let mut watcher = match notify::PollWatcher::new(
            move |event| {
                let _ = tx.blocking_send(event);
            },
            notify::Config::default().with_poll_interval(POLL_INTERVAL),
        ) {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "failed to create file watcher");
                return;
            }
        };
        if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
            warn!(path = %path.display(), error = %e, "failed to watch transcript");
            return;
        }

        loop {
            let idle =
                Duration::from_millis(now_ms().saturating_sub(last_activity.load(Ordering::Relaxed)));
            if idle > self.idle_timeout {
                info!(session = short(session_id), "watcher idle timeout");
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session = short(session_id), "watcher cancelled");
                    break;
                }
                _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {}
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let Ok(event) = event else { continue };
                    if !event.kind.is_modify() {
                        continue;
                    }

                    let (new_pos, lines) = tail_file(path, pos).await;
                    pos = new_pos;
                    for line in lines {
                        let Some(record) = classify_line(&line) else { continue };
                        self.publish(session_id, record).await;
                    }
                }
            }
        }
    }

    async fn publish(&self, session_id: &str, record: LineRecord) {
        let channel = format!("transcript:{session_id}");
        let payload = json!({
            "session_id": session_id,
            "type": record.line_type,
            "role": record.role,
            "content_types": record.content_types,
            "raw": record.raw,
        })
        .to_string();

        if let Err(e) = self.kv.publish(&channel, &payload).await {
            warn!(error = %e, "transcript publish failed");
        } else {
            debug!(
                session = short(session_id),
                line_type = record.line_type.as_deref().unwrap_or("?"),
                "published transcript line"
            );
        }
    }
}

/// Transcripts live at `<data_dir>/projects/<slug>/<session_id>.jsonl`.
async fn find_transcript(data_dir: &Path, session_id: &str) -> Option<PathBuf> {
    let projects = data_dir.join("projects");
    let mut dirs = tokio::fs::read_dir(&projects).await.ok()?;
    let file_name = format!("{session_id}.jsonl");

    while let Ok(Some(entry)) = dirs.next_entry().await {
        let candidate = entry.path().join(&file_name);
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
    }
    None
}

/// Read `[pos, EOF)` and split into complete lines. The byte offset only
/// advances past the last newline, so a half-written line is picked up
/// whole on the next event and no line is ever processed twice.
async fn tail_file(path: &Path, pos: u64) -> (u64, Vec<String>) {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return (pos, Vec::new());
    };
    let len = meta.len();
    if len < pos {
        // Rotation: start over from the new EOF.
        debug!(path = %path.display(), "transcript shrank, resetting to EOF");
        return (len, Vec::new());
    }
    if len == pos {
        return (pos, Vec::new());
    }

    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return (pos, Vec::new());
    };
    if file.seek(std::io::SeekFrom::Start(pos)).await.is_err() {
        return (pos, Vec::new());
    }

    let mut buf = Vec::with_capacity((len - pos) as usize);
    if file.read_to_end(&mut buf).await.is_err() {
        return (pos, Vec::new());
    }

    let text = String::from_utf8_lossy(&buf);
    let Some(last_newline) = text.rfind('\n') else {
        // No complete line yet.
        return (pos, Vec::new());
    };

    let complete = &text[..last_newline];
    let lines = complete
        .split('\n')
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect();

    (pos + last_newline as u64 + 1, lines)
}

struct LineRecord {
    line_type: Option<String>,
    role: Option<String>,
    content_types: Vec<String>,
    raw: Value,
}

/// Parse a JSONL line and pull out the interesting bits. None when the
/// line isn't valid JSON.
fn classify_line(line: &str) -> Option<LineRecord> {
    let raw: Value = serde_json::from_str(line).ok()?;

    let line_type = raw.get("type").and_then(Value::as_str).map(str::to_string);
    let message = raw.get("message");
    let role = message
        .and_then(|m| m.get("role"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let content_types = match message.and_then(|m| m.get("content")) {
        Some(Value::String(_)) => vec!["text".to_string()],
        Some(Value::Array(blocks)) => {
            let mut types: Vec<String> = Vec::new();
            for block in blocks {
                let t = block
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("text")
                    .to_string();
                if !types.contains(&t) {
                    types.push(t);
                }
            }
            types
        }
        _ => Vec::new(),
    };

    Some(LineRecord {
        line_type,
        role,
        content_types,
        raw,
    })
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn short(session_id: &str) -> &str {
    &session_id[..session_id.len().min(8)]
}
