//! W3C trace-context plumbing.
//!
//! The hook sends a `traceparent` header so a whole turn hangs together in
//! the telemetry backend. We keep the trace id, mint a fresh span id for
//! the hop through the Loom, and forward the updated header upstream.
//! Headers that don't parse are forwarded untouched.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// `00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Traceparent {
    pub trace_id: String,
    pub parent_id: String,
    pub flags: String,
}

pub fn parse(header: &str) -> Option<Traceparent> {
    let mut parts = header.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let parent_id = parts.next()?;
    let flags = parts.next()?;

    if parts.next().is_some() {
        return None;
    }
    if version != "00" || trace_id.len() != 32 || parent_id.len() != 16 || flags.len() != 2 {
        return None;
    }
    if !is_lower_hex(trace_id) || !is_lower_hex(parent_id) || !is_lower_hex(flags) {
        return None;
    }
    // all-zero ids are invalid per W3C trace-context
    if trace_id.bytes().all(|b| b == b'0') || parent_id.bytes().all(|b| b == b'0') {
        return None;
    }

    Some(Traceparent {
        trace_id: trace_id.to_string(),
        parent_id: parent_id.to_string(),
        flags: flags.to_string(),
    })
}

/// The header for the outbound hop: same trace, fresh span id.
/// Returns None when the incoming header is malformed.
pub fn child_of(header: &str) -> Option<String> {
    let parent = parse(header)?;
    Some(format!(
        "00-{}-{}-{}",
        parent.trace_id,
        next_span_id(&parent.trace_id),
        parent.flags
    ))
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// 16 hex chars, unique per call: a hash of the trace id, a process-wide
/// counter, and the clock. Not cryptographic, doesn't need to be.
fn next_span_id(trace_id: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut hasher = DefaultHasher::new();
    trace_id.hash(&mut hasher);
    COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
        .hash(&mut hasher);

    let id = hasher.finish().max(1);
    format!("{id:016x}")
}
