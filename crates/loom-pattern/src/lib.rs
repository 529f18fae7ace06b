//! Patterns — the request/response transformations that give the Loom its
//! point. The proxy machinery lives in `loom-gateway`; identity lives here.

pub mod alpha;
pub mod iota;
pub mod metadata;
pub mod passthrough;
pub mod pattern;
pub mod soul;

pub use pattern::{Pattern, PatternRegistry, RequestInfo};
