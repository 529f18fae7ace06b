use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoomError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Startup cannot proceed — the identity document is unavailable.
    #[error("Fatal init error: {0}")]
    FatalInit(String),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Store(String),

    #[error("Background task failed: {0}")]
    Background(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LoomError>;
