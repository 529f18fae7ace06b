use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18200;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Top-level config (loom.toml + LOOM_* env overrides + dedicated env vars).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoomConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub soul: SoulConfig,
    #[serde(default)]
    pub pattern: PatternConfig,
    #[serde(default)]
    pub anthropic: AnthropicConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            upstream: UpstreamConfig::default(),
            redis: RedisConfig::default(),
            database: DatabaseConfig::default(),
            soul: SoulConfig::default(),
            pattern: PatternConfig::default(),
            anthropic: AnthropicConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL requests are forwarded to — Anthropic directly, or the next
    /// hop in the pipeline.
    #[serde(default = "default_upstream_url")]
    pub url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Postgres connection string for the summaries store.
    /// Empty = summaries disabled (fetch degrades to none).
    #[serde(default)]
    pub url: String,
}

/// Where the identity documents live — a local git checkout read via
/// `git show <ref>:<file>` so the served soul is always a committed version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoulConfig {
    #[serde(default = "default_soul_repo")]
    pub repo: String,
    #[serde(default = "default_soul_ref")]
    pub soul_ref: String,
    /// Ref for the compaction-recovery document. Defaults to `soul_ref`.
    #[serde(default)]
    pub compact_ref: Option<String>,
    #[serde(default = "default_soul_file")]
    pub soul_file: String,
    #[serde(default = "default_compact_file")]
    pub compact_file: String,
    #[serde(default = "default_identity_name")]
    pub identity_name: String,
}

impl Default for SoulConfig {
    fn default() -> Self {
        Self {
            repo: default_soul_repo(),
            soul_ref: default_soul_ref(),
            compact_ref: None,
            soul_file: default_soul_file(),
            compact_file: default_compact_file(),
            identity_name: default_identity_name(),
        }
    }
}

impl SoulConfig {
    pub fn compact_ref(&self) -> &str {
        self.compact_ref.as_deref().unwrap_or(&self.soul_ref)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Root walked for ALPHA.md context files.
    #[serde(default = "default_context_root")]
    pub context_root: String,
    /// Directory holding Iota's static orientation files (prompt.md, prompt2.md).
    #[serde(default = "default_iota_prompt_dir")]
    pub iota_prompt_dir: String,
    /// Root walked for IOTA.md context files.
    #[serde(default = "default_iota_root")]
    pub iota_root: String,
    /// Attach cache_control to the last assembled system block.
    #[serde(default = "bool_true")]
    pub cache_control: bool,
    /// When set, the fully-composed alpha request is dumped here as JSON.
    #[serde(default)]
    pub snapshot_dir: Option<String>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            context_root: default_context_root(),
            iota_prompt_dir: default_iota_prompt_dir(),
            iota_root: default_iota_root(),
            cache_control: true,
            snapshot_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnthropicConfig {
    /// Key for the token-count side task only — proxied requests carry the
    /// client's own credentials.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_count_url")]
    pub count_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directory holding Claude Code transcripts (projects/*/<session>.jsonl).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Watcher exits after this many seconds without a request for its session.
    /// 60 for testing; production runs closer to 3600.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_upstream_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_soul_repo() -> String {
    "/Pondside/Soul".to_string()
}
fn default_soul_ref() -> String {
    "HEAD".to_string()
}
fn default_soul_file() -> String {
    "system-prompt.md".to_string()
}
fn default_compact_file() -> String {
    "compact-prompt.md".to_string()
}
fn default_identity_name() -> String {
    "Alpha".to_string()
}
fn default_context_root() -> String {
    "/Pondside".to_string()
}
fn default_iota_prompt_dir() -> String {
    "/Iota/prompts".to_string()
}
fn default_iota_root() -> String {
    "/Iota".to_string()
}
fn default_count_url() -> String {
    "https://api.anthropic.com/v1/messages/count_tokens".to_string()
}
fn default_data_dir() -> String {
    "/claude-data".to_string()
}
fn default_idle_timeout() -> u64 {
    60
}
fn bool_true() -> bool {
    true
}

impl LoomConfig {
    /// Load config from a TOML file with LOOM_* env overrides, then apply the
    /// dedicated env vars the deployment scripts set.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("loom.toml");

        let mut config: LoomConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LOOM_").split("_"))
            .extract()
            .map_err(|e| crate::error::LoomError::Config(e.to_string()))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Dedicated env vars win over file and LOOM_* values.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("UPSTREAM_URL") {
            self.upstream.url = v;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.redis.url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("ALPHA_SOUL_REPO") {
            self.soul.repo = v;
        }
        if let Ok(v) = std::env::var("ALPHA_SOUL_REF") {
            self.soul.soul_ref = v;
        }
        if let Ok(v) = std::env::var("ALPHA_COMPACT_REF") {
            self.soul.compact_ref = Some(v);
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            self.anthropic.api_key = v;
        }
        if let Ok(v) = std::env::var("CLAUDE_DATA_DIR") {
            self.watcher.data_dir = v;
        }
    }
}
