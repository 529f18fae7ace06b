//! Soul — the identity documents, loaded from a local git checkout at
//! startup and cached for the process lifetime.
//!
//! Reading via `git show <ref>:<file>` means the served soul is always a
//! committed version, never whatever happens to be sitting in the working
//! tree. Two documents:
//!
//! - `system-prompt.md` — the identity doc. Required; startup aborts without it.
//! - `compact-prompt.md` — how to survive compactions. Optional; a minimal
//!   fallback stands in when missing.

use tokio::process::Command;
use tracing::{info, warn};

use loom_core::config::SoulConfig;
use loom_core::error::{LoomError, Result};

const COMPACT_FALLBACK: &str = "Summarize the conversation so far.";

/// Immutable identity state. Built once by [`Soul::load`], shared via `Arc`.
#[derive(Debug)]
pub struct Soul {
    identity_name: String,
    soul_doc: String,
    compact_doc: String,
    commit: String,
}

impl Soul {
    /// Load both documents and resolve the commit. Fails only when the
    /// identity doc itself is unreadable.
    pub async fn load(config: &SoulConfig) -> Result<Self> {
        let soul_doc = git_show(&config.repo, &config.soul_ref, &config.soul_file)
            .await
            .map_err(|e| {
                LoomError::FatalInit(format!(
                    "identity doc {}:{} unavailable in {}: {e}",
                    config.soul_ref, config.soul_file, config.repo
                ))
            })?;

        let compact_doc =
            match git_show(&config.repo, config.compact_ref(), &config.compact_file).await {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(error = %e, "compact doc unavailable, using fallback");
                    COMPACT_FALLBACK.to_string()
                }
            };

        let commit = match git_short_hash(&config.repo, &config.soul_ref).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(error = %e, "could not resolve soul commit");
                String::new()
            }
        };

        info!(
            commit = %commit,
            soul_chars = soul_doc.len(),
            "soul loaded"
        );

        Ok(Self {
            identity_name: config.identity_name.clone(),
            soul_doc,
            compact_doc,
            commit,
        })
    }

    /// Build directly from strings — used by iota-style patterns and tests.
    pub fn from_parts(identity_name: &str, soul_doc: &str, compact_doc: &str) -> Self {
        Self {
            identity_name: identity_name.to_string(),
            soul_doc: soul_doc.to_string(),
            compact_doc: compact_doc.to_string(),
            commit: String::new(),
        }
    }

    pub fn identity_name(&self) -> &str {
        &self.identity_name
    }

    /// The first system block: `# <name>` over the full identity doc.
    pub fn identity_block(&self) -> String {
        format!("# {}\n\n{}", self.identity_name, self.soul_doc)
    }

    pub fn compact_prompt(&self) -> &str {
        &self.compact_doc
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }
}

/// `git -C <repo> show <ref>:<file>` — the file content at that ref.
async fn git_show(repo: &str, git_ref: &str, file: &str) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .arg("show")
        .arg(format!("{git_ref}:{file}"))
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LoomError::Store(format!(
            "git show {git_ref}:{file} failed: {}",
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `git -C <repo> rev-parse --short <ref>`.
async fn git_short_hash(repo: &str, git_ref: &str) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .arg("rev-parse")
        .arg("--short")
        .arg(git_ref)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LoomError::Store(format!(
            "git rev-parse {git_ref} failed: {}",
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_block_is_headed_by_name() {
        let soul = Soul::from_parts("Alpha", "I am the pond.", "recover gracefully");
        assert_eq!(soul.identity_block(), "# Alpha\n\nI am the pond.");
        assert_eq!(soul.compact_prompt(), "recover gracefully");
    }

    #[tokio::test]
    async fn load_fails_fatally_without_repo() {
        let config = SoulConfig {
            repo: "/nonexistent/soul-repo".to_string(),
            ..SoulConfig::default()
        };
        let err = Soul::load(&config).await.expect_err("should fail");
        assert!(matches!(err, LoomError::FatalInit(_)));
    }
}
