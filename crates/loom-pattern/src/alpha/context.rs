//! Dynamic context from ALPHA.md files scattered around the tree.
//!
//! Each file carries YAML frontmatter with an `autoload` key:
//!
//! - `autoload: all`  → full content becomes a system block
//! - `autoload: when` → just a hint: `Read(<path>) when <when>`
//! - anything else    → skipped
//!
//! Full content while working in an area, a one-line hint the rest of the
//! time. Files are re-read on every request so edits land immediately.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

/// A fully-included context file.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    /// Path relative to the context root.
    pub path: String,
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    autoload: Option<String>,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
}

/// Load context files under `root`, returning full blocks and hints in
/// path-sorted order. Unreadable or unparseable files are skipped with a
/// warning.
pub fn load_context(root: &Path, file_name: &str) -> (Vec<ContextBlock>, Vec<String>) {
    let mut blocks = Vec::new();
    let mut hints = Vec::new();

    for path in find_context_files(root, file_name) {
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read context file");
                continue;
            }
        };

        let parsed = match gray_matter::Matter::<gray_matter::engine::YAML>::new()
            .parse::<FrontMatter>(&content)
        {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse frontmatter");
                continue;
            }
        };

        let matter = parsed.data.unwrap_or_default();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .to_string();

        let autoload = matter.autoload.as_deref().unwrap_or("no").to_lowercase();
        match autoload.as_str() {
            "all" => {
                debug!(path = %rel, "loaded full context");
                blocks.push(ContextBlock {
                    path: rel,
                    content: parsed.content.trim().to_string(),
                });
            }
            "when" => {
                if let Some(when) = matter.when.as_deref().filter(|w| !w.trim().is_empty()) {
                    debug!(path = %rel, "added context hint");
                    hints.push(format!("Read({rel}) when {when}"));
                }
            }
            _ => {}
        }
    }

    (blocks, hints)
}

/// Walk the tree collecting files with the given name, sorted for a stable
/// prompt layout.
fn find_context_files(root: &Path, file_name: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    if !root.exists() {
        warn!(root = %root.display(), "context root does not exist");
        return found;
    }
    collect(root, file_name, &mut found);
    found.sort();
    found
}

fn collect(dir: &Path, file_name: &str, found: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect(&path, file_name, found);
        } else if entry.file_name() == file_name {
            found.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn autoload_all_produces_full_block() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "Basement/ALPHA.md",
            "---\nautoload: all\n---\nThe basement holds the servers.\n",
        );

        let (blocks, hints) = load_context(dir.path(), "ALPHA.md");
        assert_eq!(blocks.len(), 1);
        assert!(hints.is_empty());
        assert_eq!(blocks[0].path, "Basement/ALPHA.md");
        assert_eq!(blocks[0].content, "The basement holds the servers.");
    }

    #[test]
    fn autoload_when_produces_hint() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "Garden/ALPHA.md",
            "---\nautoload: when\nwhen: tending the garden\n---\nSoil notes.\n",
        );

        let (blocks, hints) = load_context(dir.path(), "ALPHA.md");
        assert!(blocks.is_empty());
        assert_eq!(hints, vec!["Read(Garden/ALPHA.md) when tending the garden"]);
    }

    #[test]
    fn autoload_when_without_condition_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "X/ALPHA.md", "---\nautoload: when\n---\nBody.\n");

        let (blocks, hints) = load_context(dir.path(), "ALPHA.md");
        assert!(blocks.is_empty());
        assert!(hints.is_empty());
    }

    #[test]
    fn autoload_no_and_missing_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "A/ALPHA.md", "---\nautoload: no\n---\nHidden.\n");
        write(dir.path(), "B/ALPHA.md", "No frontmatter at all.\n");

        let (blocks, hints) = load_context(dir.path(), "ALPHA.md");
        assert!(blocks.is_empty());
        assert!(hints.is_empty());
    }

    #[test]
    fn results_are_path_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b/ALPHA.md", "---\nautoload: all\n---\nsecond\n");
        write(dir.path(), "a/ALPHA.md", "---\nautoload: all\n---\nfirst\n");

        let (blocks, _) = load_context(dir.path(), "ALPHA.md");
        assert_eq!(blocks[0].content, "first");
        assert_eq!(blocks[1].content, "second");
    }

    #[test]
    fn missing_root_yields_nothing() {
        let (blocks, hints) = load_context(Path::new("/nonexistent/context"), "ALPHA.md");
        assert!(blocks.is_empty());
        assert!(hints.is_empty());
    }
}
