//! Derived, read-only project file access: a cached file listing and
//! path-escape-safe file reads, scoped to a session's working directory.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use ignore::WalkBuilder;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{ApiResult, AppError};

const LISTING_CACHE_TTL: Duration = Duration::from_secs(10);

const IGNORE_DIRS: &[&str] = &[".git", "node_modules", "__pycache__", ".venv", "venv", "dist", "build"];

static EXT_TO_LANGUAGE: &[(&str, &str)] = &[
    ("py", "python"),
    ("js", "javascript"),
    ("ts", "typescript"),
    ("tsx", "tsx"),
    ("jsx", "jsx"),
    ("json", "json"),
    ("md", "markdown"),
    ("sh", "bash"),
    ("css", "css"),
    ("html", "html"),
    ("yaml", "yaml"),
    ("yml", "yaml"),
    ("toml", "toml"),
    ("rs", "rust"),
];

pub(crate) fn file_language(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    ext.as_deref()
        .and_then(|e| EXT_TO_LANGUAGE.iter().find(|(k, _)| *k == e).map(|(_, v)| *v))
        .unwrap_or("text")
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProjectFileEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub size: Option<u64>,
}

struct CachedListing {
    entries: Vec<ProjectFileEntry>,
    computed_at: Instant,
}

static LISTING_CACHE: LazyLock<Mutex<HashMap<PathBuf, CachedListing>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Walk `root`, skipping only the fixed directory-name set; no gitignore,
/// no hidden-file filtering — everything else is listed.
fn walk(root: &Path) -> Vec<ProjectFileEntry> {
    let mut entries = Vec::new();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_exclude(false)
        .git_global(false)
        .ignore(false)
        .parents(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| {
            entry
                .path()
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| !IGNORE_DIRS.contains(&name))
                .unwrap_or(true)
        })
        .build();

    for result in walker {
        let Ok(entry) = result else { continue };
        let path = entry.path();
        if path == root {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(path).to_string_lossy().replace('\\', "/");
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            entries.push(ProjectFileEntry {
                path: rel,
                kind: "directory",
                size: None,
            });
        } else {
            let size = entry.metadata().ok().map(|m| m.len());
            entries.push(ProjectFileEntry {
                path: rel,
                kind: "file",
                size,
            });
        }
    }
    entries
}

/// List every non-ignored file and directory under `root`, refreshing the
/// cache at most once every ten seconds per directory.
pub(crate) async fn list_project_files(root: &Path) -> ApiResult<Vec<ProjectFileEntry>> {
    let root = root.to_path_buf();
    let mut cache = LISTING_CACHE.lock().await;
    if let Some(cached) = cache.get(&root)
        && cached.computed_at.elapsed() < LISTING_CACHE_TTL
    {
        return Ok(cached.entries.clone());
    }

    let root_for_walk = root.clone();
    let entries = tokio::task::spawn_blocking(move || walk(&root_for_walk))
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;

    cache.insert(
        root.clone(),
        CachedListing {
            entries: entries.clone(),
            computed_at: Instant::now(),
        },
    );
    Ok(entries)
}

fn has_parent_dir_component(p: &Path) -> bool {
    p.components().any(|c| matches!(c, Component::ParentDir))
}

/// Read a file's contents, rejecting any path that escapes `root` via `..`
/// components or symlink resolution.
pub(crate) async fn read_project_file(
    root: &Path,
    relative: &str,
) -> ApiResult<(String, &'static str)> {
    let relative_path = Path::new(relative);
    if relative_path.is_absolute() || has_parent_dir_component(relative_path) {
        return Err(AppError::bad_request("path escapes project root"));
    }

    let full = root.join(relative_path);
    let canonical_root = tokio::fs::canonicalize(root)
        .await
        .map_err(|_| AppError::not_found("project root not found"))?;
    let canonical = tokio::fs::canonicalize(&full)
        .await
        .map_err(|_| AppError::not_found("file not found"))?;
    if !canonical.starts_with(&canonical_root) {
        return Err(AppError::bad_request("path escapes project root"));
    }

    let meta = tokio::fs::metadata(&canonical).await?;
    if !meta.is_file() {
        return Err(AppError::bad_request("path is not a file"));
    }

    let bytes = tokio::fs::read(&canonical).await?;
    let content = String::from_utf8_lossy(&bytes).into_owned();
    Ok((content, file_language(&canonical)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn maps_known_extensions_to_languages() {
        assert_eq!(file_language(Path::new("main.rs")), "rust");
        assert_eq!(file_language(Path::new("script.py")), "python");
        assert_eq!(file_language(Path::new("unknown.xyz")), "text");
    }

    #[tokio::test]
    async fn rejects_parent_dir_escape() {
        let dir = tempdir().unwrap();
        let err = read_project_file(dir.path(), "../outside.txt").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn lists_files_skipping_ignored_dirs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}").unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules/dep.js"), "").unwrap();

        let entries = list_project_files(dir.path()).await.unwrap();
        assert!(entries.iter().any(|e| e.path == "a.rs"));
        assert!(!entries.iter().any(|e| e.path.starts_with("node_modules")));
    }

    #[tokio::test]
    async fn skips_venv_dir() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("venv")).unwrap();
        std::fs::write(dir.path().join("venv/pyvenv.cfg"), "").unwrap();
        std::fs::create_dir(dir.path().join(".venv")).unwrap();
        std::fs::write(dir.path().join(".venv/pyvenv.cfg"), "").unwrap();

        let entries = list_project_files(dir.path()).await.unwrap();
        assert!(!entries.iter().any(|e| e.path.starts_with("venv")));
        assert!(!entries.iter().any(|e| e.path.starts_with(".venv")));
    }

    #[tokio::test]
    async fn lists_dotfiles_not_in_the_ignore_set() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        std::fs::create_dir(dir.path().join(".github")).unwrap();
        std::fs::write(dir.path().join(".github/workflow.yml"), "").unwrap();

        let entries = list_project_files(dir.path()).await.unwrap();
        assert!(entries.iter().any(|e| e.path == ".env"));
        assert!(entries.iter().any(|e| e.path == ".github"));
    }

    #[tokio::test]
    async fn lists_gitignored_paths_anyway() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "ignored.txt\n").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "still tracked by this walk").unwrap();

        let entries = list_project_files(dir.path()).await.unwrap();
        assert!(entries.iter().any(|e| e.path == "ignored.txt"));
    }
}
