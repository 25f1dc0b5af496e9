//! `GET /api/directories/search` — finds git repositories under a configured
//! root by leaf-name substring match.

use std::path::{Path, PathBuf};

use serde::Serialize;

const MAX_DEPTH: usize = 3;
const MAX_RESULTS: usize = 20;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DirectoryMatch {
    pub path: String,
    pub name: String,
}

pub(crate) async fn search(root: &Path, query: &str) -> Vec<DirectoryMatch> {
    let root = root.to_path_buf();
    let query = query.to_ascii_lowercase();
    tokio::task::spawn_blocking(move || walk(&root, &query))
        .await
        .unwrap_or_default()
}

fn walk(root: &Path, query: &str) -> Vec<DirectoryMatch> {
    let mut results = Vec::new();
    let mut stack: Vec<(PathBuf, usize)> = vec![(root.to_path_buf(), 0)];

    while let Some((dir, depth)) = stack.pop() {
        if results.len() >= MAX_RESULTS {
            break;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.flatten() {
            if results.len() >= MAX_RESULTS {
                break;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if path.join(".git").exists() {
                if query.is_empty() || name.to_ascii_lowercase().contains(query) {
                    results.push(DirectoryMatch {
                        path: path.to_string_lossy().into_owned(),
                        name,
                    });
                }
                // A repo's own subdirectories are not walked further.
                continue;
            }

            if depth < MAX_DEPTH {
                stack.push((path, depth + 1));
            }
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn finds_repos_matching_query() {
        let root = tempdir().unwrap();
        let repo = root.path().join("alpha-service");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        let other = root.path().join("beta-service");
        std::fs::create_dir_all(other.join(".git")).unwrap();

        let found = search(root.path(), "alpha").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "alpha-service");
    }

    #[tokio::test]
    async fn does_not_descend_into_a_repo_it_already_matched() {
        let root = tempdir().unwrap();
        let repo = root.path().join("outer");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::create_dir_all(repo.join("nested").join(".git")).unwrap();

        let found = search(root.path(), "").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "outer");
    }
}
