//! Single-document JSON persistence under the app's config directory.
//!
//! Each logical table is one JSON file, rewritten atomically (write to a
//! `.tmp` sibling, then rename) and guarded by an `fs2` exclusive lock on a
//! `.lock` sidecar so concurrent writers from different tasks don't
//! interleave. This replaces the truncate-then-insert pattern of a
//! document database with a single atomic rewrite per save.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};

use crate::path_utils::config_home_dir;

pub(crate) const APP_DIR_NAME: &str = "tmux-studio";

pub(crate) fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TMUX_STUDIO_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    config_home_dir().join(APP_DIR_NAME)
}

pub(crate) fn sessions_path() -> PathBuf {
    data_dir().join("sessions.json")
}

pub(crate) fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

pub(crate) fn session_data_dir() -> PathBuf {
    data_dir().join("session_data")
}

pub(crate) fn session_data_path(session_name: &str) -> PathBuf {
    session_data_dir().join(format!("{session_name}.json"))
}

pub(crate) fn project_key(workdir: &str) -> String {
    format!("{:012x}", stable_hash_hex(workdir.as_bytes()))
}

/// Tiny, dependency-free hash used only to derive a stable 12-hex-char
/// filename for per-workdir project files (not a security boundary).
/// Fowler-Noll-Vo is sufficient here: we only need a stable, short,
/// filesystem-safe key, not collision resistance against an adversary.
fn stable_hash_hex(data: &[u8]) -> u128 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash as u128) & 0xffffffffffff
}

async fn read_json_file<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&raw).ok()
}

/// Write `value` to `path` atomically, taking an exclusive file lock on a
/// `.lock` sidecar for the duration of the write so concurrent writers
/// (background idle monitor, API handlers) never interleave partial files.
pub(crate) async fn write_json_file<T: Serialize + Send + 'static>(
    path: PathBuf,
    value: T,
) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("lock");
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let json = serde_json::to_string_pretty(&value)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let pid = std::process::id();
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let tmp = path.with_extension(format!("tmp.{pid}.{millis}"));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;

        FileExt::unlock(&lock_file)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

/// A single-document table: a map of string keys to arbitrary JSON-shaped
/// values, persisted as one file. `get`/`set`/`remove` operate in memory;
/// call `save` to flush. Mirrors the shape used for `todos`, `scratchpad`,
/// and `idle_state` tables inside a session's data file.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
pub(crate) struct Table<T>(pub BTreeMap<String, T>);

impl<T: DeserializeOwned + Serialize + Send + Sync + 'static> Table<T> {
    pub async fn load(path: &Path) -> Self {
        read_json_file(path).await.unwrap_or_default()
    }
}

/// Generic load/save pair for a whole-document store (settings.json,
/// sessions.json, global.json, per-project and per-session files).
pub(crate) struct Store<T> {
    pub path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned + Serialize + Default + Send + Sync + 'static> Store<T> {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _marker: std::marker::PhantomData,
        }
    }

    pub async fn load(&self) -> T {
        read_json_file(&self.path).await.unwrap_or_default()
    }

    pub async fn save(&self, value: &T) -> std::io::Result<()>
    where
        T: Clone,
    {
        write_json_file(self.path.clone(), value.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
    struct Doc {
        count: u32,
    }

    #[tokio::test]
    async fn round_trips_through_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("doc.json");
        let store = Store::<Doc>::new(path.clone());

        let loaded = store.load().await;
        assert_eq!(loaded, Doc::default());

        store.save(&Doc { count: 7 }).await.unwrap();
        let loaded = store.load().await;
        assert_eq!(loaded, Doc { count: 7 });

        // No leftover .tmp files after a successful save.
        let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().into_owned());
        }
        assert!(names.iter().all(|n| !n.contains(".tmp.")));
    }

    #[test]
    fn project_key_is_stable_hex() {
        let a = project_key("/home/alice/project");
        let b = project_key("/home/alice/project");
        assert_eq!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
