//! Diff cache (§4.6): keeps per-session working-tree diffs warm for sessions
//! under active interest, computed off the request path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::git::{self, DiffSnapshot};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// A session stops being "active" 60 s after its last full-diff request.
const INTEREST_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub(crate) struct DiffStats {
    pub files: usize,
    pub additions: u32,
    pub deletions: u32,
}

struct Inner {
    cache: HashMap<String, DiffSnapshot>,
    last_interest: HashMap<String, Instant>,
    workdirs: HashMap<String, String>,
}

pub(crate) struct DiffCache {
    inner: Mutex<Inner>,
}

impl Default for DiffCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                cache: HashMap::new(),
                last_interest: HashMap::new(),
                workdirs: HashMap::new(),
            }),
        }
    }

    /// Records interest in `name`'s full diff and its workdir so the next
    /// poll picks it up. Only the full-diff caller should invoke this — the
    /// stats endpoint must not (§4.6, §8 invariant 8).
    pub async fn mark_active(&self, name: &str, workdir: &str) {
        let mut inner = self.inner.lock().await;
        inner.last_interest.insert(name.to_string(), Instant::now());
        inner.workdirs.insert(name.to_string(), workdir.to_string());
    }

    /// Derived from the cache only; never touches `lastInterest`.
    pub async fn get_diff(&self, name: &str) -> Option<DiffSnapshot> {
        let inner = self.inner.lock().await;
        inner.cache.get(name).cloned()
    }

    pub async fn get_stats(&self, name: &str) -> Option<DiffStats> {
        let inner = self.inner.lock().await;
        inner.cache.get(name).map(|snapshot| DiffStats {
            files: snapshot.files.len(),
            additions: snapshot.additions,
            deletions: snapshot.deletions,
        })
    }

    /// Invalidated immediately by any working-tree mutation (§4.6, §8
    /// invariant 9); the next poll recomputes it if the session is still active.
    pub async fn invalidate(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        inner.cache.remove(name);
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;
            self.poll_once().await;
        }
    }

    async fn poll_once(&self) {
        let active: Vec<(String, String)> = {
            let mut inner = self.inner.lock().await;
            let expired: Vec<String> = inner
                .last_interest
                .iter()
                .filter(|(_, last)| last.elapsed() >= INTEREST_WINDOW)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &expired {
                inner.last_interest.remove(name);
                inner.workdirs.remove(name);
                inner.cache.remove(name);
            }
            inner
                .last_interest
                .keys()
                .filter_map(|name| inner.workdirs.get(name).map(|wd| (name.clone(), wd.clone())))
                .collect()
        };

        for (name, workdir) in active {
            let Ok(snapshot) = git::diff_with_untracked(&workdir).await else {
                continue;
            };
            let mut inner = self.inner.lock().await;
            inner.cache.insert(name, snapshot);
        }
    }
}
