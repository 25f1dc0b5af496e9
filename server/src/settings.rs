//! `settings.json`: a single deep-merged document (§6 Persisted layout).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::ai::AiProviderConfig;
use crate::store::{self, Store};

fn default_repo_search_root() -> String {
    std::env::var("HOME")
        .map(|home| format!("{home}/src"))
        .unwrap_or_else(|_| "/root/src".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Settings {
    #[serde(default = "default_repo_search_root")]
    pub repo_search_root: String,

    #[serde(default)]
    pub ai_provider: Option<AiProviderConfig>,

    /// Unknown keys round-trip untouched so clients can evolve the document
    /// without the server discarding fields it doesn't model yet.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repo_search_root: default_repo_search_root(),
            ai_provider: None,
            extra: BTreeMap::new(),
        }
    }
}

pub(crate) async fn load() -> (PathBuf, Settings) {
    let path = store::settings_path();
    let settings = Store::<Settings>::new(path.clone()).load().await;
    (path, settings)
}

pub(crate) async fn save(settings: &Settings) -> std::io::Result<()> {
    Store::<Settings>::new(store::settings_path()).save(settings).await
}
