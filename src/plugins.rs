//! Persistent tool/plugin enable + config state (§4.7, §6 `data/plugins.json`).
//!
//! Grounded on `original_source/backend/plugins_store.py`. The registry
//! rebuild that turns this into an actual [`crate::tools::ToolRegistry`]
//! lives in `tools::PluginManager`, which depends on this store rather than
//! the other way round.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{atomic_write_json, read_json};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginState {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Default for PluginState {
    fn default() -> Self {
        Self { enabled: true, config: serde_json::Map::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PluginsFile {
    #[serde(default)]
    plugins: BTreeMap<String, PluginState>,
    #[serde(default = "Utc::now")]
    updated_at: chrono::DateTime<Utc>,
}

pub struct PluginsStore {
    path: PathBuf,
    state: RwLock<PluginsFile>,
}

impl PluginsStore {
    pub fn load_or_init(path: &Path) -> Result<Self> {
        let file = read_json::<PluginsFile>(path)?.unwrap_or_default();
        Ok(Self { path: path.to_path_buf(), state: RwLock::new(file) })
    }

    pub fn all(&self) -> BTreeMap<String, PluginState> {
        self.state.read().unwrap().plugins.clone()
    }

    pub fn get(&self, name: &str) -> PluginState {
        self.state.read().unwrap().plugins.get(name).cloned().unwrap_or_default()
    }

    pub fn patch(&self, name: &str, enabled: Option<bool>, config: Option<serde_json::Map<String, Value>>) -> Result<PluginState> {
        let name = name.trim();
        if name.is_empty() {
            bail!("plugin name is empty");
        }
        let mut state = self.state.write().unwrap();
        let mut cur = state.plugins.get(name).cloned().unwrap_or_default();
        if let Some(e) = enabled {
            cur.enabled = e;
        }
        if let Some(c) = config {
            cur.config = c;
        }
        state.plugins.insert(name.to_string(), cur.clone());
        state.updated_at = Utc::now();
        atomic_write_json(&self.path, &*state)?;
        Ok(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabling_then_reloading_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        let store = PluginsStore::load_or_init(&path).unwrap();
        store.patch("web_search", Some(false), None).unwrap();

        let reopened = PluginsStore::load_or_init(&path).unwrap();
        assert!(!reopened.get("web_search").enabled);
    }

    #[test]
    fn default_state_is_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginsStore::load_or_init(&dir.path().join("plugins.json")).unwrap();
        assert!(store.get("kb_index").enabled);
    }
}
