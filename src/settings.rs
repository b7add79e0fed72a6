//! Global runtime configuration (§6 `data/settings.json`).
//!
//! Grounded on `original_source/backend/settings_store.py`. `update` takes a
//! loose `serde_json::Value` patch — mirroring the Python's `Dict[str, Any]`
//! partial-update contract — so an HTTP PATCH body can be applied directly
//! without a bespoke typed-patch DTO per field.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{atomic_write_json, read_json};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub output_language: String,

    pub enable_date_context: bool,
    pub enable_web_search: bool,
    pub web_search_results: u32,

    pub enable_agent_web_search: bool,
    pub agent_web_search_results: u32,

    pub kb_retrieval_mode: String,
    pub kb_embedding_model: String,
    pub kb_enable_rerank: bool,
    pub kb_rerank_model: String,
    pub kb_semantic_pool: u32,
    pub kb_initial_k: u32,

    pub enable_preprocess: bool,
    pub enable_roundtable: bool,
    pub enable_fact_check: bool,
    pub roundtable_rounds: u32,

    pub enable_report_generation: bool,
    pub report_instructions: String,
    pub auto_save_report_to_kb: bool,
    pub auto_bind_report_to_conversation: bool,
    pub report_kb_category: String,

    pub enable_history_context: bool,
    pub history_max_messages: u32,

    pub updated_at: chrono::DateTime<Utc>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_language: "zh".to_string(),
            enable_date_context: true,
            enable_web_search: true,
            web_search_results: 5,
            enable_agent_web_search: false,
            agent_web_search_results: 3,
            kb_retrieval_mode: "hybrid".to_string(),
            kb_embedding_model: String::new(),
            kb_enable_rerank: true,
            kb_rerank_model: String::new(),
            kb_semantic_pool: 2000,
            kb_initial_k: 24,
            enable_preprocess: true,
            enable_roundtable: true,
            enable_fact_check: true,
            roundtable_rounds: 1,
            enable_report_generation: true,
            report_instructions: String::new(),
            auto_save_report_to_kb: true,
            auto_bind_report_to_conversation: true,
            report_kb_category: "council_reports".to_string(),
            enable_history_context: true,
            history_max_messages: 12,
            updated_at: Utc::now(),
        }
    }
}

fn clamp_u32(v: u32, min: u32, max: u32) -> u32 {
    v.clamp(min, max)
}

impl Settings {
    fn fill_env_defaults(&mut self, default_embedding_model: &str, default_rerank_model: &str) {
        if self.kb_embedding_model.is_empty() && !default_embedding_model.is_empty() {
            self.kb_embedding_model = default_embedding_model.to_string();
        }
        if self.kb_rerank_model.is_empty() && !default_rerank_model.is_empty() {
            self.kb_rerank_model = default_rerank_model.to_string();
        }
    }

    /// Apply a loose JSON patch, clamping/normalizing exactly the way
    /// `update_settings` does, then return the merged settings.
    fn apply_patch(&mut self, patch: &Value) {
        let obj = match patch.as_object() {
            Some(o) => o,
            None => return,
        };

        if let Some(v) = obj.get("output_language").and_then(Value::as_str) {
            match v.trim().to_lowercase().as_str() {
                "zh" | "zh-cn" | "cn" | "chinese" => self.output_language = "zh".to_string(),
                "en" | "english" => self.output_language = "en".to_string(),
                _ => {}
            }
        }
        if let Some(v) = obj.get("enable_date_context").and_then(Value::as_bool) {
            self.enable_date_context = v;
        }
        if let Some(v) = obj.get("enable_web_search").and_then(Value::as_bool) {
            self.enable_web_search = v;
        }
        if let Some(v) = obj.get("web_search_results").and_then(Value::as_u64) {
            self.web_search_results = clamp_u32(v as u32, 0, 20);
        }
        if let Some(v) = obj.get("enable_agent_web_search").and_then(Value::as_bool) {
            self.enable_agent_web_search = v;
        }
        if let Some(v) = obj.get("agent_web_search_results").and_then(Value::as_u64) {
            self.agent_web_search_results = clamp_u32(v as u32, 0, 10);
        }
        if let Some(v) = obj.get("kb_retrieval_mode").and_then(Value::as_str) {
            let v = v.trim().to_lowercase();
            if matches!(v.as_str(), "fts" | "semantic" | "hybrid") {
                self.kb_retrieval_mode = v;
            }
        }
        if let Some(v) = obj.get("kb_embedding_model").and_then(Value::as_str) {
            self.kb_embedding_model = v.trim().to_string();
        }
        if let Some(v) = obj.get("kb_enable_rerank").and_then(Value::as_bool) {
            self.kb_enable_rerank = v;
        }
        if let Some(v) = obj.get("kb_rerank_model").and_then(Value::as_str) {
            self.kb_rerank_model = v.trim().to_string();
        }
        if let Some(v) = obj.get("kb_semantic_pool").and_then(Value::as_u64) {
            self.kb_semantic_pool = clamp_u32(v as u32, 0, 10_000);
        }
        if let Some(v) = obj.get("kb_initial_k").and_then(Value::as_u64) {
            self.kb_initial_k = clamp_u32(v as u32, 1, 200);
        }
        if let Some(v) = obj.get("enable_preprocess").and_then(Value::as_bool) {
            self.enable_preprocess = v;
        }
        if let Some(v) = obj.get("enable_roundtable").and_then(Value::as_bool) {
            self.enable_roundtable = v;
        }
        if let Some(v) = obj.get("enable_fact_check").and_then(Value::as_bool) {
            self.enable_fact_check = v;
        }
        if let Some(v) = obj.get("roundtable_rounds").and_then(Value::as_u64) {
            self.roundtable_rounds = clamp_u32(v as u32, 0, 3);
        }
        self.updated_at = Utc::now();
    }
}

pub struct SettingsStore {
    path: PathBuf,
    default_embedding_model: String,
    default_rerank_model: String,
    state: RwLock<Settings>,
}

impl SettingsStore {
    pub fn load_or_init(path: &Path, default_embedding_model: String, default_rerank_model: String) -> Result<Self> {
        let mut settings = read_json::<Settings>(path)?.unwrap_or_default();
        settings.fill_env_defaults(&default_embedding_model, &default_rerank_model);
        atomic_write_json(path, &settings)?;
        Ok(Self {
            path: path.to_path_buf(),
            default_embedding_model,
            default_rerank_model,
            state: RwLock::new(settings),
        })
    }

    pub fn get(&self) -> Settings {
        self.state.read().unwrap().clone()
    }

    pub fn update(&self, patch: &Value) -> Result<Settings> {
        let mut state = self.state.write().unwrap();
        state.apply_patch(patch);
        state.fill_env_defaults(&self.default_embedding_model, &self.default_rerank_model);
        atomic_write_json(&self.path, &*state)?;
        Ok(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clamps_roundtable_rounds_to_zero_to_three() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load_or_init(&dir.path().join("settings.json"), String::new(), String::new()).unwrap();
        let updated = store.update(&json!({"roundtable_rounds": 99})).unwrap();
        assert_eq!(updated.roundtable_rounds, 3);
    }

    #[test]
    fn normalizes_output_language_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load_or_init(&dir.path().join("settings.json"), String::new(), String::new()).unwrap();
        let updated = store.update(&json!({"output_language": "English"})).unwrap();
        assert_eq!(updated.output_language, "en");
    }

    #[test]
    fn unknown_retrieval_mode_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load_or_init(&dir.path().join("settings.json"), String::new(), String::new()).unwrap();
        let updated = store.update(&json!({"kb_retrieval_mode": "bogus"})).unwrap();
        assert_eq!(updated.kb_retrieval_mode, "hybrid");
    }
}
