//! Persistent agent roster (§3 "Agent", §6 `data/agents.json`).
//!
//! Grounded on `original_source/backend/agents_store.py`: a single JSON
//! document holding the agent list plus the global `chairman_model` /
//! `title_model` fallbacks, written with [`crate::storage::atomic_write_json`].

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::storage::{atomic_write_json, read_json};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub model_spec: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub persona: String,
    #[serde(default = "default_influence")]
    pub influence_weight: f64,
    #[serde(default)]
    pub seniority_years: u32,
    #[serde(default)]
    pub kb_doc_ids: Vec<String>,
    #[serde(default)]
    pub kb_categories: Vec<String>,
    #[serde(default)]
    pub graph_id: String,
    #[serde(default = "Utc::now")]
    pub created_at: chrono::DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_influence() -> f64 {
    1.0
}

impl AgentConfig {
    /// `max(0, influence_weight) × (1 + seniority_years/10)` — §3's vote
    /// weight contract, treated as fixed per the Open Question in §9.
    pub fn vote_weight(&self) -> f64 {
        self.influence_weight.max(0.0) * (1.0 + self.seniority_years as f64 / 10.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AgentsFile {
    agents: Vec<AgentConfig>,
    chairman_model: String,
    title_model: String,
    updated_at: chrono::DateTime<Utc>,
}

pub struct AgentsStore {
    path: PathBuf,
    default_chairman_model: String,
    default_title_model: String,
    state: RwLock<AgentsFile>,
}

impl AgentsStore {
    pub fn load_or_init(
        path: &Path,
        default_models: Vec<String>,
        default_chairman_model: String,
        default_title_model: String,
    ) -> Result<Self> {
        let existing: Option<AgentsFile> = read_json(path)?;
        let file = match existing {
            Some(f) => f,
            None => {
                let agents = default_models
                    .into_iter()
                    .enumerate()
                    .map(|(idx, spec)| AgentConfig {
                        id: format!("agent-{}", idx + 1),
                        name: format!("Agent {}", idx + 1),
                        model_spec: spec,
                        enabled: true,
                        persona: String::new(),
                        influence_weight: 1.0,
                        seniority_years: 0,
                        kb_doc_ids: Vec::new(),
                        kb_categories: Vec::new(),
                        graph_id: String::new(),
                        created_at: Utc::now(),
                    })
                    .collect();
                let file = AgentsFile {
                    agents,
                    chairman_model: default_chairman_model.clone(),
                    title_model: default_title_model.clone(),
                    updated_at: Utc::now(),
                };
                atomic_write_json(path, &file)?;
                file
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            default_chairman_model,
            default_title_model,
            state: RwLock::new(file),
        })
    }

    pub fn list(&self) -> Vec<AgentConfig> {
        self.state.read().unwrap().agents.clone()
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentConfig> {
        self.state.read().unwrap().agents.iter().find(|a| a.id == agent_id).cloned()
    }

    pub fn upsert(&self, agent: AgentConfig) -> Result<AgentConfig> {
        let mut state = self.state.write().unwrap();
        if let Some(slot) = state.agents.iter_mut().find(|a| a.id == agent.id) {
            *slot = agent.clone();
        } else {
            state.agents.push(agent.clone());
        }
        state.updated_at = Utc::now();
        atomic_write_json(&self.path, &*state)?;
        Ok(agent)
    }

    pub fn delete(&self, agent_id: &str) -> Result<bool> {
        let mut state = self.state.write().unwrap();
        let before = state.agents.len();
        state.agents.retain(|a| a.id != agent_id);
        let removed = state.agents.len() != before;
        if removed {
            state.updated_at = Utc::now();
            atomic_write_json(&self.path, &*state)?;
        }
        Ok(removed)
    }

    pub fn chairman_model(&self) -> String {
        let state = self.state.read().unwrap();
        if state.chairman_model.is_empty() {
            self.default_chairman_model.clone()
        } else {
            state.chairman_model.clone()
        }
    }

    pub fn title_model(&self) -> String {
        let state = self.state.read().unwrap();
        if state.title_model.is_empty() {
            self.default_title_model.clone()
        } else {
            state.title_model.clone()
        }
    }

    pub fn set_models(&self, chairman_model: Option<String>, title_model: Option<String>) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(m) = chairman_model {
            state.chairman_model = m;
        }
        if let Some(m) = title_model {
            state.title_model = m;
        }
        state.updated_at = Utc::now();
        atomic_write_json(&self.path, &*state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_get_preserves_list_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        let store = AgentsStore::load_or_init(
            &path,
            vec!["openrouter:gpt-4o".to_string()],
            "openrouter:gpt-4o".to_string(),
            "openrouter:gpt-4o-mini".to_string(),
        )
        .unwrap();

        let mut agent = store.get("agent-1").unwrap();
        agent.kb_doc_ids = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        store.upsert(agent.clone()).unwrap();

        let reloaded = store.get("agent-1").unwrap();
        assert_eq!(reloaded.kb_doc_ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn vote_weight_matches_spec_example() {
        let a1 = AgentConfig {
            influence_weight: 1.0,
            seniority_years: 0,
            ..blank_agent()
        };
        let a2 = AgentConfig {
            influence_weight: 2.0,
            seniority_years: 10,
            ..blank_agent()
        };
        assert_eq!(a1.vote_weight(), 1.0);
        assert_eq!(a2.vote_weight(), 4.0);
    }

    fn blank_agent() -> AgentConfig {
        AgentConfig {
            id: "a".into(),
            name: "A".into(),
            model_spec: "openrouter:gpt-4o".into(),
            enabled: true,
            persona: String::new(),
            influence_weight: 1.0,
            seniority_years: 0,
            kb_doc_ids: Vec::new(),
            kb_categories: Vec::new(),
            graph_id: String::new(),
            created_at: Utc::now(),
        }
    }
}
