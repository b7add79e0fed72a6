//! Conversation data model and its out-of-scope storage interface (§3, §1).
//!
//! The spec treats the conversation JSON store as an external collaborator;
//! only the trait is specified here (§1, SPEC_FULL.md §11). The data model
//! itself — including the chairman mutual-exclusion invariant — is grounded
//! on `original_source/backend/storage.py::create_conversation`.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionMode {
    Serious,
    Lively,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivelyScript {
    Brainstorm,
    Interview,
    Groupchat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSwitchEvent {
    pub at_message: usize,
    pub from: LivelyScript,
    pub to: LivelyScript,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub created_at: chrono::DateTime<Utc>,
    /// Present on assistant messages produced by a council turn; carries the
    /// full stage bundle so later "collapse to summary" digesting (§4.5.2)
    /// doesn't need to re-run the pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_bundle: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: chrono::DateTime<Utc>,
    pub title: String,
    /// `None` means "all enabled agents".
    pub agent_ids: Option<Vec<String>>,
    chairman_model: String,
    chairman_agent_id: String,
    pub kb_doc_ids: Vec<String>,
    pub report_requirements: String,
    pub discussion_mode: DiscussionMode,
    pub serious_iteration_rounds: u32,
    pub lively_script: LivelyScript,
    pub lively_script_history: Vec<ScriptSwitchEvent>,
    pub lively_max_messages: usize,
    pub lively_max_turns: usize,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: String) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            title: "New Conversation".to_string(),
            agent_ids: None,
            chairman_model: String::new(),
            chairman_agent_id: String::new(),
            kb_doc_ids: Vec::new(),
            report_requirements: String::new(),
            discussion_mode: DiscussionMode::Serious,
            serious_iteration_rounds: 1,
            lively_script: LivelyScript::Groupchat,
            lively_script_history: Vec::new(),
            lively_max_messages: 24,
            lively_max_turns: 6,
            messages: Vec::new(),
        }
    }

    pub fn chairman_model(&self) -> Option<&str> {
        (!self.chairman_model.is_empty()).then_some(self.chairman_model.as_str())
    }

    pub fn chairman_agent_id(&self) -> Option<&str> {
        (!self.chairman_agent_id.is_empty()).then_some(self.chairman_agent_id.as_str())
    }

    /// Setting one chairman override clears the other — §3's invariant.
    pub fn set_chairman_model(&mut self, model: impl Into<String>) {
        self.chairman_model = model.into();
        self.chairman_agent_id.clear();
    }

    pub fn set_chairman_agent(&mut self, agent_id: impl Into<String>) {
        self.chairman_agent_id = agent_id.into();
        self.chairman_model.clear();
    }

    pub fn clear_chairman_override(&mut self) {
        self.chairman_model.clear();
        self.chairman_agent_id.clear();
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, id: String) -> anyhow::Result<Conversation>;
    async fn get(&self, id: &str) -> anyhow::Result<Option<Conversation>>;
    async fn save(&self, conversation: &Conversation) -> anyhow::Result<()>;
    async fn delete(&self, id: &str) -> anyhow::Result<bool>;
}

/// Reference implementation used by tests and the CLI demo; a real
/// deployment would back this with the out-of-scope JSON-per-file store
/// (§6 `data/conversations/{id}.json`).
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create(&self, id: String) -> anyhow::Result<Conversation> {
        let conversation = Conversation::new(id);
        self.conversations
            .write()
            .unwrap()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        Ok(self.conversations.read().unwrap().get(id).cloned())
    }

    async fn save(&self, conversation: &Conversation) -> anyhow::Result<()> {
        self.conversations
            .write()
            .unwrap()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.conversations.write().unwrap().remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_chairman_model_clears_agent_override() {
        let mut c = Conversation::new("c1".to_string());
        c.set_chairman_agent("agent-1");
        assert_eq!(c.chairman_agent_id(), Some("agent-1"));
        c.set_chairman_model("openrouter:gpt-4o");
        assert_eq!(c.chairman_agent_id(), None);
        assert_eq!(c.chairman_model(), Some("openrouter:gpt-4o"));
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryConversationStore::default();
        let conv = store.create("c1".to_string()).await.unwrap();
        assert_eq!(store.get(&conv.id).await.unwrap().unwrap().id, "c1");
        assert!(store.delete(&conv.id).await.unwrap());
        assert!(store.get(&conv.id).await.unwrap().is_none());
    }
}
