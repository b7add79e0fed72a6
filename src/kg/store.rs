//! Knowledge graph data model and out-of-scope storage interface (§3 "KG
//! entity"/"KG relation", §1 Non-goals — the graph database driver itself is
//! out of scope).
//!
//! Grounded on `original_source/backend/neo4j_store.py`'s `KGEntity`/
//! `KGRelation`/`KGChunk` dataclasses and `_stable_entity_uuid`, which is
//! identical to `kg_utils.py::stable_uuid_fallback` — both are reproduced
//! here as one function since the retrieval pack confirms they never
//! diverge.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// SHA1-based deterministic entity id, stable across extraction runs so the
/// same name+type always merges onto the same node. Used directly for real
/// entities and, by the KG extractor tool, to synthesize placeholder nodes
/// for relation endpoints the model didn't also emit as entities.
pub fn stable_entity_uuid(graph_id: &str, entity_type: &str, name: &str) -> String {
    let normalized = name.trim().to_lowercase();
    let base = format!("{graph_id}:{entity_type}:{normalized}");
    let digest = Sha1::digest(base.as_bytes());
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("ent_{}", &hex[..16])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgEntity {
    pub graph_id: String,
    pub name: String,
    pub entity_type: String,
    pub summary: String,
    pub attributes: serde_json::Value,
    pub source_entity_types: Vec<String>,
    pub created_at: String,
}

impl KgEntity {
    pub fn uuid(&self) -> String {
        stable_entity_uuid(&self.graph_id, &self.entity_type, &self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgRelation {
    pub graph_id: String,
    pub uuid: String,
    pub source_uuid: String,
    pub target_uuid: String,
    pub relation_name: String,
    pub fact: String,
    pub attributes: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgChunk {
    pub graph_id: String,
    pub chunk_id: String,
    pub text_preview: String,
    pub kb_doc_id: String,
    pub kb_chunk_id: String,
    pub source: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgNode {
    pub id: String,
    pub label: String,
    pub entity_type: String,
    pub summary: String,
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub label: String,
    pub fact: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KgGraphData {
    pub nodes: Vec<KgNode>,
    pub edges: Vec<KgEdge>,
}

/// The real deployment backs this with Neo4j (`neo4j_store.py`); a genuine
/// graph database driver is out of scope here (§1), so only the contract
/// is specified. `upsert_chunk`/`link_mentions` let a caller attach
/// provenance without depending on any particular driver's session API.
#[async_trait]
pub trait KnowledgeGraphStore: Send + Sync {
    async fn create_graph(&self, name: &str, agent_id: &str) -> anyhow::Result<String>;
    async fn upsert_entities(&self, entities: &[KgEntity]) -> anyhow::Result<Vec<String>>;
    async fn upsert_relations(&self, relations: &[KgRelation]) -> anyhow::Result<()>;
    async fn upsert_chunk(&self, chunk: &KgChunk) -> anyhow::Result<()>;
    async fn link_mentions(&self, graph_id: &str, chunk_id: &str, entity_uuids: &[String]) -> anyhow::Result<()>;
    async fn graph_data(&self, graph_id: &str, limit: usize) -> anyhow::Result<KgGraphData>;
}

/// Reference implementation for tests and the CLI demo.
#[derive(Default)]
pub struct InMemoryKnowledgeGraphStore {
    entities: RwLock<HashMap<String, KgEntity>>,
    relations: RwLock<HashMap<String, KgRelation>>,
    chunks: RwLock<HashMap<(String, String), KgChunk>>,
    mentions: RwLock<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl KnowledgeGraphStore for InMemoryKnowledgeGraphStore {
    async fn create_graph(&self, _name: &str, _agent_id: &str) -> anyhow::Result<String> {
        Ok(format!("kg_{}", uuid::Uuid::new_v4().simple()))
    }

    async fn upsert_entities(&self, entities: &[KgEntity]) -> anyhow::Result<Vec<String>> {
        let mut store = self.entities.write().unwrap();
        let mut uuids = Vec::with_capacity(entities.len());
        for e in entities {
            let uuid = e.uuid();
            store.insert(uuid.clone(), e.clone());
            uuids.push(uuid);
        }
        Ok(uuids)
    }

    async fn upsert_relations(&self, relations: &[KgRelation]) -> anyhow::Result<()> {
        let mut store = self.relations.write().unwrap();
        for r in relations {
            let key = if r.uuid.is_empty() {
                format!("rel_{}", uuid::Uuid::new_v4().simple())
            } else {
                r.uuid.clone()
            };
            store.insert(key, r.clone());
        }
        Ok(())
    }

    async fn upsert_chunk(&self, chunk: &KgChunk) -> anyhow::Result<()> {
        self.chunks
            .write()
            .unwrap()
            .insert((chunk.graph_id.clone(), chunk.chunk_id.clone()), chunk.clone());
        Ok(())
    }

    async fn link_mentions(&self, _graph_id: &str, chunk_id: &str, entity_uuids: &[String]) -> anyhow::Result<()> {
        self.mentions
            .write()
            .unwrap()
            .entry(chunk_id.to_string())
            .or_default()
            .extend(entity_uuids.iter().cloned());
        Ok(())
    }

    async fn graph_data(&self, graph_id: &str, limit: usize) -> anyhow::Result<KgGraphData> {
        let entities = self.entities.read().unwrap();
        let relations = self.relations.read().unwrap();
        let nodes: Vec<KgNode> = entities
            .values()
            .filter(|e| e.graph_id == graph_id)
            .take(limit)
            .map(|e| KgNode {
                id: e.uuid(),
                label: e.name.clone(),
                entity_type: e.entity_type.clone(),
                summary: e.summary.clone(),
                attributes: e.attributes.clone(),
            })
            .collect();
        let edges: Vec<KgEdge> = relations
            .values()
            .filter(|r| r.graph_id == graph_id)
            .take(limit)
            .map(|r| KgEdge {
                id: r.uuid.clone(),
                from: r.source_uuid.clone(),
                to: r.target_uuid.clone(),
                label: r.relation_name.clone(),
                fact: r.fact.clone(),
            })
            .collect();
        Ok(KgGraphData { nodes, edges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_uuid_is_deterministic_and_case_insensitive() {
        let a = stable_entity_uuid("kg_1", "Person", "Ada Lovelace");
        let b = stable_entity_uuid("kg_1", "Person", "  ada lovelace ");
        assert_eq!(a, b);
        assert!(a.starts_with("ent_"));
        assert_eq!(a.len(), "ent_".len() + 16);
    }

    #[tokio::test]
    async fn upsert_then_graph_data_round_trips() {
        let store = InMemoryKnowledgeGraphStore::default();
        let entity = KgEntity {
            graph_id: "kg_1".to_string(),
            name: "Ada Lovelace".to_string(),
            entity_type: "Person".to_string(),
            summary: String::new(),
            attributes: serde_json::json!({}),
            source_entity_types: vec![],
            created_at: "now".to_string(),
        };
        let uuids = store.upsert_entities(&[entity]).await.unwrap();
        let data = store.graph_data("kg_1", 100).await.unwrap();
        assert_eq!(data.nodes.len(), 1);
        assert_eq!(data.nodes[0].id, uuids[0]);
    }
}
