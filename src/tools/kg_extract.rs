//! Knowledge-graph extraction job (§4.7 "kg_extract", §4.4 "KG extraction").
//!
//! Streams chunks through [`crate::kg::extract_stream`] and upserts results
//! into the configured [`crate::kg::KnowledgeGraphStore`]. Relation
//! endpoints the model named but didn't also emit as an entity are given a
//! placeholder node via [`crate::kg::stable_entity_uuid`] so every relation
//! has two resolvable endpoints, per §4.4's "dangling relation" edge case.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::jobs::store::Job;
use crate::jobs::{ProgressReporter, ToolContext};
use crate::kg::{default_ontology, extract_stream, stable_entity_uuid, KgChunk, KgEntity, KgRelation};

use super::{Tool, ToolRunOutput};

pub struct KgExtractTool;

#[async_trait]
impl Tool for KgExtractTool {
    fn name(&self) -> &'static str {
        "kg_extract"
    }

    fn description(&self) -> &'static str {
        "Extract entities and relations from a document into the knowledge graph."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "graph_id": {"type": "string"},
                "doc_id": {"type": "string"},
                "text": {"type": "string"},
                "model_spec": {"type": "string"},
                "output_language": {"type": "string", "default": "en"}
            },
            "required": ["graph_id", "doc_id", "text"]
        })
    }

    async fn run(&self, job: &Job, ctx: &ToolContext, progress: &ProgressReporter) -> Result<ToolRunOutput> {
        let graph_id = job.payload["graph_id"].as_str().context("payload.graph_id is required")?.to_string();
        let doc_id = job.payload["doc_id"].as_str().context("payload.doc_id is required")?.to_string();
        let text = job.payload["text"].as_str().context("payload.text is required")?.to_string();
        let model_spec = job.payload["model_spec"]
            .as_str()
            .unwrap_or("openrouter:anthropic/claude-3.5-sonnet")
            .to_string();
        let output_language = job.payload["output_language"].as_str().unwrap_or("en").to_string();
        let ontology = default_ontology();

        let total_len = text.chars().count().max(1);
        let mut processed = 0usize;
        let mut entity_count = 0usize;
        let mut relation_count = 0usize;

        let mut stream = Box::pin(extract_stream(
            ctx.gateway.clone(),
            model_spec,
            text,
            ontology,
            output_language,
            Duration::from_secs(60),
            1200,
            120,
        ));

        while let Some(chunk) = stream.next().await {
            if ctx.is_canceled(&job.id).await {
                anyhow::bail!("job canceled");
            }

            let chunk_id = format!("{doc_id}:{}", chunk.index);
            ctx.kg_store
                .upsert_chunk(&KgChunk {
                    graph_id: graph_id.clone(),
                    chunk_id: chunk_id.clone(),
                    text_preview: crate::utils::truncate_plain(&chunk.text, 280),
                    kb_doc_id: doc_id.clone(),
                    kb_chunk_id: chunk_id.clone(),
                    source: "kg_extract".to_string(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                })
                .await?;

            let mut known_entities = std::collections::HashMap::new();
            let entities: Vec<KgEntity> = chunk
                .entities
                .into_iter()
                .map(|e| KgEntity {
                    graph_id: graph_id.clone(),
                    name: e.name,
                    entity_type: e.entity_type,
                    summary: e.summary,
                    attributes: e.attributes,
                    source_entity_types: vec![],
                    created_at: chrono::Utc::now().to_rfc3339(),
                })
                .collect();
            for e in &entities {
                known_entities.insert((e.entity_type.clone(), e.name.trim().to_lowercase()), e.uuid());
            }

            let mut placeholders = Vec::new();
            let mut relations = Vec::with_capacity(chunk.relations.len());
            for r in chunk.relations {
                let source_key = (r.source_type.clone(), r.source.trim().to_lowercase());
                let target_key = (r.target_type.clone(), r.target.trim().to_lowercase());
                let source_uuid = known_entities.entry(source_key).or_insert_with(|| {
                    let uuid = stable_entity_uuid(&graph_id, &r.source_type, &r.source);
                    placeholders.push(KgEntity {
                        graph_id: graph_id.clone(),
                        name: r.source.clone(),
                        entity_type: r.source_type.clone(),
                        summary: String::new(),
                        attributes: json!({}),
                        source_entity_types: vec!["placeholder".to_string()],
                        created_at: chrono::Utc::now().to_rfc3339(),
                    });
                    uuid
                }).clone();
                let target_uuid = known_entities.entry(target_key).or_insert_with(|| {
                    let uuid = stable_entity_uuid(&graph_id, &r.target_type, &r.target);
                    placeholders.push(KgEntity {
                        graph_id: graph_id.clone(),
                        name: r.target.clone(),
                        entity_type: r.target_type.clone(),
                        summary: String::new(),
                        attributes: json!({}),
                        source_entity_types: vec!["placeholder".to_string()],
                        created_at: chrono::Utc::now().to_rfc3339(),
                    });
                    uuid
                }).clone();

                relations.push(KgRelation {
                    graph_id: graph_id.clone(),
                    uuid: format!("rel_{}", uuid::Uuid::new_v4().simple()),
                    source_uuid,
                    target_uuid,
                    relation_name: r.relation,
                    fact: r.fact,
                    attributes: r.attributes,
                    created_at: chrono::Utc::now().to_rfc3339(),
                });
            }

            entity_count += entities.len() + placeholders.len();
            relation_count += relations.len();

            let mut all_entities = entities;
            all_entities.extend(placeholders);
            let uuids = ctx.kg_store.upsert_entities(&all_entities).await?;
            ctx.kg_store.upsert_relations(&relations).await?;
            ctx.kg_store.link_mentions(&graph_id, &chunk_id, &uuids).await?;

            processed += chunk.text_len;
            progress.set((processed as f64 / total_len as f64).min(1.0)).await;
        }

        progress.set(1.0).await;
        Ok(ToolRunOutput::ok(
            format!("Extracted {entity_count} entit(y/ies) and {relation_count} relation(s) into {graph_id}."),
            json!({"graph_id": graph_id, "entities": entity_count, "relations": relation_count}),
        ))
    }
}
