//! Office document ingestion job (§4.7 "office_ingest", §1 Non-goals — real
//! Office file parsing is out of scope; only the interface and KB-write
//! semantics are implemented here).
//!
//! Grounded on `original_source/backend/office_ingest.py`'s three-step
//! shape: extract text, deterministically replace the KB document keyed on
//! `doc_id`, optionally index embeddings and bind to a conversation. The
//! concrete [`OfficeExtractor`] is left as a trait so a real `.docx`/`.pdf`
//! parser can be plugged in without touching the job contract — the default
//! implementation treats the payload's `text` field as already-extracted
//! plain text, which is the common case when a caller has done OCR/parsing
//! upstream.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::jobs::store::Job;
use crate::jobs::{ProgressReporter, ToolContext};

use super::{Tool, ToolRunOutput};

/// Pulls plain text out of an uploaded office document. The real deployment
/// backs this with a `.docx`/`.pdf`/`.pptx` parser (out of scope here, §1);
/// this trait exists so the job contract doesn't have to change once one is
/// wired in.
#[async_trait]
pub trait OfficeExtractor: Send + Sync {
    async fn extract_text(&self, payload: &Value) -> Result<String>;
}

/// Treats `payload.text` as already-extracted plain text — the shape a
/// caller uses when OCR/parsing already happened upstream of this job.
pub struct PassthroughExtractor;

#[async_trait]
impl OfficeExtractor for PassthroughExtractor {
    async fn extract_text(&self, payload: &Value) -> Result<String> {
        match payload["text"].as_str() {
            Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
            _ => bail!("no extractable text in payload; a real office parser is out of scope (see DESIGN.md)"),
        }
    }
}

pub struct OfficeIngestTool {
    extractor: Box<dyn OfficeExtractor>,
}

impl Default for OfficeIngestTool {
    fn default() -> Self {
        Self { extractor: Box::new(PassthroughExtractor) }
    }
}

#[async_trait]
impl Tool for OfficeIngestTool {
    fn name(&self) -> &'static str {
        "office_ingest"
    }

    fn description(&self) -> &'static str {
        "Ingest an already-extracted office document into the knowledge base."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "doc_id": {"type": "string"},
                "title": {"type": "string"},
                "source": {"type": "string"},
                "text": {"type": "string"},
                "categories": {"type": "array", "items": {"type": "string"}},
                "agent_ids": {"type": "array", "items": {"type": "string"}},
                "index_embeddings": {"type": "boolean", "default": false},
                "embedding_model_spec": {"type": "string"}
            },
            "required": ["doc_id", "text"]
        })
    }

    async fn run(&self, job: &Job, ctx: &ToolContext, progress: &ProgressReporter) -> Result<ToolRunOutput> {
        let doc_id = job.payload["doc_id"].as_str().context("payload.doc_id is required")?.to_string();
        let title = job.payload["title"].as_str().unwrap_or(&doc_id).to_string();
        let source = job.payload["source"].as_str().unwrap_or("office_ingest").to_string();
        let categories: Vec<String> = job.payload["categories"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let agent_ids: Vec<String> = job.payload["agent_ids"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        progress.set(0.1).await;
        let text = self.extractor.extract_text(&job.payload).await?;
        progress.set(0.4).await;

        let chunk_count = ctx
            .kb_store
            .replace_document(doc_id.clone(), title, source, text, categories, agent_ids)
            .await?;
        ctx.retriever.bump_revision();
        progress.set(0.7).await;

        let mut indexed = 0usize;
        if job.payload["index_embeddings"].as_bool().unwrap_or(false) {
            let model_spec = job.payload["embedding_model_spec"]
                .as_str()
                .or(ctx.config.kb_embedding_model.as_deref())
                .unwrap_or("openrouter:text-embedding-3-small")
                .to_string();
            let scope = crate::kb::KbScope { doc_ids: Some(vec![doc_id.clone()]), ..Default::default() };
            let (count, _total) = ctx
                .retriever
                .index_embeddings(&model_spec, scope, 1024, std::time::Duration::from_secs(30), None)
                .await?;
            indexed = count;
        }
        progress.set(1.0).await;

        Ok(ToolRunOutput::ok(
            format!("Ingested '{doc_id}' into the knowledge base ({chunk_count} chunk(s), {indexed} embedded)."),
            json!({"doc_id": doc_id, "chunks": chunk_count, "indexed_embeddings": indexed}),
        ))
    }
}
