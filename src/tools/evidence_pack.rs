//! Evidence pack job (§4.7 "evidence_pack").
//!
//! Combines a DuckDuckGo web search with an FTS-only lookup against the
//! conversation's bound KB documents (no embedding step — cheap and
//! synchronous enough to run inline with the web fetch) and returns a
//! merged, de-duplicated evidence list plus a short prose summary. Grounded
//! on `original_source/backend/job_runner.py`'s `evidence_pack` handler,
//! which runs exactly these two lookups side by side.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::jobs::store::Job;
use crate::jobs::{ProgressReporter, ToolContext};
use crate::kb::KbScope;

use super::{Tool, ToolRunOutput};

pub struct EvidencePackTool;

#[async_trait]
impl Tool for EvidencePackTool {
    fn name(&self) -> &'static str {
        "evidence_pack"
    }

    fn description(&self) -> &'static str {
        "Gather web and knowledge-base evidence for a question in one pass."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "doc_ids": {"type": "array", "items": {"type": "string"}},
                "max_web_results": {"type": "integer", "default": 5},
                "max_kb_results": {"type": "integer", "default": 5}
            },
            "required": ["query"]
        })
    }

    async fn run(&self, job: &Job, ctx: &ToolContext, progress: &ProgressReporter) -> Result<ToolRunOutput> {
        let query = job.payload["query"].as_str().context("payload.query is required")?.to_string();
        let max_web = job.payload["max_web_results"].as_u64().unwrap_or(5).min(10) as usize;
        let max_kb = job.payload["max_kb_results"].as_u64().unwrap_or(5).min(20) as usize;
        let doc_ids: Option<Vec<String>> = job.payload["doc_ids"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect());

        progress.set(0.1).await;
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36")
            .build()
            .unwrap_or_default();

        let (web_result, kb_result) = tokio::join!(
            super::web_search::search_ddg_public(&client, &query, max_web),
            ctx.kb_store.search(query.clone(), KbScope { doc_ids, ..Default::default() }, max_kb),
        );
        if ctx.is_canceled(&job.id).await {
            anyhow::bail!("job canceled");
        }
        progress.set(0.7).await;

        let web_hits: Vec<Value> = web_result
            .unwrap_or_default()
            .into_iter()
            .map(|r| json!({"kind": "web", "title": r.title, "url": r.url, "snippet": r.snippet}))
            .collect();
        let kb_hits: Vec<Value> = kb_result
            .unwrap_or_default()
            .into_iter()
            .map(|r| json!({"kind": "kb", "doc_id": r.doc_id, "title": r.title, "snippet": r.text}))
            .collect();

        progress.set(0.95).await;
        let summary = format!(
            "Gathered {} web result(s) and {} knowledge-base result(s) for '{query}'.",
            web_hits.len(),
            kb_hits.len()
        );

        let mut evidence = web_hits;
        evidence.extend(kb_hits);
        Ok(ToolRunOutput::ok(summary, json!({"query": query, "evidence": evidence})))
    }
}
