//! Knowledge-base embedding backfill job (§4.7 "kb_index").
//!
//! Thin job wrapper over [`crate::kb::HybridRetriever::index_embeddings`];
//! the real batching/backoff logic lives there, grounded on
//! `original_source/backend/kb_retrieval.py`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::jobs::store::Job;
use crate::jobs::{ProgressReporter, ToolContext};
use crate::kb::KbScope;

use super::{Tool, ToolRunOutput};

pub struct KbIndexTool;

#[async_trait]
impl Tool for KbIndexTool {
    fn name(&self) -> &'static str {
        "kb_index"
    }

    fn description(&self) -> &'static str {
        "Backfill missing chunk embeddings for a knowledge-base scope."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "doc_ids": {"type": "array", "items": {"type": "string"}},
                "embedding_model_spec": {"type": "string"}
            }
        })
    }

    async fn run(&self, job: &Job, ctx: &ToolContext, progress: &ProgressReporter) -> Result<ToolRunOutput> {
        let doc_ids: Option<Vec<String>> = job.payload["doc_ids"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect());
        let model_spec = job.payload["embedding_model_spec"]
            .as_str()
            .or(ctx.config.kb_embedding_model.as_deref())
            .unwrap_or("openrouter:text-embedding-3-small")
            .to_string();

        progress.set(0.05).await;

        // `index_embeddings`'s cancellation hook is synchronous, so a
        // background poller mirrors the job's canceled flag into an
        // `AtomicBool` the closure can read without blocking on async I/O.
        let canceled = Arc::new(AtomicBool::new(false));
        let poll_handle = {
            let canceled = canceled.clone();
            let jobs = ctx.jobs.clone();
            let job_id = job.id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    let is_canceled =
                        matches!(jobs.get(&job_id).await, Ok(Some(j)) if j.status == crate::jobs::store::JobStatus::Canceled);
                    if is_canceled {
                        canceled.store(true, Ordering::Relaxed);
                        break;
                    }
                    if canceled.load(Ordering::Relaxed) {
                        break;
                    }
                }
            })
        };
        let check_flag = canceled.clone();
        let check_cancelled: Box<dyn Fn() -> Result<()> + Send + Sync> = Box::new(move || {
            if check_flag.load(Ordering::Relaxed) {
                anyhow::bail!("job canceled");
            }
            Ok(())
        });

        let scope = KbScope { doc_ids, ..Default::default() };
        let outcome = ctx
            .retriever
            .index_embeddings(&model_spec, scope, 4096, Duration::from_secs(30), Some(check_cancelled.as_ref()))
            .await;
        canceled.store(true, Ordering::Relaxed);
        poll_handle.abort();
        let (indexed, total) = outcome?;
        ctx.retriever.bump_revision();
        progress.set(1.0).await;

        Ok(ToolRunOutput::ok(
            format!("Indexed {indexed}/{total} chunk embedding(s) with {model_spec}."),
            json!({"indexed": indexed, "total": total, "embedding_model_spec": model_spec}),
        ))
    }
}
