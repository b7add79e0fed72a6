//! Tool/plugin system (§4.7 "Tool Plugins").
//!
//! Re-shaped from the teacher's direct-call `Tool::execute(params) ->
//! ToolOutput` (`examples/ProdByBuddha-rust_agency/src/tools/mod.rs`) onto
//! spec §4.7's job-based contract: a tool receives the [`crate::jobs::Job`]
//! it is fulfilling plus shared [`crate::jobs::ToolContext`], reports
//! progress through a [`crate::jobs::ProgressReporter`], and returns a
//! [`ToolRunOutput`] that the job runner folds into the job's `result_json`.
//! `ToolRegistry` keeps the teacher's name-keyed map; `PluginManager` layers
//! [`crate::plugins::PluginsStore`] on top so a disabled tool simply isn't
//! registered for dispatch.

pub mod evidence_pack;
pub mod kb_index;
pub mod kg_extract;
pub mod office_ingest;
pub mod paper_search;
pub mod web_search;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::jobs::store::Job;
use crate::jobs::{JobRunner, ProgressReporter, ToolContext, ToolDispatch};
use crate::plugins::PluginsStore;

/// Result of a single tool run, folded verbatim into the job's
/// `result_json` as `{"ok":..., "summary":..., "data":...}` (§4.7).
#[derive(Debug, Clone)]
pub struct ToolRunOutput {
    pub ok: bool,
    pub summary: String,
    pub data: Value,
}

impl ToolRunOutput {
    pub fn ok(summary: impl Into<String>, data: Value) -> Self {
        Self { ok: true, summary: summary.into(), data }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self { ok: false, summary: summary.into(), data: Value::Null }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema for the job payload this tool expects, surfaced to
    /// clients deciding what to pass as `payload` when enqueuing.
    fn parameters_schema(&self) -> Value;

    async fn run(&self, job: &Job, ctx: &ToolContext, progress: &ProgressReporter) -> Result<ToolRunOutput>;
}

/// Name-keyed map of registered tools, mirroring the teacher's
/// `ToolRegistry` but without the LLM-facing prompt generation (no agent
/// selects a tool call here; the job's `job_type` names the tool).
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolDispatch for ToolRegistry {
    async fn dispatch(&self, job: &Job, ctx: &ToolContext, progress: &ProgressReporter) -> Result<ToolRunOutput> {
        let Some(tool) = self.get(&job.job_type) else {
            bail!("unknown job type: {}", job.job_type);
        };
        tool.run(job, ctx, progress).await
    }
}

/// Builds a [`ToolRegistry`] out of every known tool, then drops the ones
/// [`PluginsStore`] marks disabled (§4.7 "a disabled plugin is simply
/// absent from dispatch, not merely skipped at call time").
pub fn build_registry(plugins: &PluginsStore) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let candidates: Vec<Arc<dyn Tool>> = vec![
        Arc::new(web_search::WebSearchTool),
        Arc::new(evidence_pack::EvidencePackTool),
        Arc::new(kb_index::KbIndexTool),
        Arc::new(kg_extract::KgExtractTool),
        Arc::new(office_ingest::OfficeIngestTool::default()),
        Arc::new(paper_search::PaperSearchTool),
    ];
    for tool in candidates {
        if plugins.get(tool.name()).enabled {
            registry.register(tool);
        }
    }
    registry
}

/// Thin convenience wrapper pairing a freshly-built registry with the
/// runner that will execute jobs against it. Call [`PluginManager::refresh`]
/// after any `PluginsStore::patch` call to pick up the enable/disable
/// change for future jobs (already-running jobs keep their current tool).
pub struct PluginManager {
    plugins: Arc<PluginsStore>,
    registry: Arc<std::sync::RwLock<Arc<ToolRegistry>>>,
}

impl PluginManager {
    pub fn new(plugins: Arc<PluginsStore>) -> Self {
        let registry = Arc::new(build_registry(&plugins));
        Self { plugins, registry: Arc::new(std::sync::RwLock::new(registry)) }
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.read().unwrap().clone()
    }

    pub fn refresh(&self) {
        let fresh = Arc::new(build_registry(&self.plugins));
        *self.registry.write().unwrap() = fresh;
    }
}

#[async_trait]
impl ToolDispatch for PluginManager {
    async fn dispatch(&self, job: &Job, ctx: &ToolContext, progress: &ProgressReporter) -> Result<ToolRunOutput> {
        self.registry().dispatch(job, ctx, progress).await
    }
}

/// Convenience constructor matching the job runner's expected
/// `Arc<dyn ToolDispatch>` dependency.
pub fn runner_with_plugins(
    store: Arc<crate::jobs::JobStore>,
    ctx: Arc<ToolContext>,
    plugins: Arc<PluginsStore>,
) -> (JobRunner, Arc<PluginManager>) {
    let manager = Arc::new(PluginManager::new(plugins));
    let runner = JobRunner::new(store, ctx, manager.clone());
    (runner, manager)
}
