//! Shared dependencies and per-turn context builders (§4.5.2 "Build a
//! message list").
//!
//! Grounded on `original_source/backend/council.py::_build_realtime_context`
//! and `_build_agent_knowledge`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tokio::sync::Semaphore;

use crate::agents::AgentConfig;
use crate::agents::AgentsStore;
use crate::config::Config;
use crate::conversation::Conversation;
use crate::gateway::Gateway;
use crate::jobs::JobStore;
use crate::kb::{HybridRetriever, KbScope, KbStore, RetrievalMode, RetrieverQuery};
use crate::kg::KnowledgeGraphStore;
use crate::settings::Settings;
use crate::tools::web_search::search_ddg_public;
use crate::trace::TraceSink;
use crate::utils::truncate_text;

/// Every collaborator a pipeline turn needs, assembled once at startup and
/// handed down by reference — mirrors §9's "global mutable state -> explicit
/// collaborators" redesign note.
pub struct PipelineDeps {
    pub config: Arc<Config>,
    pub gateway: Arc<Gateway>,
    pub retriever: Arc<HybridRetriever>,
    pub kb_store: Arc<KbStore>,
    pub kg_store: Arc<dyn KnowledgeGraphStore>,
    pub agents_store: Arc<AgentsStore>,
    pub settings: Arc<SettingsStoreHandle>,
    pub trace: Arc<TraceSink>,
    pub jobs: Arc<JobStore>,
    pub http: Client,
    /// Shared anti-abuse gate for per-agent web search (§5 "Per-agent
    /// web-search semaphore width 3"). One semaphore for the whole process,
    /// not per-turn, so concurrent turns still share the width-3 budget.
    pub agent_web_search_semaphore: Arc<Semaphore>,
}

/// Thin indirection so the pipeline reads settings through one call site
/// regardless of whether the caller passes a live `SettingsStore` or a
/// fixed snapshot (useful in tests).
pub trait SettingsStoreHandle: Send + Sync {
    fn get(&self) -> Settings;
}

impl SettingsStoreHandle for crate::settings::SettingsStore {
    fn get(&self) -> Settings {
        crate::settings::SettingsStore::get(self)
    }
}

pub struct FixedSettings(pub Settings);
impl SettingsStoreHandle for FixedSettings {
    fn get(&self) -> Settings {
        self.0.clone()
    }
}

/// Resolve the agent roster for one turn: the conversation's `agent_ids`
/// selection intersected with currently-enabled agents, falling back to all
/// enabled agents when the conversation has no selection or none of its
/// selected ids remain enabled (§4.5.2, council.py's `_get_conversation_agents`).
pub fn resolve_conversation_agents(agents_store: &AgentsStore, conversation: &Conversation) -> Vec<AgentConfig> {
    let enabled: Vec<AgentConfig> = agents_store.list().into_iter().filter(|a| a.enabled).collect();
    let Some(selected_ids) = &conversation.agent_ids else { return enabled };
    if selected_ids.is_empty() {
        return enabled;
    }
    let by_id: std::collections::HashMap<&str, &AgentConfig> = enabled.iter().map(|a| (a.id.as_str(), a)).collect();
    let selected: Vec<AgentConfig> =
        selected_ids.iter().filter_map(|id| by_id.get(id.as_str()).map(|a| (*a).clone())).collect();
    if selected.is_empty() {
        enabled
    } else {
        selected
    }
}

/// Chairman selection order (§4.5.6): conversation's `chairman_agent_id` →
/// conversation's `chairman_model` → global `chairman_model`. If no agent
/// owns the chosen spec, `None` is returned for the agent half and callers
/// fall back to an unpersona'd system message list — mirrors
/// `council.py::stage3_synthesize_final`'s `chairman_agent` resolution,
/// including its second lookup by model_spec when no agent id matched.
pub fn resolve_chairman(deps: &PipelineDeps, conversation: &Conversation) -> (Option<AgentConfig>, String) {
    if let Some(agent) = conversation.chairman_agent_id().and_then(|id| deps.agents_store.get(id)) {
        let model_spec = agent.model_spec.clone();
        return (Some(agent), model_spec);
    }
    let model_spec =
        conversation.chairman_model().map(str::to_string).unwrap_or_else(|| deps.agents_store.chairman_model());
    let agent = deps.agents_store.list().into_iter().find(|a| a.model_spec == model_spec);
    (agent, model_spec)
}

/// Persona + output-language directive, prepended to every agent call.
/// Empty when the agent has no persona and the language is unset, matching
/// `_agent_system_messages` returning `[]`.
pub fn agent_system_message(agent: &AgentConfig, settings: &Settings) -> Option<crate::gateway::ChatMessage> {
    let mut parts = Vec::new();
    let persona = agent.persona.trim();
    if !persona.is_empty() {
        parts.push(persona.to_string());
    }
    match settings.output_language.as_str() {
        "zh" => parts.push("输出要求：全程使用简体中文回答。除非用户明确要求，否则不要输出英文。".to_string()),
        "en" => parts.push("Output requirement: respond in English.".to_string()),
        _ => {}
    }
    if parts.is_empty() {
        None
    } else {
        Some(crate::gateway::ChatMessage::system(parts.join("\n\n")))
    }
}

/// Current date/time plus top-level web search hits, shared by every agent
/// in a turn (§4.5.2 "a realtime-context block").
pub async fn build_realtime_context(deps: &PipelineDeps, user_query: &str, conversation_id: &str) -> String {
    let settings = deps.settings.get();
    let mut chunks = Vec::new();

    if settings.enable_date_context {
        let now = Utc::now();
        chunks.push(format!("当前日期时间：{}", now.format("%Y-%m-%d %H:%M:%S UTC")));
    }

    if settings.enable_web_search && settings.web_search_results > 0 {
        match search_ddg_public(&deps.http, user_query, settings.web_search_results as usize).await {
            Ok(results) if !results.is_empty() => {
                deps.trace
                    .append(
                        conversation_id,
                        "web_search",
                        serde_json::json!({
                            "query": user_query,
                            "results": results.iter().map(|r| serde_json::json!({
                                "title": r.title, "url": r.url, "snippet": r.snippet,
                            })).collect::<Vec<_>>(),
                        }),
                    )
                    .await
                    .ok();
                let mut lines = vec!["网页检索结果（仅供参考，请自行甄别真伪）：".to_string()];
                for (i, r) in results.iter().enumerate() {
                    let snippet = if r.snippet.is_empty() { String::new() } else { format!(" - {}", r.snippet) };
                    lines.push(format!("{}. {} ({}){}", i + 1, r.title, r.url, snippet));
                }
                chunks.push(lines.join("\n"));
            }
            Ok(_) => {}
            Err(e) => {
                deps.trace
                    .append(conversation_id, "web_search_error", serde_json::json!({"error": e.to_string()}))
                    .await
                    .ok();
            }
        }
    }

    build_job_injection_block(deps, conversation_id).await.into_iter().for_each(|block| chunks.push(block));

    chunks.join("\n\n").trim().to_string()
}

/// Concatenate up to 4 succeeded-but-not-yet-injected job summaries for
/// this conversation, marking them injected so a later turn never replays
/// them (§4.6 "Result injection").
async fn build_job_injection_block(deps: &PipelineDeps, conversation_id: &str) -> Option<String> {
    let jobs = deps.jobs.fetch_injectable(conversation_id, 4).await.ok()?;
    if jobs.is_empty() {
        return None;
    }
    let mut lines = vec!["后台任务已完成，结果供参考：".to_string()];
    for job in jobs {
        let summary = job
            .result
            .as_ref()
            .and_then(|r| r.get("summary"))
            .and_then(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Job {} ({}) 已完成。", job.id, job.job_type));
        lines.push(format!("- [{}] {}", job.job_type, summary));
    }
    Some(lines.join("\n"))
}

/// Per-agent KB scope resolution (§4.5.2 "Per-agent KB scope resolution"):
/// conversation-bound doc ids intersected with the agent's allowlist, else
/// the agent's own doc ids, else its categories, else an agent-id filter.
pub fn resolve_agent_kb_scope(agent: &AgentConfig, conversation: &Conversation) -> KbScope {
    if !conversation.kb_doc_ids.is_empty() {
        let mut doc_ids = conversation.kb_doc_ids.clone();
        if !agent.kb_doc_ids.is_empty() {
            let allow: std::collections::HashSet<&str> = agent.kb_doc_ids.iter().map(String::as_str).collect();
            doc_ids.retain(|d| allow.contains(d.as_str()));
        }
        return KbScope { agent_id: None, doc_ids: Some(doc_ids), categories: None };
    }

    if !agent.kb_doc_ids.is_empty() {
        return KbScope { agent_id: None, doc_ids: Some(agent.kb_doc_ids.clone()), categories: None };
    }
    if !agent.kb_categories.is_empty() {
        return KbScope { agent_id: None, doc_ids: None, categories: Some(agent.kb_categories.clone()) };
    }
    KbScope { agent_id: Some(agent.id.clone()), doc_ids: None, categories: None }
}

/// KB snippets + KG subgraph scoped to one agent (§4.5.2's "the agent's
/// personal knowledge block").
pub async fn build_agent_knowledge(
    deps: &PipelineDeps,
    agent: &AgentConfig,
    user_query: &str,
    conversation: &Conversation,
    conversation_id: &str,
) -> String {
    let settings = deps.settings.get();
    let mut parts = Vec::new();

    let scope = resolve_agent_kb_scope(agent, conversation);
    let empty_doc_scope = matches!(&scope.doc_ids, Some(ids) if ids.is_empty());
    if !empty_doc_scope {
        let chairman_model = deps.agents_store.chairman_model();
        let rerank_model =
            if settings.kb_rerank_model.is_empty() { chairman_model.clone() } else { settings.kb_rerank_model.clone() };
        let query = RetrieverQuery {
            query: user_query.to_string(),
            scope: scope.clone(),
            limit: 5,
            mode: RetrievalMode::parse(&settings.kb_retrieval_mode),
            embedding_model_spec: settings.kb_embedding_model.clone(),
            enable_rerank: settings.kb_enable_rerank,
            rerank_model_spec: rerank_model,
            semantic_pool: settings.kb_semantic_pool as usize,
            initial_k: Some(settings.kb_initial_k as usize),
        };
        let hits = deps.retriever.search(query, Duration::from_secs(15)).await;
        if !hits.is_empty() {
            let mut lines = vec!["专家知识库命中：".to_string()];
            for (i, h) in hits.iter().enumerate() {
                let snippet = truncate_text(h.text.trim(), 500);
                let source = if h.source.is_empty() { String::new() } else { format!(" ({})", h.source) };
                lines.push(format!("{}. {}{}\n{}", i + 1, h.title, source, snippet));
                let mut meta = Vec::new();
                if !h.categories.is_empty() {
                    meta.push(format!("categories={}", h.categories.join(",")));
                }
                if !h.retrieval.is_empty() {
                    meta.push(format!("method={}", h.retrieval.join(",")));
                }
                if let Some(score) = h.rerank_score {
                    meta.push(format!("rerank={score:.2}"));
                }
                if !meta.is_empty() {
                    lines.push(format!("   {}", meta.join(" ")));
                }
            }
            parts.push(lines.join("\n"));
            deps.trace
                .append(
                    conversation_id,
                    "kb_hits",
                    serde_json::json!({"agent_id": agent.id, "hits": hits}),
                )
                .await
                .ok();
        }
    }

    if settings.enable_agent_web_search && settings.agent_web_search_results > 0 {
        let _permit = deps.agent_web_search_semaphore.clone().acquire_owned().await;
        match search_ddg_public(&deps.http, user_query, settings.agent_web_search_results as usize).await {
            Ok(results) if !results.is_empty() => {
                let mut lines = vec![format!("{} 的个人网页检索结果：", agent.name)];
                for (i, r) in results.iter().enumerate() {
                    let snippet = if r.snippet.is_empty() { String::new() } else { format!(" - {}", r.snippet) };
                    lines.push(format!("{}. {} ({}){}", i + 1, r.title, r.url, snippet));
                }
                parts.push(lines.join("\n"));
                deps.trace
                    .append(
                        conversation_id,
                        "web_search_agent",
                        serde_json::json!({
                            "agent_id": agent.id,
                            "query": user_query,
                            "results": results.iter().map(|r| serde_json::json!({
                                "title": r.title, "url": r.url, "snippet": r.snippet,
                            })).collect::<Vec<_>>(),
                        }),
                    )
                    .await
                    .ok();
            }
            Ok(_) => {}
            Err(e) => {
                deps.trace
                    .append(
                        conversation_id,
                        "web_search_agent",
                        serde_json::json!({"agent_id": agent.id, "query": user_query, "error": e.to_string()}),
                    )
                    .await
                    .ok();
            }
        }
    }

    if !agent.graph_id.is_empty() {
        if let Ok(sub) = deps.kg_store.graph_data(&agent.graph_id, 25).await {
            if !sub.nodes.is_empty() {
                let mut lines = vec![format!("专家知识图谱子图（graph_id={}）：", agent.graph_id), "节点：".to_string()];
                for n in sub.nodes.iter().take(25) {
                    lines.push(format!("- {} [{}]", n.label, n.entity_type));
                }
                if !sub.edges.is_empty() {
                    lines.push("关系：".to_string());
                    for e in sub.edges.iter().take(40) {
                        lines.push(format!("- {} -[{}]-> {}", e.from, e.label, e.to));
                    }
                }
                parts.push(lines.join("\n"));
                deps.trace
                    .append(
                        conversation_id,
                        "kg_subgraph",
                        serde_json::json!({"agent_id": agent.id, "graph_id": agent.graph_id, "subgraph": sub}),
                    )
                    .await
                    .ok();
            }
        }
    }

    parts.into_iter().filter(|p| !p.trim().is_empty()).collect::<Vec<_>>().join("\n\n")
}

/// Last `history_max_messages` conversation messages, assistant turns
/// collapsed to their stage3/stage4 summary (or raw content when no bundle
/// is attached) rather than the full stage bundle (§4.5.2).
pub fn build_history_digest(conversation: &Conversation, settings: &Settings) -> Option<String> {
    if !settings.enable_history_context || conversation.messages.is_empty() {
        return None;
    }
    let take = settings.history_max_messages.max(1) as usize;
    let start = conversation.messages.len().saturating_sub(take);
    let mut lines = Vec::new();
    for message in &conversation.messages[start..] {
        let content = if message.role == "assistant" {
            message
                .stage_bundle
                .as_ref()
                .and_then(|b| b.get("stage4").and_then(|s| s.get("markdown")).or_else(|| b.get("stage3").and_then(|s| s.get("response"))))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| message.content.clone())
        } else {
            message.content.clone()
        };
        lines.push(format!("[{}] {}", message.role, truncate_text(&content, 800)));
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
