//! Stage 3 (synthesis), Stage 4 (report) and direct single-agent invocation
//! (§4.5.6, §4.5.7, §4.5.8).
//!
//! Grounded on `original_source/backend/council.py::stage3_synthesize_final`
//! for the Stage3 prompts and chairman-selection fallback chain; Stage4 and
//! direct invocation have no Python counterpart and are built from
//! SPEC_FULL.md §4.5.7/§4.5.8 prose in the same call shape.

use std::sync::Arc;
use std::time::Duration;

use crate::agents::AgentConfig;
use crate::conversation::Conversation;
use crate::gateway::ChatMessage;
use crate::kb::KbScope;
use crate::pipeline::context::{agent_system_message, resolve_chairman, PipelineDeps};
use crate::pipeline::types::{Stage1Record, Stage2Record, Stage3Result, Stage4Report};

const STAGE3_TIMEOUT: Duration = Duration::from_secs(240);
const STAGE4_TIMEOUT: Duration = Duration::from_secs(240);
const DIRECT_ASK_TIMEOUT: Duration = Duration::from_secs(120);

fn chairman_messages(agent: &Option<AgentConfig>, deps: &PipelineDeps, prompt: String) -> Vec<ChatMessage> {
    let settings = deps.settings.get();
    let mut messages = Vec::new();
    if let Some(agent) = agent {
        if let Some(sys) = agent_system_message(agent, &settings) {
            messages.push(sys);
        }
    }
    messages.push(ChatMessage::user(prompt));
    messages
}

/// Stage 3 — chairman synthesis over Stage1/Stage2 (and, informally,
/// Stage2B/2C text folded into the prompt by the caller when present).
pub async fn synthesize(
    deps: &Arc<PipelineDeps>,
    conversation: &Conversation,
    user_query: &str,
    stage1: &[Stage1Record],
    stage2: &[Stage2Record],
    extra_context: &str,
) -> Stage3Result {
    let (chairman_agent, chairman_spec) = resolve_chairman(deps, conversation);

    deps.trace
        .append(&conversation.id, "stage_start", serde_json::json!({"stage": "stage3", "chairman_model": chairman_spec}))
        .await
        .ok();

    let stage1_text = stage1
        .iter()
        .map(|r| {
            format!(
                "Agent: {} ({})\nModel: {}\nInfluence: {}, SeniorityYears: {}\nResponse: {}",
                r.agent_name, r.agent_id, r.model_spec, r.influence_weight, r.seniority_years, r.response
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let stage2_text = stage2
        .iter()
        .map(|r| format!("Agent: {} ({})\nModel: {}\nVoteWeight: {}\nRanking: {}", r.agent_name, r.agent_id, r.model_spec, r.vote_weight, r.ranking))
        .collect::<Vec<_>>()
        .join("\n\n");

    let settings = deps.settings.get();
    let extra = if extra_context.trim().is_empty() { String::new() } else { format!("\n\n补充材料：\n{extra_context}") };
    let prompt = if settings.output_language == "zh" {
        format!(
            "你是“专家委员会”的主席。多位专家针对同一个问题给出了各自的回答，并互相进行了评审与排名。\n\n\
            原始问题：{user_query}\n\n\
            阶段 1：各专家初稿\n{stage1_text}\n\n\
            阶段 2：互评与排名\n{stage2_text}{extra}\n\n\
            你的任务：综合以上信息，输出一份最终结论，要求：\n\
            - 准确、完整、可操作\n\
            - 明确区分事实与推断；必要时给出不确定性与风险提示\n\
            - 优先采纳被多方认可/证据更充分的观点，但也要指出少数派的关键反例\n\n\
            请直接给出最终回答（使用简体中文）："
        )
    } else {
        format!(
            "You are the Chairman of an LLM Council. Multiple agents have provided responses to a user's question, and then ranked each other's responses.\n\n\
            Original Question: {user_query}\n\n\
            STAGE 1 - Individual Responses:\n{stage1_text}\n\n\
            STAGE 2 - Peer Rankings:\n{stage2_text}{extra}\n\n\
            Your task as Chairman is to synthesize all of this information into a single, comprehensive, accurate answer to the user's original question.\n\
            Provide a clear, well-reasoned final answer that represents the council's collective wisdom:"
        )
    };

    let messages = chairman_messages(&chairman_agent, deps, prompt);
    let response = deps.gateway.chat(&chairman_spec, &messages, STAGE3_TIMEOUT).await;
    let ok = response.is_some();
    let content = response
        .and_then(|r| r.content)
        .unwrap_or_else(|| "Error: Unable to generate final synthesis.".to_string());

    deps.trace.append(&conversation.id, "stage_complete", serde_json::json!({"stage": "stage3", "ok": ok})).await.ok();

    Stage3Result { model_spec: chairman_spec, response: content }
}

/// Stage 4 — Markdown report, optionally auto-saved to the KB and bound
/// back to the conversation (§4.5.7). `title` is the conversation title
/// used for the saved document's title line.
pub async fn report(
    deps: &Arc<PipelineDeps>,
    conversation: &mut Conversation,
    title: &str,
    user_query: &str,
    stage3: &Stage3Result,
    report_requirements_override: Option<&str>,
) -> Stage4Report {
    let (chairman_agent, chairman_spec) = resolve_chairman(deps, conversation);
    let settings = deps.settings.get();

    deps.trace.append(&conversation.id, "stage_start", serde_json::json!({"stage": "stage4"})).await.ok();

    let requirements = report_requirements_override.unwrap_or(conversation.report_requirements.as_str());
    let requirements_block =
        if requirements.trim().is_empty() { String::new() } else { format!("\n\n额外报告要求：\n{requirements}") };

    let prompt = format!(
        "请将以下讨论综合成一份结构化的 Markdown 报告，包含标题、摘要、关键发现、建议与局限性。\n\n\
        原始问题：{user_query}\n\n\
        主席结论：\n{}{requirements_block}",
        stage3.response
    );

    let messages = chairman_messages(&chairman_agent, deps, prompt);
    let response = deps.gateway.chat(&chairman_spec, &messages, STAGE4_TIMEOUT).await;
    let ok = response.is_some();
    let markdown = response.and_then(|r| r.content).unwrap_or_else(|| format!("# {title}\n\n{}", stage3.response));

    let mut saved_doc_id = None;
    if settings.auto_save_report_to_kb {
        let doc_id = format!("report_{}", uuid::Uuid::new_v4().simple());
        let agent_ids: Vec<String> = conversation.agent_ids.clone().unwrap_or_default();
        if deps
            .kb_store
            .add_document(
                doc_id.clone(),
                format!("讨论报告：{title}"),
                format!("conversation:{}", conversation.id),
                markdown.clone(),
                vec![settings.report_kb_category.clone()],
                agent_ids,
            )
            .await
            .is_ok()
        {
            saved_doc_id = Some(doc_id.clone());

            if let Some(embedding_model) = (!settings.kb_embedding_model.is_empty()).then_some(settings.kb_embedding_model.as_str()) {
                let scope = KbScope { agent_id: None, doc_ids: Some(vec![doc_id.clone()]), categories: None };
                let _ = deps.retriever.index_embeddings(embedding_model, scope, 64, Duration::from_secs(60), None).await;
            }
            deps.retriever.bump_revision();

            if settings.auto_bind_report_to_conversation {
                conversation.kb_doc_ids.push(doc_id);
            }
        }
    }

    deps.trace.append(&conversation.id, "stage_complete", serde_json::json!({"stage": "stage4", "ok": ok})).await.ok();

    Stage4Report { model_spec: chairman_spec, markdown, saved_doc_id }
}

/// Direct invocation, `ask` mode (§4.5.8): a single named agent answers the
/// user message directly, no deliberation.
pub async fn ask(deps: &Arc<PipelineDeps>, conversation: &Conversation, agent: &AgentConfig, user_query: &str) -> Option<String> {
    let settings = deps.settings.get();
    let mut messages = Vec::new();
    if let Some(sys) = agent_system_message(agent, &settings) {
        messages.push(sys);
    }
    messages.push(ChatMessage::user(user_query.to_string()));
    let response = deps.gateway.chat(&agent.model_spec, &messages, DIRECT_ASK_TIMEOUT).await;
    deps.trace
        .append(&conversation.id, "llm_call", serde_json::json!({"stage": "direct_ask", "agent_id": agent.id, "ok": response.is_some()}))
        .await
        .ok();
    response.and_then(|r| r.content)
}
