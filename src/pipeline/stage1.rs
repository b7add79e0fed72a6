//! Stage 1 — individual agent answers (§4.5.2).
//!
//! Grounded 1:1 on `original_source/backend/council.py::stage1_collect_responses`
//! plus `_build_agent_knowledge`/`_build_realtime_context` already assembled
//! in [`crate::pipeline::context`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::agents::AgentConfig;
use crate::conversation::Conversation;
use crate::gateway::{ChatMessage, ModelSpec};
use crate::pipeline::context::{
    agent_system_message, build_agent_knowledge, build_history_digest, build_realtime_context, PipelineDeps,
};
use crate::pipeline::types::{Stage0Result, Stage1Record};

const STAGE1_TIMEOUT: Duration = Duration::from_secs(120);

fn stage0_summary_block(stage0: Option<&Stage0Result>) -> Option<String> {
    let stage0 = stage0?;
    let mut lines = vec![format!("背景摘要：{}", stage0.summary)];
    if !stage0.outline.is_empty() {
        lines.push(format!("要点：\n{}", stage0.outline.iter().map(|o| format!("- {o}")).collect::<Vec<_>>().join("\n")));
    }
    if !stage0.key_questions.is_empty() {
        lines.push(format!(
            "关键问题：\n{}",
            stage0.key_questions.iter().map(|q| format!("- {q}")).collect::<Vec<_>>().join("\n")
        ));
    }
    Some(lines.join("\n"))
}

/// Runs every agent in parallel; a `None` gateway response silently drops
/// that agent from the turn (§4.5.2 step 2). `Err` is only returned when
/// every agent drops out — it carries the sorted list of providers whose
/// API keys are known-missing, or an empty list if keys look fine and the
/// calls simply failed (council.py's two distinct error messages).
pub async fn run(
    deps: &Arc<PipelineDeps>,
    agents: &[AgentConfig],
    conversation: &Conversation,
    user_query: &str,
    stage0: Option<&Stage0Result>,
) -> Result<Vec<Stage1Record>, Vec<String>> {
    deps.trace
        .append(&conversation.id, "stage_start", serde_json::json!({"stage": "stage1"}))
        .await
        .ok();

    let settings = deps.settings.get();
    let realtime = build_realtime_context(deps, user_query, &conversation.id).await;
    let stage0_block = stage0_summary_block(stage0);
    let history = build_history_digest(conversation, &settings);

    let futures = agents.iter().map(|agent| {
        let deps = deps.clone();
        let conversation_id = conversation.id.clone();
        let user_query = user_query.to_string();
        let realtime = realtime.clone();
        let stage0_block = stage0_block.clone();
        let history = history.clone();
        let agent = agent.clone();
        async move {
            let mut messages = Vec::new();
            if let Some(sys) = agent_system_message(&agent, &settings) {
                messages.push(sys);
            }
            if !realtime.trim().is_empty() {
                messages.push(ChatMessage::system(format!("可用外部信息：\n{realtime}")));
            }
            if let Some(block) = &stage0_block {
                messages.push(ChatMessage::system(block.clone()));
            }
            let knowledge = build_agent_knowledge(&deps, &agent, &user_query, conversation, &conversation_id).await;
            if !knowledge.trim().is_empty() {
                messages.push(ChatMessage::system(knowledge));
            }
            if let Some(history) = &history {
                messages.push(ChatMessage::system(format!("此前的对话摘要：\n{history}")));
            }
            messages.push(ChatMessage::user(user_query.clone()));

            let started = std::time::Instant::now();
            let response = deps.gateway.chat(&agent.model_spec, &messages, STAGE1_TIMEOUT).await;
            deps.trace
                .append(
                    &conversation_id,
                    "llm_call",
                    serde_json::json!({
                        "stage": "stage1",
                        "agent": {"id": agent.id, "name": agent.name, "model_spec": agent.model_spec,
                                  "influence_weight": agent.influence_weight, "seniority_years": agent.seniority_years},
                        "ok": response.is_some(),
                        "duration_ms": started.elapsed().as_millis() as u64,
                    }),
                )
                .await
                .ok();
            (agent, response.and_then(|r| r.content))
        }
    });

    let results = join_all(futures).await;
    let mut stage1 = Vec::new();
    for (agent, content) in results {
        let Some(content) = content else { continue };
        stage1.push(Stage1Record {
            agent_id: agent.id,
            agent_name: agent.name,
            model_spec: agent.model_spec,
            influence_weight: agent.influence_weight,
            seniority_years: agent.seniority_years,
            response: content,
        });
    }

    deps.trace
        .append(
            &conversation.id,
            "stage_complete",
            serde_json::json!({"stage": "stage1", "agents_count": agents.len(), "ok_count": stage1.len()}),
        )
        .await
        .ok();

    if stage1.is_empty() {
        let mut missing: Vec<String> = agents
            .iter()
            .filter_map(|a| {
                let spec = ModelSpec::parse(&a.model_spec);
                matches!(deps.gateway.provider_key_configured(spec.provider), crate::gateway::KeyStatus::Missing)
                    .then(|| spec.provider.to_string())
            })
            .collect();
        missing.sort();
        missing.dedup();
        return Err(missing);
    }

    Ok(stage1)
}
