//! Stage 2B, serious-mode branch — bounded roundtable discussion (§4.5.4).
//!
//! No direct council.py counterpart; built from SPEC_FULL.md §4.5.4 prose in
//! the same fan-out/parallel-round shape as [`crate::pipeline::stage2`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::agents::AgentConfig;
use crate::conversation::Conversation;
use crate::gateway::ChatMessage;
use crate::pipeline::context::{agent_system_message, PipelineDeps};
use crate::pipeline::types::{RoundtableMessage, Stage1Record, Stage2BRoundtable};
use crate::utils::truncate_text;

const ROUND_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ROUNDS: u32 = 3;
const MIN_CHARS: usize = 150;
const MAX_CHARS: usize = 450;

fn round_prompt(user_query: &str, roster: &[AgentConfig], agent: &AgentConfig, stage1: &[Stage1Record], transcript: &[RoundtableMessage]) -> String {
    let peers: Vec<&str> = roster.iter().filter(|a| a.id != agent.id).map(|a| a.name.as_str()).collect();
    let stage1_text =
        stage1.iter().map(|r| format!("{}：{}", r.agent_name, truncate_text(&r.response, 600))).collect::<Vec<_>>().join("\n\n");
    let so_far = if transcript.is_empty() {
        "（本轮讨论尚未开始）".to_string()
    } else {
        transcript.iter().map(|m| format!("[第{}轮] {}：{}", m.round, m.agent_name, m.content)).collect::<Vec<_>>().join("\n")
    };

    format!(
        "圆桌讨论进行中。原始问题：{user_query}\n\n\
        各位专家的初稿：\n{stage1_text}\n\n\
        已有讨论记录：\n{so_far}\n\n\
        请你（{}）发表一轮圆桌回应，要求：\n\
        - 正文长度在 {MIN_CHARS}-{MAX_CHARS} 字之间。\n\
        - 必须明确点名至少一位同行（可选：{}）。\n\
        - 尽量引用网址或 `KB[doc_id]` 作为依据。\n\
        - 只使用简体中文，不要输出额外说明。",
        agent.name,
        peers.join("、"),
    )
}

/// Runs up to `roundtable_rounds` (`Config`'s setting, clamped `[0,3]`
/// spec-side by [`crate::settings::Settings::apply_patch`]) rounds of
/// parallel peer replies.
pub async fn run(
    deps: &Arc<PipelineDeps>,
    agents: &[AgentConfig],
    conversation: &Conversation,
    user_query: &str,
    stage1: &[Stage1Record],
) -> Stage2BRoundtable {
    let settings = deps.settings.get();
    let rounds = settings.roundtable_rounds.min(MAX_ROUNDS);
    let mut transcript: Vec<RoundtableMessage> = Vec::new();

    for round in 1..=rounds {
        let futures = agents.iter().map(|agent| {
            let deps = deps.clone();
            let conversation_id = conversation.id.clone();
            let agent = agent.clone();
            let roster = agents.to_vec();
            let stage1 = stage1.to_vec();
            let transcript_snapshot = transcript.clone();
            let user_query = user_query.to_string();
            let settings = settings.clone();
            async move {
                let prompt = round_prompt(&user_query, &roster, &agent, &stage1, &transcript_snapshot);
                let mut messages = Vec::new();
                if let Some(sys) = agent_system_message(&agent, &settings) {
                    messages.push(sys);
                }
                messages.push(ChatMessage::user(prompt));
                let response = deps.gateway.chat(&agent.model_spec, &messages, ROUND_TIMEOUT).await;
                deps.trace
                    .append(
                        &conversation_id,
                        "llm_call",
                        serde_json::json!({"stage": "stage2b_roundtable", "round": round, "agent_id": agent.id, "ok": response.is_some()}),
                    )
                    .await
                    .ok();
                (agent, response.and_then(|r| r.content))
            }
        });

        let results = join_all(futures).await;
        for (agent, content) in results {
            let Some(content) = content else { continue };
            transcript.push(RoundtableMessage {
                round,
                agent_id: agent.id,
                agent_name: agent.name,
                content: truncate_text(content.trim(), MAX_CHARS),
            });
        }
    }

    Stage2BRoundtable { rounds, messages: transcript }
}
