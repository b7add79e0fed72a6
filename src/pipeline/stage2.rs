//! Stage 2 — anonymized peer ranking (§4.5.3).
//!
//! Grounded 1:1 on `original_source/backend/council.py::stage2_collect_rankings`,
//! including the exact ranking prompt text (kept verbatim since it pins the
//! `FINAL RANKING:` sentinel [`crate::pipeline::aggregation::Ranker`] parses).

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::agents::AgentConfig;
use crate::conversation::Conversation;
use crate::gateway::ChatMessage;
use crate::pipeline::aggregation::Ranker;
use crate::pipeline::context::{agent_system_message, PipelineDeps};
use crate::pipeline::types::{LabelEntry, Stage1Record, Stage2Record};

const STAGE2_TIMEOUT: Duration = Duration::from_secs(180);

fn label_for(index: usize) -> String {
    format!("Response {}", (b'A' + index as u8) as char)
}

fn ranking_prompt(user_query: &str, labels: &[String], stage1: &[Stage1Record]) -> String {
    let responses_text = labels
        .iter()
        .zip(stage1.iter())
        .map(|(label, r)| format!("{label}:\n{}", r.response))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "你正在评估多个匿名回答，这些回答都在回答同一个问题。\n\n\
        问题：{user_query}\n\n\
        以下是不同专家的回答（已匿名，使用 Response A/B/C... 代号）：\n\n\
        {responses_text}\n\n\
        你的任务：\n\
        1. 逐个评估每个回答：指出优点、缺点、关键遗漏与潜在错误。\n\
        2. 最后在你的回答末尾给出最终排名。\n\n\
        重要要求：\n\
        - 除“最终排名”区块外，其余内容必须使用简体中文。\n\
        - 最终排名必须严格使用如下格式（为了便于机器解析，必须是英文标签）：\n\
          - 以一行 `FINAL RANKING:` 开始（全大写，带冒号）\n\
          - 然后用编号列表从好到坏列出\n\
          - 每行格式必须是：数字 + 点 + 空格 + 仅包含 `Response X`（例如：`1. Response A`）\n\
          - 排名区块不要添加任何额外解释\n\n\
        示例（你的整个输出结构应类似，评审内容用中文，排名区块用固定英文标签）：\n\n\
        Response A 对 X 的分析较完整，但遗漏了 Y...\n\
        Response B 的结论较准确，但对 Z 的解释不够深入...\n\
        Response C 覆盖面最广，论据也更充分...\n\n\
        FINAL RANKING:\n\
        1. Response C\n\
        2. Response A\n\
        3. Response B\n\n\
        现在请给出评估与最终排名："
    )
}

/// Returns the Stage2 records plus the label→agent map held until Stage3
/// completes (§3 "Label mapping"). Label order matches `stage1`'s order,
/// which §5's ordering guarantee pins to the enabled-and-selected agent
/// iteration order at the moment Stage2 starts.
pub async fn run(
    deps: &Arc<PipelineDeps>,
    agents: &[AgentConfig],
    conversation: &Conversation,
    user_query: &str,
    stage1: &[Stage1Record],
) -> (Vec<Stage2Record>, Vec<LabelEntry>) {
    deps.trace
        .append(&conversation.id, "stage_start", serde_json::json!({"stage": "stage2"}))
        .await
        .ok();

    let labels: Vec<String> = (0..stage1.len()).map(label_for).collect();
    let label_entries: Vec<LabelEntry> = labels
        .iter()
        .zip(stage1.iter())
        .map(|(label, r)| LabelEntry {
            label: label.clone(),
            agent_id: r.agent_id.clone(),
            agent_name: r.agent_name.clone(),
            model_spec: r.model_spec.clone(),
        })
        .collect();

    let prompt = ranking_prompt(user_query, &labels, stage1);
    let settings = deps.settings.get();

    let futures = agents.iter().map(|agent| {
        let deps = deps.clone();
        let conversation_id = conversation.id.clone();
        let prompt = prompt.clone();
        let agent = agent.clone();
        let settings = settings.clone();
        async move {
            let mut messages = Vec::new();
            if let Some(sys) = agent_system_message(&agent, &settings) {
                messages.push(sys);
            }
            messages.push(ChatMessage::user(prompt));

            let started = std::time::Instant::now();
            let response = deps.gateway.chat(&agent.model_spec, &messages, STAGE2_TIMEOUT).await;
            deps.trace
                .append(
                    &conversation_id,
                    "llm_call",
                    serde_json::json!({
                        "stage": "stage2",
                        "agent": {"id": agent.id, "name": agent.name, "model_spec": agent.model_spec},
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
    let mut stage2 = Vec::new();
    for (agent, content) in results {
        let Some(content) = content else { continue };
        let parsed = Ranker::dedup_labels(Ranker::parse_ranking_from_text(&content));
        stage2.push(Stage2Record {
            agent_id: agent.id,
            agent_name: agent.name,
            model_spec: agent.model_spec,
            vote_weight: agent.vote_weight(),
            ranking: content,
            parsed_ranking: parsed,
        });
    }

    deps.trace
        .append(
            &conversation.id,
            "stage_complete",
            serde_json::json!({"stage": "stage2", "agents_count": agents.len(), "ok_count": stage2.len()}),
        )
        .await
        .ok();

    (stage2, label_entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_for_generates_alphabet_sequence() {
        assert_eq!(label_for(0), "Response A");
        assert_eq!(label_for(1), "Response B");
        assert_eq!(label_for(25), "Response Z");
    }
}
