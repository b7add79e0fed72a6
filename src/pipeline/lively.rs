//! Stage 2B, lively-mode branch — weak-chairman free chat state machine
//! (§4.5.4).
//!
//! No direct council.py counterpart; built from SPEC_FULL.md §4.5.4 prose.
//! Leans on the same strict-JSON-with-malformed-fallback idiom as
//! `factcheck.rs` for the chairman's leader-pick/checkpoint decisions.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;

use crate::agents::AgentConfig;
use crate::conversation::{Conversation, LivelyScript, ScriptSwitchEvent};
use crate::gateway::ChatMessage;
use crate::pipeline::context::{agent_system_message, resolve_chairman, PipelineDeps};
use crate::pipeline::types::{salvage_json, LivelyAction, LivelyMessage, LlmJson, Stage1Record, Stage2BLively};
use crate::utils::truncate_text;

const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(30);
const SPEAK_TIMEOUT: Duration = Duration::from_secs(45);
const WARMUP_CHARS: usize = 120;
const OPEN_CHARS: usize = 220;

const ASSIGNMENT_CATEGORIES: [&str; 5] = ["evidence", "counter-example", "alternative", "risk boundary", "step list"];

fn checkpoint_every(agent_count: usize) -> usize {
    (agent_count + 1).clamp(4, 10)
}

#[derive(Debug, Deserialize, Default)]
struct RawLeaderPick {
    #[serde(default)]
    leaders: Vec<String>,
    #[serde(default)]
    mainline: Option<String>,
    #[serde(default)]
    assignments: std::collections::HashMap<String, String>,
    #[serde(default)]
    next_script: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

fn parse_script(s: &str) -> Option<LivelyScript> {
    match s.trim().to_lowercase().as_str() {
        "brainstorm" => Some(LivelyScript::Brainstorm),
        "interview" => Some(LivelyScript::Interview),
        "groupchat" => Some(LivelyScript::Groupchat),
        _ => None,
    }
}

fn parse_action(s: Option<&str>) -> LivelyAction {
    match s.map(str::trim) {
        Some("converge") => LivelyAction::Converge,
        _ => LivelyAction::Continue,
    }
}

struct LivelyState {
    messages: Vec<LivelyMessage>,
    script: LivelyScript,
    script_history: Vec<ScriptSwitchEvent>,
    seq: usize,
}

impl LivelyState {
    fn push(&mut self, agent: &AgentConfig, content: String, phase: &str) {
        self.messages.push(LivelyMessage {
            seq: self.seq,
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            content,
            phase: phase.to_string(),
        });
        self.seq += 1;
    }

    fn switch_script(&mut self, to: LivelyScript, reason: String) {
        if to == self.script {
            return;
        }
        self.script_history.push(ScriptSwitchEvent { at_message: self.seq, from: self.script, to, reason });
        self.script = to;
    }
}

async fn call_chairman(deps: &Arc<PipelineDeps>, conversation: &Conversation, prompt: String) -> Option<String> {
    let (_, chairman_model) = resolve_chairman(deps, conversation);
    let response = deps.gateway.chat(&chairman_model, &[ChatMessage::user(prompt)], CHECKPOINT_TIMEOUT).await;
    response.and_then(|r| r.content)
}

async fn agent_speak(
    deps: &Arc<PipelineDeps>,
    conversation: &Conversation,
    agent: &AgentConfig,
    prompt: String,
) -> Option<String> {
    let settings = deps.settings.get();
    let mut messages = Vec::new();
    if let Some(sys) = agent_system_message(agent, &settings) {
        messages.push(sys);
    }
    messages.push(ChatMessage::user(prompt));
    let response = deps.gateway.chat(&agent.model_spec, &messages, SPEAK_TIMEOUT).await;
    deps.trace
        .append(
            &conversation.id,
            "llm_call",
            serde_json::json!({"stage": "stage2b_lively", "agent_id": agent.id, "ok": response.is_some()}),
        )
        .await
        .ok();
    response.and_then(|r| r.content)
}

fn transcript_so_far(state: &LivelyState) -> String {
    if state.messages.is_empty() {
        return "（暂无发言）".to_string();
    }
    state.messages.iter().map(|m| format!("[{}] {}：{}", m.phase, m.agent_name, m.content)).collect::<Vec<_>>().join("\n")
}

pub async fn run(
    deps: &Arc<PipelineDeps>,
    agents: &[AgentConfig],
    conversation: &Conversation,
    user_query: &str,
    stage1: &[Stage1Record],
) -> Stage2BLively {
    let mut state = LivelyState {
        messages: Vec::new(),
        script: conversation.lively_script,
        script_history: conversation.lively_script_history.clone(),
        seq: 0,
    };

    if agents.is_empty() {
        return Stage2BLively { messages: Vec::new(), leaders: Vec::new(), action: LivelyAction::Converge, script_history: state.script_history };
    }

    let max_messages = conversation.lively_max_messages.max(1);
    let max_turns = conversation.lively_max_turns.max(1);
    let stage1_text =
        stage1.iter().map(|r| format!("{}：{}", r.agent_name, truncate_text(&r.response, 400))).collect::<Vec<_>>().join("\n\n");

    // 1. Warm-up: one short message per agent.
    let warmup = join_all(agents.iter().map(|agent| {
        let deps = deps.clone();
        let agent = agent.clone();
        let prompt = format!(
            "轻松自由讨论开场。原始问题：{user_query}\n\n各位初稿：\n{stage1_text}\n\n\
            请你（{}）用不超过{WARMUP_CHARS}字做一句简短开场发言，表达你的第一反应。",
            agent.name
        );
        async move { (agent.clone(), agent_speak(&deps, conversation, &agent, prompt).await) }
    }))
    .await;
    for (agent, content) in warmup {
        if state.messages.len() >= max_messages {
            break;
        }
        let Some(content) = content else { continue };
        state.push(&agent, truncate_text(content.trim(), WARMUP_CHARS), "warmup");
    }

    // 2. Leader pick.
    let pick_prompt = format!(
        "你是自由讨论的弱主持人。请阅读以下发言记录，挑选 1-3 位“意见领袖”推动讨论。\n\n\
        讨论记录：\n{}\n\n\
        只输出严格 JSON（无额外文字、无代码块围栏）：\n\
        {{\"leaders\": [\"agent_id\", ...], \"mainline\": \"可选主线说明\", \
        \"assignments\": {{\"agent_id\": \"evidence|counter-example|alternative|risk boundary|step list\"}}, \
        \"next_script\": \"brainstorm|interview|groupchat（可选）\", \"action\": \"continue|converge\"}}",
        transcript_so_far(&state)
    );
    let roster_ids: std::collections::HashSet<&str> = agents.iter().map(|a| a.id.as_str()).collect();
    let pick_raw = call_chairman(deps, conversation, pick_prompt).await;
    let pick = pick_raw.as_deref().map(salvage_json::<RawLeaderPick>).and_then(LlmJson::ok).unwrap_or_default();

    let mut leaders: Vec<String> = pick.leaders.iter().filter(|id| roster_ids.contains(id.as_str())).cloned().collect();
    leaders.dedup();
    if leaders.is_empty() {
        leaders = agents.iter().take(2.min(agents.len())).map(|a| a.id.clone()).collect();
    }
    if let Some(next) = pick.next_script.as_deref().and_then(parse_script) {
        state.switch_script(next, "chairman leader-pick directive".to_string());
    }
    if parse_action(pick.action.as_deref()) == LivelyAction::Converge || state.messages.len() >= max_messages {
        return Stage2BLively { messages: state.messages, leaders, action: LivelyAction::Converge, script_history: state.script_history };
    }

    // 3. Leaders open.
    let leader_agents: Vec<AgentConfig> = agents.iter().filter(|a| leaders.contains(&a.id)).cloned().collect();
    let opens = join_all(leader_agents.iter().map(|agent| {
        let deps = deps.clone();
        let agent = agent.clone();
        let peers: Vec<&str> = agents.iter().filter(|a| a.id != agent.id).map(|a| a.name.as_str()).take(3).collect();
        let prompt = format!(
            "你（{}）被选为本轮讨论的意见领袖之一。请用不超过{OPEN_CHARS}字给出讨论框架，并明确点名 2-3 位同行（例如：{}）请他们回应。",
            agent.name,
            peers.join("、"),
        );
        async move { (agent.clone(), agent_speak(&deps, conversation, &agent, prompt).await) }
    }))
    .await;
    for (agent, content) in opens {
        if state.messages.len() >= max_messages {
            break;
        }
        let Some(content) = content else { continue };
        state.push(&agent, truncate_text(content.trim(), OPEN_CHARS), "leader_open");
    }

    // 4. Followers respond.
    let follower_agents: Vec<AgentConfig> = agents.iter().filter(|a| !leaders.contains(&a.id)).cloned().collect();
    let followers = join_all(follower_agents.iter().map(|agent| {
        let deps = deps.clone();
        let agent = agent.clone();
        let assignment = pick
            .assignments
            .get(&agent.id)
            .cloned()
            .unwrap_or_else(|| ASSIGNMENT_CATEGORIES[agent.id.len() % ASSIGNMENT_CATEGORIES.len()].to_string());
        let transcript = transcript_so_far(&state);
        let prompt = format!(
            "讨论记录：\n{transcript}\n\n你（{}）请回应，任务类别：{assignment}。不超过{OPEN_CHARS}字，\
            不要只是附和，必须实质性贡献该类别的内容。",
            agent.name
        );
        async move { (agent.clone(), agent_speak(&deps, conversation, &agent, prompt).await) }
    }))
    .await;
    for (agent, content) in followers {
        if state.messages.len() >= max_messages {
            break;
        }
        let Some(content) = content else { continue };
        state.push(&agent, truncate_text(content.trim(), OPEN_CHARS), "follower");
    }

    // 5. Free-flow rotation with periodic chairman checkpoints.
    let checkpoint_every = checkpoint_every(agents.len());
    let mut rotation_idx = 0usize;
    let mut last_speaker: Option<String> = None;
    let mut turns = 0usize;
    let mut action = LivelyAction::Continue;

    'freeflow: while state.messages.len() < max_messages {
        let mut candidate = agents[rotation_idx % agents.len()].clone();
        let mut guard = 0;
        while Some(candidate.id.clone()) == last_speaker && guard < agents.len() {
            rotation_idx += 1;
            candidate = agents[rotation_idx % agents.len()].clone();
            guard += 1;
        }
        rotation_idx += 1;
        last_speaker = Some(candidate.id.clone());

        let transcript = transcript_so_far(&state);
        let prompt = format!(
            "讨论记录：\n{transcript}\n\n轮到你（{}）发言，风格：{:?}。不超过{OPEN_CHARS}字，推进讨论。",
            candidate.name, state.script
        );
        if let Some(content) = agent_speak(deps, conversation, &candidate, prompt).await {
            state.push(&candidate, truncate_text(content.trim(), OPEN_CHARS), "freeflow");
        }

        if state.messages.len() % checkpoint_every == 0 {
            turns += 1;
            let checkpoint_prompt = format!(
                "讨论记录：\n{}\n\n作为弱主持人，请判断是否应该收敛讨论。\n\
                只输出严格 JSON：{{\"action\": \"continue|converge\", \"next_script\": \"brainstorm|interview|groupchat（可选）\"}}",
                transcript_so_far(&state)
            );
            let raw = call_chairman(deps, conversation, checkpoint_prompt).await;
            let decision = raw.as_deref().map(salvage_json::<RawLeaderPick>).and_then(LlmJson::ok).unwrap_or_default();
            if let Some(next) = decision.next_script.as_deref().and_then(parse_script) {
                state.switch_script(next, format!("checkpoint at message {}", state.seq));
            }
            action = parse_action(decision.action.as_deref());
            if action == LivelyAction::Converge || turns >= max_turns {
                break 'freeflow;
            }
        }
    }

    Stage2BLively { messages: state.messages, leaders, action, script_history: state.script_history }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_every_is_clamped() {
        assert_eq!(checkpoint_every(1), 4);
        assert_eq!(checkpoint_every(3), 4);
        assert_eq!(checkpoint_every(20), 10);
        assert_eq!(checkpoint_every(6), 7);
    }
}
