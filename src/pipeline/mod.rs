//! Top-level per-turn orchestrator — wires Stage0 through Stage4 into the
//! fixed 6-stage DAG described by §4.5, plus title generation and direct
//! invocation (§4.5.8).
//!
//! Grounded on `original_source/backend/council.py::run_council_pipeline` for
//! the stage ordering and `generate_conversation_title` for the title-call
//! shape; every sub-stage itself lives in its own module and is only
//! sequenced here.

pub mod aggregation;
pub mod chairman;
pub mod context;
pub mod factcheck;
pub mod lively;
pub mod roundtable;
pub mod stage0;
pub mod stage1;
pub mod stage2;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conversation::{Conversation, DiscussionMode};
use crate::error::PipelineError;
use crate::gateway::ChatMessage;
use crate::utils::truncate_text;

pub use context::PipelineDeps;
use context::resolve_conversation_agents;
use types::{AggregateRankingEntry, LabelEntry, Stage0Result, Stage1Record, Stage2B, Stage2CFactCheck, Stage2Record, Stage3Result, Stage4Report};

const TITLE_TIMEOUT: Duration = Duration::from_secs(30);
const TITLE_MAX_CHARS: usize = 50;
const MAX_SERIOUS_ITERATIONS: u32 = 8;

/// Everything produced by one turn of the pipeline, serialized back onto the
/// conversation's assistant message as `stage_bundle` (§3, §6's
/// `POST /conversations/{id}/message` response shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    pub stage0: Option<Stage0Result>,
    pub stage1: Vec<Stage1Record>,
    pub stage2: Vec<Stage2Record>,
    pub stage2b: Stage2B,
    pub stage2c: Option<Stage2CFactCheck>,
    pub stage3: Stage3Result,
    pub stage4: Option<Stage4Report>,
    pub metadata: TurnMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub title: String,
    pub label_to_agent: Vec<LabelEntry>,
    pub aggregate_rankings: Vec<AggregateRankingEntry>,
    pub agent_ids: Vec<String>,
    pub models: Vec<String>,
}

/// Title generation, run once per conversation the first time it receives a
/// turn (council.py's `generate_conversation_title`, asked of `title_model`
/// rather than the chairman). Falls back to `"New Conversation"` on any
/// failure, truncated to 50 chars, never blocking the rest of the turn.
async fn generate_title(deps: &Arc<PipelineDeps>, conversation: &Conversation, user_query: &str) -> String {
    let settings = deps.settings.get();
    let title_model = deps.agents_store.title_model();
    let prompt = if settings.output_language == "zh" {
        format!("请为以下用户问题生成一个不超过20个字的简短标题，只输出标题本身，不要引号或标点修饰：\n\n{user_query}")
    } else {
        format!("Generate a short title (max 8 words) for the following user question. Output only the title, no quotes:\n\n{user_query}")
    };
    let messages = vec![ChatMessage::user(prompt)];
    let response = deps.gateway.chat(&title_model, &messages, TITLE_TIMEOUT).await;
    deps.trace
        .append(&conversation.id, "llm_call", serde_json::json!({"stage": "title", "ok": response.is_some()}))
        .await
        .ok();
    response
        .and_then(|r| r.content)
        .map(|t| truncate_text(t.trim().trim_matches(|c| c == '"' || c == '\u{201c}' || c == '\u{201d}'), TITLE_MAX_CHARS))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "New Conversation".to_string())
}

fn stage2b_extra_context(stage2b: &Stage2B, stage2c: &Option<Stage2CFactCheck>) -> String {
    let mut parts = Vec::new();
    match stage2b {
        Stage2B::Roundtable(r) => {
            if !r.messages.is_empty() {
                let text = r.messages.iter().map(|m| format!("[第{}轮] {}：{}", m.round, m.agent_name, m.content)).collect::<Vec<_>>().join("\n");
                parts.push(format!("圆桌讨论记录：\n{text}"));
            }
        }
        Stage2B::Lively(l) => {
            if !l.messages.is_empty() {
                let text = l.messages.iter().map(|m| format!("[{}] {}：{}", m.phase, m.agent_name, m.content)).collect::<Vec<_>>().join("\n");
                parts.push(format!("自由讨论记录：\n{text}"));
            }
        }
        Stage2B::Skipped => {}
    }
    if let Some(fc) = stage2c {
        let claims = fc
            .claims
            .iter()
            .map(|c| format!("- [{:?}] {} (置信度 {:.2})", c.status, c.claim, c.confidence))
            .collect::<Vec<_>>()
            .join("\n");
        if !claims.is_empty() {
            parts.push(format!("事实核查：\n{claims}"));
        }
    }
    parts.join("\n\n")
}

/// Run a full deliberation turn (§4.5) against `conversation`, which is
/// mutated in place (title, bound KB docs from an auto-saved report,
/// appended assistant message) and must be persisted by the caller via
/// `ConversationStore::save`.
///
/// Returns `PipelineError::NoAgentsResponded` only when Stage1 drops every
/// agent (§4.5.2 step 3); every other optional stage degrades to `None`/
/// `Skipped` rather than failing the turn.
pub async fn run_turn(
    deps: &Arc<PipelineDeps>,
    conversation: &mut Conversation,
    user_query: &str,
) -> Result<TurnResult, PipelineError> {
    let agents = resolve_conversation_agents(&deps.agents_store, conversation);
    if agents.is_empty() {
        return Err(PipelineError::NoAgentsResponded(String::new()));
    }

    if conversation.messages.is_empty() && conversation.title == "New Conversation" {
        conversation.title = generate_title(deps, conversation, user_query).await;
    }

    let stage0 = stage0::run(deps, conversation).await;

    let stage3_rounds = match conversation.discussion_mode {
        DiscussionMode::Serious => conversation.serious_iteration_rounds.clamp(1, MAX_SERIOUS_ITERATIONS),
        DiscussionMode::Lively => 1,
    };

    let mut stage1 = Vec::new();
    let mut stage2 = Vec::new();
    let mut stage2b = Stage2B::Skipped;
    let mut stage2c = None;
    let mut stage3 = Stage3Result { model_spec: String::new(), response: String::new() };
    let mut stage4 = None;
    let mut label_to_agent = Vec::new();

    let mut iteration_query = user_query.to_string();

    for iteration in 1..=stage3_rounds {
        let result = stage1::run(deps, &agents, conversation, &iteration_query, stage0.as_ref()).await;
        stage1 = match result {
            Ok(records) => records,
            Err(missing) => return Err(PipelineError::NoAgentsResponded(missing.join(", "))),
        };

        let (records, labels) = stage2::run(deps, &agents, conversation, &iteration_query, &stage1).await;
        stage2 = records;
        label_to_agent = labels;

        let settings = deps.settings.get();
        stage2b = match conversation.discussion_mode {
            DiscussionMode::Serious if settings.enable_roundtable => {
                Stage2B::Roundtable(roundtable::run(deps, &agents, conversation, &iteration_query, &stage1).await)
            }
            DiscussionMode::Lively => {
                let result = lively::run(deps, &agents, conversation, &iteration_query, &stage1).await;
                conversation.lively_script_history = result.script_history.clone();
                Stage2B::Lively(result)
            }
            _ => Stage2B::Skipped,
        };

        stage2c = factcheck::run(deps, conversation, &iteration_query, &stage1, &stage2, &stage2b).await;

        let extra = stage2b_extra_context(&stage2b, &stage2c);
        stage3 = chairman::synthesize(deps, conversation, &iteration_query, &stage1, &stage2, &extra).await;

        // Stage0 is a once-per-turn preprocess, not per-iteration; only the
        // chairman's draft carries forward across refinement rounds.
        if iteration < stage3_rounds {
            iteration_query = if settings.output_language == "zh" {
                format!("{user_query}\n\n（以下是上一轮讨论草稿，请在此基础上继续完善）：\n{}", stage3.response)
            } else {
                format!("{user_query}\n\n(Below is the previous iteration's draft; continue to refine it):\n{}", stage3.response)
            };
        }
    }

    let settings = deps.settings.get();
    if settings.enable_report_generation {
        let title = conversation.title.clone();
        stage4 = Some(chairman::report(deps, conversation, &title, user_query, &stage3, None).await);
    }

    let aggregate_rankings = aggregation::Ranker::calculate_aggregate_rankings(&stage2, &label_to_agent);

    let stage_bundle = serde_json::json!({
        "stage0": stage0,
        "stage1": stage1,
        "stage2": stage2,
        "stage2b": stage2b,
        "stage2c": stage2c,
        "stage3": stage3,
        "stage4": stage4,
    });
    conversation.messages.push(crate::conversation::Message {
        role: "user".to_string(),
        content: user_query.to_string(),
        created_at: chrono::Utc::now(),
        stage_bundle: None,
    });
    conversation.messages.push(crate::conversation::Message {
        role: "assistant".to_string(),
        content: stage3.response.clone(),
        created_at: chrono::Utc::now(),
        stage_bundle: Some(stage_bundle),
    });

    Ok(TurnResult {
        stage0,
        stage1,
        stage2,
        stage2b,
        stage2c,
        stage3,
        stage4,
        metadata: TurnMetadata {
            title: conversation.title.clone(),
            models: agents.iter().map(|a| a.model_spec.clone()).collect(),
            agent_ids: agents.iter().map(|a| a.id.clone()).collect(),
            label_to_agent,
            aggregate_rankings,
        },
    })
}

/// Direct invocation (§4.5.8): `ask` appends a `direct` assistant message;
/// `report` runs an ad-hoc Stage4 over the latest stage bundle found in the
/// conversation's history rather than running Stage1-3 again.
pub enum DirectInvocation<'a> {
    Ask { agent_id: &'a str },
    Report { agent_id: Option<&'a str>, requirements_override: Option<&'a str> },
}

pub async fn invoke_direct(
    deps: &Arc<PipelineDeps>,
    conversation: &mut Conversation,
    invocation: DirectInvocation<'_>,
    user_query: &str,
) -> Result<TurnResult, PipelineError> {
    match invocation {
        DirectInvocation::Ask { agent_id } => {
            let agent = deps.agents_store.get(agent_id).ok_or_else(|| PipelineError::UnknownAgent(agent_id.to_string()))?;
            let content = chairman::ask(deps, conversation, &agent, user_query).await;
            let content = content.unwrap_or_else(|| "Error: agent did not respond.".to_string());

            conversation.messages.push(crate::conversation::Message {
                role: "user".to_string(),
                content: user_query.to_string(),
                created_at: chrono::Utc::now(),
                stage_bundle: None,
            });
            conversation.messages.push(crate::conversation::Message {
                role: "assistant".to_string(),
                content: content.clone(),
                created_at: chrono::Utc::now(),
                stage_bundle: Some(serde_json::json!({"direct": {"agent_id": agent.id, "model_spec": agent.model_spec, "response": content}})),
            });

            Ok(TurnResult {
                stage0: None,
                stage1: Vec::new(),
                stage2: Vec::new(),
                stage2b: Stage2B::Skipped,
                stage2c: None,
                stage3: Stage3Result { model_spec: agent.model_spec.clone(), response: content },
                stage4: None,
                metadata: TurnMetadata {
                    title: conversation.title.clone(),
                    label_to_agent: Vec::new(),
                    aggregate_rankings: Vec::new(),
                    agent_ids: vec![agent.id],
                    models: vec![agent.model_spec],
                },
            })
        }
        DirectInvocation::Report { agent_id, requirements_override } => {
            if let Some(id) = agent_id {
                let agent = deps.agents_store.get(id).ok_or_else(|| PipelineError::UnknownAgent(id.to_string()))?;
                conversation.set_chairman_agent(agent.id);
            }

            let latest_bundle = conversation
                .messages
                .iter()
                .rev()
                .find_map(|m| m.stage_bundle.as_ref());

            let stage3 = latest_bundle
                .and_then(|b| b.get("stage3"))
                .and_then(|s| serde_json::from_value::<Stage3Result>(s.clone()).ok())
                .ok_or(PipelineError::UnknownConversation)?;

            let title = conversation.title.clone();
            let stage4 = chairman::report(deps, conversation, &title, user_query, &stage3, requirements_override).await;

            conversation.messages.push(crate::conversation::Message {
                role: "assistant".to_string(),
                content: stage4.markdown.clone(),
                created_at: chrono::Utc::now(),
                stage_bundle: Some(serde_json::json!({"stage4": stage4})),
            });

            Ok(TurnResult {
                stage0: None,
                stage1: Vec::new(),
                stage2: Vec::new(),
                stage2b: Stage2B::Skipped,
                stage2c: None,
                stage3,
                metadata: TurnMetadata {
                    title: conversation.title.clone(),
                    label_to_agent: Vec::new(),
                    aggregate_rankings: Vec::new(),
                    agent_ids: Vec::new(),
                    models: vec![stage4.model_spec.clone()],
                },
                stage4: Some(stage4),
            })
        }
    }
}
