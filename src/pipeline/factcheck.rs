//! Stage 2C — optional fact-check pass (§4.5.5).
//!
//! No direct council.py counterpart; built from SPEC_FULL.md §4.5.5 prose,
//! reusing the chairman-selection + strict-JSON-with-malformed-fallback
//! idiom shared with `stage0.rs` and `lively.rs`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::conversation::Conversation;
use crate::gateway::ChatMessage;
use crate::pipeline::context::{resolve_chairman, PipelineDeps};
use crate::pipeline::types::{
    salvage_json, ClaimEvidence, ClaimStatus, FactCheckClaim, LlmJson, Stage1Record, Stage2B, Stage2CFactCheck, Stage2Record,
};

const FACTCHECK_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Deserialize)]
struct RawEvidence {
    #[serde(rename = "type", default)]
    evidence_type: String,
    #[serde(rename = "ref", default)]
    reference: String,
    #[serde(default)]
    note: String,
}

#[derive(Debug, Deserialize)]
struct RawClaim {
    claim: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    evidence: Vec<RawEvidence>,
    #[serde(default)]
    confidence: f64,
}

#[derive(Debug, Deserialize, Default)]
struct RawFactCheck {
    #[serde(default)]
    claims: Vec<RawClaim>,
    #[serde(default)]
    open_questions: Vec<String>,
}

fn parse_status(s: &str) -> ClaimStatus {
    match s.trim().to_lowercase().as_str() {
        "supported" => ClaimStatus::Supported,
        "refuted" => ClaimStatus::Refuted,
        _ => ClaimStatus::Uncertain,
    }
}

fn stage2b_summary(stage2b: &Stage2B) -> String {
    match stage2b {
        Stage2B::Roundtable(r) => r.messages.iter().map(|m| format!("{}：{}", m.agent_name, m.content)).collect::<Vec<_>>().join("\n"),
        Stage2B::Lively(l) => l.messages.iter().map(|m| format!("{}：{}", m.agent_name, m.content)).collect::<Vec<_>>().join("\n"),
        Stage2B::Skipped => String::new(),
    }
}

/// `None` when fact-check is disabled, or on any call/parse failure (§4.5.5
/// "nil on failure").
pub async fn run(
    deps: &Arc<PipelineDeps>,
    conversation: &Conversation,
    user_query: &str,
    stage1: &[Stage1Record],
    stage2: &[Stage2Record],
    stage2b: &Stage2B,
) -> Option<Stage2CFactCheck> {
    let settings = deps.settings.get();
    if !settings.enable_fact_check {
        return None;
    }

    deps.trace.append(&conversation.id, "stage_start", serde_json::json!({"stage": "stage2c"})).await.ok();

    let stage1_text = stage1.iter().map(|r| format!("{}：{}", r.agent_name, r.response)).collect::<Vec<_>>().join("\n\n");
    let stage2_text = stage2.iter().map(|r| format!("{}：{}", r.agent_name, r.ranking)).collect::<Vec<_>>().join("\n\n");
    let roundtable_text = stage2b_summary(stage2b);

    let prompt = format!(
        "请基于以下专家讨论内容做事实核查。\n\n\
        原始问题：{user_query}\n\n\
        阶段一回答：\n{stage1_text}\n\n\
        阶段二互评：\n{stage2_text}\n\n\
        圆桌/自由讨论：\n{roundtable_text}\n\n\
        请输出严格 JSON（不要额外文字、不要代码块围栏），字段：\n\
        {{\n  \"claims\": [{{\"claim\": \"string\", \"status\": \"supported|uncertain|refuted\", \
        \"evidence\": [{{\"type\": \"web|kb|other\", \"ref\": \"URL 或 KB[doc_id]\", \"note\": \"string\"}}], \
        \"confidence\": 0.0}}],\n  \"open_questions\": [\"string\"]\n}}\n\
        claims 数量应在 5 到 12 之间；web 类证据必须引用真实 URL；kb 类证据必须引用 `KB[doc_id]` 格式。"
    );

    let (_, chairman_model) = resolve_chairman(deps, conversation);
    let response = deps.gateway.chat(&chairman_model, &[ChatMessage::user(prompt)], FACTCHECK_TIMEOUT).await;
    let Some(content) = response.and_then(|r| r.content) else {
        deps.trace.append(&conversation.id, "stage_complete", serde_json::json!({"stage": "stage2c", "ok": false})).await.ok();
        return None;
    };

    let raw = match salvage_json::<RawFactCheck>(&content) {
        LlmJson::Parsed(r) => r,
        LlmJson::Malformed(_) => {
            deps.trace
                .append(&conversation.id, "stage_complete", serde_json::json!({"stage": "stage2c", "ok": false, "reason": "malformed_json"}))
                .await
                .ok();
            return None;
        }
    };

    let claims: Vec<FactCheckClaim> = raw
        .claims
        .into_iter()
        .map(|c| FactCheckClaim {
            claim: c.claim,
            status: parse_status(&c.status),
            evidence: c
                .evidence
                .into_iter()
                .map(|e| ClaimEvidence { evidence_type: e.evidence_type, reference: e.reference, note: e.note })
                .collect(),
            confidence: c.confidence.clamp(0.0, 1.0),
        })
        .collect();

    deps.trace
        .append(&conversation.id, "stage_complete", serde_json::json!({"stage": "stage2c", "ok": true, "claims_count": claims.len()}))
        .await
        .ok();

    Some(Stage2CFactCheck { claims, open_questions: raw.open_questions })
}
