//! Stage record shapes shared across the pipeline (§3 "Stage1 record" …
//! "Aggregate ranking").

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage1Record {
    pub agent_id: String,
    pub agent_name: String,
    pub model_spec: String,
    pub influence_weight: f64,
    pub seniority_years: u32,
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2Record {
    pub agent_id: String,
    pub agent_name: String,
    pub model_spec: String,
    pub vote_weight: f64,
    pub ranking: String,
    pub parsed_ranking: Vec<String>,
}

/// `label -> {agent_id, model_spec}`, held from Stage2 start until Stage3
/// completes and returned to the caller as metadata (§3 "Label mapping").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEntry {
    pub label: String,
    pub agent_id: String,
    pub agent_name: String,
    pub model_spec: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRankingEntry {
    pub model_spec: String,
    pub average_rank: f64,
    pub votes: u32,
    pub total_vote_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Stage0Result {
    pub summary: String,
    pub outline: Vec<String>,
    pub key_questions: Vec<String>,
    pub suggested_subtasks: Vec<String>,
    pub used_docs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundtableMessage {
    pub round: u32,
    pub agent_id: String,
    pub agent_name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2BRoundtable {
    pub rounds: u32,
    pub messages: Vec<RoundtableMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivelyAction {
    Continue,
    Converge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivelyMessage {
    pub seq: usize,
    pub agent_id: String,
    pub agent_name: String,
    pub content: String,
    pub phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2BLively {
    pub messages: Vec<LivelyMessage>,
    pub leaders: Vec<String>,
    pub action: LivelyAction,
    pub script_history: Vec<crate::conversation::ScriptSwitchEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Stage2B {
    Roundtable(Stage2BRoundtable),
    Lively(Stage2BLively),
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Supported,
    Uncertain,
    Refuted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimEvidence {
    pub evidence_type: String,
    pub reference: String,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactCheckClaim {
    pub claim: String,
    pub status: ClaimStatus,
    pub evidence: Vec<ClaimEvidence>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Stage2CFactCheck {
    pub claims: Vec<FactCheckClaim>,
    pub open_questions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage3Result {
    pub model_spec: String,
    pub response: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage4Report {
    pub model_spec: String,
    pub markdown: String,
    pub saved_doc_id: Option<String>,
}

/// `null`-on-failure sum types for LLM JSON payloads that may arrive
/// wrapped in prose, per SPEC_FULL.md §9 — parsed leniently by salvaging the
/// first balanced `{...}` block, falling back to `Malformed` rather than
/// erroring the whole stage.
#[derive(Debug, Clone)]
pub enum LlmJson<T> {
    Parsed(T),
    Malformed(String),
}

impl<T> LlmJson<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            LlmJson::Parsed(v) => Some(v),
            LlmJson::Malformed(_) => None,
        }
    }
}

/// Locate the first balanced `{...}` substring and attempt to parse it as
/// `T`; real models routinely wrap JSON in prose or markdown fences.
pub fn salvage_json<T: for<'de> Deserialize<'de>>(raw: &str) -> LlmJson<T> {
    if let Ok(v) = serde_json::from_str::<T>(raw.trim()) {
        return LlmJson::Parsed(v);
    }
    let Some(start) = raw.find('{') else {
        return LlmJson::Malformed(raw.to_string());
    };
    let bytes = raw.as_bytes();
    let mut depth = 0i32;
    let mut end = None;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(end) = end else {
        return LlmJson::Malformed(raw.to_string());
    };
    match serde_json::from_str::<T>(&raw[start..=end]) {
        Ok(v) => LlmJson::Parsed(v),
        Err(_) => LlmJson::Malformed(raw.to_string()),
    }
}

pub fn raw_value_or_null(v: Option<Value>) -> Value {
    v.unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Probe {
        a: i32,
    }

    #[test]
    fn salvages_json_wrapped_in_prose() {
        let raw = "Sure, here you go:\n```json\n{\"a\": 1}\n```\nHope that helps.";
        match salvage_json::<Probe>(raw) {
            LlmJson::Parsed(p) => assert_eq!(p, Probe { a: 1 }),
            LlmJson::Malformed(_) => panic!("expected parse"),
        }
    }

    #[test]
    fn malformed_when_no_braces() {
        match salvage_json::<Probe>("no json here") {
            LlmJson::Malformed(_) => {}
            LlmJson::Parsed(_) => panic!("expected malformed"),
        }
    }
}
