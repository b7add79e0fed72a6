//! Stage 0 — optional preprocess over bound KB documents (§4.5.1).
//!
//! Has no direct council.py counterpart (the Python source never bound
//! documents to a conversation ahead of Stage1); grounded directly on
//! SPEC_FULL.md §4.5.1 prose and expressed with the same truncate/strict-JSON
//! idiom as `chairman.rs`'s fact-check call.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::conversation::Conversation;
use crate::gateway::ChatMessage;
use crate::pipeline::context::PipelineDeps;
use crate::pipeline::types::{salvage_json, LlmJson, Stage0Result};
use crate::utils::truncate_text;

const MAX_DOCS: usize = 12;
const PER_DOC_CHARS: usize = 8_000;
const TOTAL_CHARS: usize = 24_000;

#[derive(Debug, Deserialize)]
struct RawStage0 {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    outline: Vec<String>,
    #[serde(default)]
    key_questions: Vec<String>,
    #[serde(default)]
    suggested_subtasks: Vec<String>,
    #[serde(default)]
    used_docs: Vec<String>,
}

fn cap(mut items: Vec<String>, n: usize) -> Vec<String> {
    items.truncate(n);
    items
}

/// Returns `None` when preprocess isn't triggered (disabled, or the
/// conversation has no bound KB documents) or when the chairman call fails —
/// both are "nil on failure" per spec, not pipeline errors.
pub async fn run(deps: &Arc<PipelineDeps>, conversation: &Conversation) -> Option<Stage0Result> {
    let settings = deps.settings.get();
    if !settings.enable_preprocess || conversation.kb_doc_ids.is_empty() {
        return None;
    }

    deps.trace.append(&conversation.id, "stage_start", serde_json::json!({"stage": "stage0"})).await.ok();

    let mut bundle = String::new();
    let mut doc_ids = Vec::new();
    for doc_id in conversation.kb_doc_ids.iter().take(MAX_DOCS) {
        let Ok(Some(doc)) = deps.kb_store.get_document(doc_id.clone()).await else { continue };
        doc_ids.push(doc.id.clone());
        let text = truncate_text(doc.text.trim(), PER_DOC_CHARS);
        bundle.push_str(&format!("### {} ({})\n{}\n\n", doc.title, doc.id, text));
        if bundle.chars().count() >= TOTAL_CHARS {
            break;
        }
    }
    let bundle = truncate_text(&bundle, TOTAL_CHARS);
    if bundle.trim().is_empty() {
        return None;
    }

    let chairman_model = deps.agents_store.chairman_model();
    let prompt = format!(
        "你将阅读以下绑定的知识库文档，为后续的专家讨论准备背景材料。\n\n\
        文档内容：\n{bundle}\n\n\
        请只输出严格的 JSON（不要任何额外文字、不要代码块围栏），字段如下：\n\
        {{\n  \"summary\": \"不超过200字的摘要\",\n  \"outline\": [\"至多8条要点\"],\n  \
        \"key_questions\": [\"至多8个关键问题\"],\n  \"suggested_subtasks\": [\"至多8个建议子任务\"],\n  \
        \"used_docs\": [\"用到的文档ID\"]\n}}"
    );

    let messages = vec![ChatMessage::user(prompt)];
    let response = deps.gateway.chat(&chairman_model, &messages, Duration::from_secs(60)).await;

    let Some(content) = response.and_then(|r| r.content) else {
        deps.trace.append(&conversation.id, "stage_complete", serde_json::json!({"stage": "stage0", "ok": false})).await.ok();
        return None;
    };

    let result = match salvage_json::<RawStage0>(&content) {
        LlmJson::Parsed(raw) => Stage0Result {
            summary: truncate_text(&raw.summary, 200),
            outline: cap(raw.outline, 8),
            key_questions: cap(raw.key_questions, 8),
            suggested_subtasks: cap(raw.suggested_subtasks, 8),
            used_docs: if raw.used_docs.is_empty() { doc_ids } else { cap(raw.used_docs, 8) },
        },
        LlmJson::Malformed(_) => {
            deps.trace
                .append(&conversation.id, "stage_complete", serde_json::json!({"stage": "stage0", "ok": false, "reason": "malformed_json"}))
                .await
                .ok();
            return None;
        }
    };

    deps.trace.append(&conversation.id, "stage_complete", serde_json::json!({"stage": "stage0", "ok": true})).await.ok();
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_list_to_n_items() {
        let items: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(cap(items, 8).len(), 8);
    }
}
