//! LLM-as-judge / provider-native reranker (§4.3).
//!
//! Grounded on `original_source/backend/rerank.py`. Any failure — non-chat
//! model, malformed JSON, transport error — yields `[]`; the retriever is
//! responsible for falling back to the heuristic ranking.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::gateway::{ChatMessage, Gateway, ModelSpec, Provider};
use crate::utils::truncate_text;

#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub text: String,
    pub title: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RerankScore {
    pub index: usize,
    pub score: f64,
}

pub struct Reranker {
    gateway: std::sync::Arc<Gateway>,
    dashscope_api_key: Option<String>,
    dashscope_base_url: String,
    http: reqwest::Client,
}

impl Reranker {
    pub fn new(
        gateway: std::sync::Arc<Gateway>,
        dashscope_api_key: Option<String>,
        dashscope_base_url: String,
    ) -> Self {
        Self { gateway, dashscope_api_key, dashscope_base_url, http: reqwest::Client::new() }
    }

    pub async fn rerank(
        &self,
        model_spec: &str,
        query: &str,
        candidates: &[RerankCandidate],
        top_k: usize,
        timeout: Duration,
    ) -> Vec<RerankScore> {
        let query = query.trim();
        if query.is_empty() || candidates.is_empty() {
            return Vec::new();
        }

        let top_k = top_k.max(1).min(candidates.len());
        let shown_count = candidates.len().min((top_k * 3).max(12));
        let shown = &candidates[..shown_count];

        let spec = ModelSpec::parse(model_spec);
        if spec.provider == Provider::Dashscope && spec.model.to_lowercase().contains("rerank") {
            return self.dashscope_rerank(&spec.model, query, shown, top_k, timeout).await;
        }

        let items: Vec<String> = shown
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let text = truncate_text(c.text.trim(), 800);
                let mut meta = Vec::new();
                if let Some(t) = &c.title {
                    if !t.is_empty() {
                        meta.push(format!("title={t}"));
                    }
                }
                if let Some(s) = &c.source {
                    if !s.is_empty() {
                        meta.push(format!("source={s}"));
                    }
                }
                let meta_s = if meta.is_empty() { String::new() } else { format!("; {}", meta.join("; ")) };
                format!("[{i}]{meta_s}\n{text}")
            })
            .collect();

        let system = format!(
            "You are a retrieval reranker.\n\
             Task: given the user question, pick the most relevant candidate passages and score them.\n\
             Output must be strict JSON, no markdown, no explanation.\n\
             JSON shape: {{\"ranking\":[{{\"index\":0,\"score\":0.0}}, ...]}}.\n\
             score is in [0,1], higher means more relevant.\n\
             ranking must contain exactly {top_k} entries."
        );
        let user = format!("User question:\n{query}\n\nCandidates:\n{}", items.join("\n\n"));

        let response = self
            .gateway
            .chat(
                model_spec,
                &[ChatMessage::system(system), ChatMessage::user(user)],
                timeout,
            )
            .await;

        let content = match response.and_then(|r| r.content) {
            Some(c) => c,
            None => return Vec::new(),
        };
        let data = match extract_json_object(&content) {
            Some(d) => d,
            None => return Vec::new(),
        };

        #[derive(Deserialize)]
        struct RankingItem {
            index: Value,
            score: Value,
        }
        #[derive(Deserialize)]
        struct RankingBody {
            ranking: Vec<RankingItem>,
        }

        let parsed: Option<RankingBody> = serde_json::from_value(data).ok();
        let Some(parsed) = parsed else { return Vec::new() };

        let mut out: Vec<RerankScore> = parsed
            .ranking
            .iter()
            .filter_map(|item| {
                let index = item.index.as_i64().or_else(|| item.index.as_f64().map(|f| f as i64))?;
                let score = item.score.as_f64()?;
                if index >= 0 && (index as usize) < shown.len() {
                    Some(RerankScore { index: index as usize, score: score.clamp(0.0, 1.0) })
                } else {
                    None
                }
            })
            .collect();

        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(top_k);
        out
    }

    async fn dashscope_rerank(
        &self,
        model: &str,
        query: &str,
        candidates: &[RerankCandidate],
        top_k: usize,
        timeout: Duration,
    ) -> Vec<RerankScore> {
        let Some(api_key) = self.dashscope_api_key.as_deref().filter(|k| !k.is_empty()) else {
            return Vec::new();
        };
        let url = format!("{}/rerank", self.dashscope_base_url.trim_end_matches('/'));
        let docs: Vec<String> = candidates.iter().map(|c| truncate_text(&c.text, 1200)).collect();

        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .bearer_auth(api_key)
            .json(&serde_json::json!({
                "model": model,
                "query": query,
                "documents": docs,
                "top_n": top_k,
            }))
            .send()
            .await;
        let Ok(response) = response else { return Vec::new() };
        let Ok(response) = response.error_for_status() else { return Vec::new() };
        let Ok(data) = response.json::<Value>().await else { return Vec::new() };

        let results = data
            .get("results")
            .and_then(Value::as_array)
            .or_else(|| data.get("output").and_then(|o| o.get("results")).and_then(Value::as_array));
        let Some(results) = results else { return Vec::new() };

        let mut out: Vec<RerankScore> = results
            .iter()
            .filter_map(|r| {
                let index = r
                    .get("index")
                    .or_else(|| r.get("document_index"))
                    .and_then(Value::as_i64)?;
                let score = r
                    .get("relevance_score")
                    .or_else(|| r.get("score"))
                    .and_then(Value::as_f64)?;
                if index >= 0 && (index as usize) < candidates.len() {
                    Some(RerankScore { index: index as usize, score: score.clamp(0.0, 1.0) })
                } else {
                    None
                }
            })
            .collect();

        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(top_k.max(1).min(out.len().max(1)));
        out
    }
}

/// Salvage the first `{...}` block from free-form model output — shared
/// shape with the KG extractor's own JSON salvage parser.
pub fn extract_json_object(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_surrounded_by_prose() {
        let text = "Sure, here you go:\n{\"ranking\":[{\"index\":0,\"score\":0.9}]}\nHope that helps!";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["ranking"][0]["score"], 0.9);
    }

    #[test]
    fn returns_none_for_non_json_text() {
        assert!(extract_json_object("no braces here").is_none());
    }
}
