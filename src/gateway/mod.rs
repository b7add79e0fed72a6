//! Provider-agnostic LLM Gateway (§4.1).
//!
//! Grounded on `original_source/backend/llm_client.py`'s dispatch-by-provider
//! shape, rewritten in the teacher's `OpenAICompatibleProvider`
//! (`examples/ProdByBuddha-rust_agency/src/agent/provider.rs`) idiom: a
//! single `reqwest::Client`, bearer-auth when a key is present, JSON bodies
//! built with `serde_json::json!`. Every failure — transport, HTTP ≥ 400,
//! unparseable body — collapses to `None`. The gateway never retries; that
//! is the job runner's concern (§4.6).

pub mod model_spec;

pub use model_spec::{ModelSpec, Provider};

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::config::Config;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub reasoning_details: Option<Value>,
}

/// Tri-state answer to "does this provider have credentials?" — `Unknown`
/// covers providers the gateway has no opinion about (kept for parity with
/// the spec's contract even though today every recognized provider resolves
/// to `Configured`/`Missing`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Configured,
    Missing,
    Unknown,
}

pub struct Gateway {
    config: Arc<Config>,
    client: Client,
}

impl Gateway {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config, client: Client::new() }
    }

    pub fn provider_key_configured(&self, provider: Provider) -> KeyStatus {
        let configured = match provider {
            Provider::Openrouter => self.config.openrouter_api_key.is_some(),
            Provider::Dashscope => self.config.dashscope_api_key.is_some(),
            Provider::Apiyi => self.config.apiyi_api_key.is_some(),
            Provider::Ollama => return KeyStatus::Configured,
        };
        if configured { KeyStatus::Configured } else { KeyStatus::Missing }
    }

    pub async fn chat(
        &self,
        model_spec: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Option<ChatResponse> {
        let spec = ModelSpec::parse(model_spec);
        let result = match spec.provider {
            Provider::Openrouter => {
                self.query_openai_compatible(
                    &self.config.openrouter_api_url,
                    self.config.openrouter_api_key.as_deref(),
                    &spec.model,
                    messages,
                    timeout,
                )
                .await
            }
            Provider::Dashscope => {
                let url = format!("{}/chat/completions", self.config.dashscope_base_url.trim_end_matches('/'));
                self.query_openai_compatible(
                    &url,
                    self.config.dashscope_api_key.as_deref(),
                    &spec.model,
                    messages,
                    timeout,
                )
                .await
            }
            Provider::Apiyi => {
                let url = format!("{}/chat/completions", self.config.apiyi_base_url.trim_end_matches('/'));
                self.query_openai_compatible(
                    &url,
                    self.config.apiyi_api_key.as_deref(),
                    &spec.model,
                    messages,
                    timeout,
                )
                .await
            }
            Provider::Ollama => self.query_ollama(&spec.model, messages, timeout).await,
        };
        if result.is_none() {
            warn!(provider = %spec.provider, model = %spec.model, "chat call returned null");
        }
        result
    }

    pub async fn embed(
        &self,
        model_spec: &str,
        texts: &[String],
        timeout: Duration,
    ) -> Option<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Some(Vec::new());
        }
        let spec = ModelSpec::parse(model_spec);
        let result = match spec.provider {
            Provider::Openrouter => {
                self.query_openai_compatible_embeddings(
                    "https://openrouter.ai/api/v1/embeddings",
                    self.config.openrouter_api_key.as_deref(),
                    &spec.model,
                    texts,
                    timeout,
                )
                .await
            }
            Provider::Dashscope => {
                let url = format!("{}/embeddings", self.config.dashscope_base_url.trim_end_matches('/'));
                self.query_openai_compatible_embeddings(
                    &url,
                    self.config.dashscope_api_key.as_deref(),
                    &spec.model,
                    texts,
                    timeout,
                )
                .await
            }
            Provider::Apiyi => {
                let url = format!("{}/embeddings", self.config.apiyi_base_url.trim_end_matches('/'));
                self.query_openai_compatible_embeddings(
                    &url,
                    self.config.apiyi_api_key.as_deref(),
                    &spec.model,
                    texts,
                    timeout,
                )
                .await
            }
            Provider::Ollama => self.query_ollama_embeddings(&spec.model, texts, timeout).await,
        };
        if result.is_none() {
            warn!(provider = %spec.provider, model = %spec.model, "embed call returned null");
        }
        result
    }

    async fn query_openai_compatible(
        &self,
        url: &str,
        api_key: Option<&str>,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Option<ChatResponse> {
        let mut request = self.client.post(url).timeout(timeout).json(&json!({
            "model": model,
            "messages": messages,
        }));
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.ok()?;
        let response = response.error_for_status().ok()?;
        let data: Value = response.json().await.ok()?;

        let message = data.get("choices")?.get(0)?.get("message")?;
        let content = message.get("content").and_then(|v| v.as_str()).map(str::to_string);
        let reasoning_details = message.get("reasoning_details").cloned();
        Some(ChatResponse { content, reasoning_details })
    }

    async fn query_openai_compatible_embeddings(
        &self,
        url: &str,
        api_key: Option<&str>,
        model: &str,
        texts: &[String],
        timeout: Duration,
    ) -> Option<Vec<Vec<f32>>> {
        let mut request = self.client.post(url).timeout(timeout).json(&json!({
            "model": model,
            "input": texts,
        }));
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.ok()?;
        let response = response.error_for_status().ok()?;
        let data: Value = response.json().await.ok()?;

        let mut items: Vec<&Value> = data.get("data")?.as_array()?.iter().collect();
        items.sort_by_key(|item| item.get("index").and_then(Value::as_u64).unwrap_or(0));

        let mut vectors = Vec::with_capacity(items.len());
        for item in items {
            let embedding = item.get("embedding")?.as_array()?;
            let vector: Option<Vec<f32>> = embedding.iter().map(|v| v.as_f64().map(|f| f as f32)).collect();
            vectors.push(vector?);
        }
        Some(vectors)
    }

    async fn query_ollama(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Option<ChatResponse> {
        let url = format!("{}/api/chat", self.config.ollama_base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&json!({
                "model": model,
                "messages": messages,
                "stream": false,
            }))
            .send()
            .await
            .ok()?;
        let response = response.error_for_status().ok()?;
        let data: Value = response.json().await.ok()?;
        let content = data.get("message")?.get("content").and_then(|v| v.as_str()).map(str::to_string);
        Some(ChatResponse { content, reasoning_details: None })
    }

    /// Ollama has no batch embedding endpoint; each input is a separate
    /// request, exactly as `_query_ollama_embeddings` does.
    async fn query_ollama_embeddings(
        &self,
        model: &str,
        texts: &[String],
        timeout: Duration,
    ) -> Option<Vec<Vec<f32>>> {
        let url = format!("{}/api/embeddings", self.config.ollama_base_url.trim_end_matches('/'));
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let response = self
                .client
                .post(&url)
                .timeout(timeout)
                .json(&json!({ "model": model, "prompt": text }))
                .send()
                .await
                .ok()?;
            let response = response.error_for_status().ok()?;
            let data: Value = response.json().await.ok()?;
            let embedding = data.get("embedding")?.as_array()?;
            let vector: Option<Vec<f32>> = embedding.iter().map(|v| v.as_f64().map(|f| f as f32)).collect();
            vectors.push(vector?);
        }
        Some(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_status_missing_without_env() {
        let mut config = Config::from_env();
        config.openrouter_api_key = None;
        let gw = Gateway::new(Arc::new(config));
        assert_eq!(gw.provider_key_configured(Provider::Openrouter), KeyStatus::Missing);
    }

    #[test]
    fn ollama_is_always_configured() {
        let gw = Gateway::new(Arc::new(Config::from_env()));
        assert_eq!(gw.provider_key_configured(Provider::Ollama), KeyStatus::Configured);
    }
}
