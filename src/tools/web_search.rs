//! Web search job (§4.7 "web_search").
//!
//! Keeps the teacher's DuckDuckGo HTML scrape (regex over `result__snippet`/
//! `result__a`/`result__url` classes, no API key required) but reshapes the
//! call from direct `execute(params)` onto the job-based `run` contract:
//! the query comes from the job's `payload`, progress is reported through
//! [`ProgressReporter`], and the per-hit shape matches spec §4.7's
//! `[{title,url,snippet}]`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::jobs::store::Job;
use crate::jobs::{ProgressReporter, ToolContext};

use super::{Tool, ToolRunOutput};

pub struct WebSearchTool;

#[derive(Debug, Clone)]
pub(crate) struct SearchResult {
    pub(crate) title: String,
    pub(crate) snippet: String,
    pub(crate) url: String,
}

/// Shared with [`super::evidence_pack`], which runs the same DuckDuckGo
/// lookup alongside a KB search.
pub(crate) async fn search_ddg_public(client: &Client, query: &str, num_results: usize) -> Result<Vec<SearchResult>> {
    search_ddg(client, query, num_results).await
}

async fn search_ddg(client: &Client, query: &str, num_results: usize) -> Result<Vec<SearchResult>> {
    let url = format!("https://html.duckduckgo.com/html/?q={}", urlencoding::encode(query));
    debug!(%query, "searching duckduckgo");

    let response = client.get(&url).send().await.context("web search request failed")?;
    let html = response.text().await.context("web search response body failed")?;
    Ok(parse_ddg_html(&html, num_results))
}

fn parse_ddg_html(html: &str, max_results: usize) -> Vec<SearchResult> {
    let snippet_re = regex::Regex::new(r#"class="result__snippet"[^>]*>([^<]+)"#).unwrap();
    let title_re = regex::Regex::new(r#"class="result__a"[^>]*>([^<]+)"#).unwrap();
    let url_re = regex::Regex::new(r#"class="result__url"[^>]*>([^<]+)"#).unwrap();

    let snippets: Vec<_> = snippet_re.captures_iter(html).collect();
    let titles: Vec<_> = title_re.captures_iter(html).collect();
    let urls: Vec<_> = url_re.captures_iter(html).collect();

    let count = snippets.len().min(titles.len()).min(max_results);
    let mut results = Vec::with_capacity(count);
    for i in 0..count {
        let title = titles
            .get(i)
            .and_then(|c| c.get(1))
            .map(|m| html_escape::decode_html_entities(m.as_str()).to_string())
            .unwrap_or_default();
        let snippet = snippets
            .get(i)
            .and_then(|c| c.get(1))
            .map(|m| html_escape::decode_html_entities(m.as_str()).to_string())
            .unwrap_or_default();
        let url = urls.get(i).and_then(|c| c.get(1)).map(|m| m.as_str().trim().to_string()).unwrap_or_default();

        if !title.is_empty() && !snippet.is_empty() {
            results.push(SearchResult { title, snippet, url });
        }
    }
    results
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> &'static str {
        "Search the web for current information via DuckDuckGo."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query"},
                "num_results": {"type": "integer", "default": 5}
            },
            "required": ["query"]
        })
    }

    async fn run(&self, job: &Job, _ctx: &ToolContext, progress: &ProgressReporter) -> Result<ToolRunOutput> {
        let query = job.payload["query"].as_str().context("payload.query is required")?;
        let num_results = job.payload["num_results"].as_u64().unwrap_or(5).min(10) as usize;

        progress.set(0.1).await;
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36")
            .build()
            .unwrap_or_default();

        let results = search_ddg(&client, query, num_results).await?;
        progress.set(0.9).await;

        let hits: Vec<Value> =
            results.iter().map(|r| json!({"title": r.title, "url": r.url, "snippet": r.snippet})).collect();
        let summary = if results.is_empty() {
            format!("No web results found for '{query}'.")
        } else {
            format!("Found {} web result(s) for '{query}'.", results.len())
        };

        Ok(ToolRunOutput::ok(summary, json!({"query": query, "results": hits})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ddg_result_blocks() {
        let html = r#"
            <a class="result__a" href="x">Example Title</a>
            <a class="result__snippet">Example snippet text</a>
            <span class="result__url">example.com</span>
        "#;
        let results = parse_ddg_html(html, 5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Example Title");
        assert_eq!(results[0].url, "example.com");
    }

    #[test]
    fn empty_html_yields_no_results() {
        assert!(parse_ddg_html("<html></html>", 5).is_empty());
    }
}
