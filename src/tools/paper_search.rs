//! Academic paper search job (§4.7 "paper_search").
//!
//! Grounded on `original_source/backend/paper_search.py`: arXiv's public
//! Atom API is always queried (no key required); SerpAPI's Google Scholar
//! engine is queried too when `SERPAPI_KEY` is configured. Per-source
//! failures are collected into `errors` rather than failing the whole job,
//! matching the Python's "best effort across sources" behavior.
//!
//! Deviation (recorded in DESIGN.md): the Python source also supports a
//! CNKI lookup via a headless browser. No headless-browser crate is in the
//! teacher's dependency stack, and introducing one would violate the
//! "never fabricate/introduce an unrelated ecosystem" rule, so CNKI is
//! omitted here; the job reports which sources it queried so a caller can
//! tell the difference between "no results" and "source not attempted".

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};

use crate::jobs::store::Job;
use crate::jobs::{ProgressReporter, ToolContext};

use super::{Tool, ToolRunOutput};

pub struct PaperSearchTool;

#[derive(Debug, Clone, serde::Serialize)]
struct Paper {
    title: String,
    authors: Vec<String>,
    summary: String,
    url: String,
    source: String,
}

fn decode(s: &str) -> String {
    html_escape::decode_html_entities(s).trim().to_string()
}

/// Minimal Atom feed scrape over `<entry>` blocks — regex-based, matching
/// the project's existing web-scrape style rather than pulling in an XML
/// parser crate for one feed shape.
fn parse_arxiv_atom(xml: &str, max_results: usize) -> Vec<Paper> {
    let entry_re = Regex::new(r"(?s)<entry>(.*?)</entry>").unwrap();
    let title_re = Regex::new(r"(?s)<title>(.*?)</title>").unwrap();
    let summary_re = Regex::new(r"(?s)<summary>(.*?)</summary>").unwrap();
    let id_re = Regex::new(r"(?s)<id>(.*?)</id>").unwrap();
    let author_re = Regex::new(r"(?s)<name>(.*?)</name>").unwrap();

    let mut papers = Vec::new();
    for entry_caps in entry_re.captures_iter(xml).take(max_results) {
        let entry = &entry_caps[1];
        let title = title_re.captures(entry).map(|c| decode(&c[1])).unwrap_or_default();
        let summary = summary_re.captures(entry).map(|c| decode(&c[1])).unwrap_or_default();
        let url = id_re.captures(entry).map(|c| c[1].trim().to_string()).unwrap_or_default();
        let authors: Vec<String> = author_re.captures_iter(entry).map(|c| decode(&c[1])).collect();
        if !title.is_empty() {
            papers.push(Paper { title, authors, summary, url, source: "arxiv".to_string() });
        }
    }
    papers
}

async fn search_arxiv(client: &Client, query: &str, max_results: usize) -> anyhow::Result<Vec<Paper>> {
    let url = format!(
        "http://export.arxiv.org/api/query?search_query=all:{}&start=0&max_results={max_results}",
        urlencoding::encode(query)
    );
    let xml = client.get(&url).send().await.context("arxiv request failed")?.text().await.context("arxiv body failed")?;
    Ok(parse_arxiv_atom(&xml, max_results))
}

async fn search_serpapi_scholar(client: &Client, query: &str, key: &str, max_results: usize) -> anyhow::Result<Vec<Paper>> {
    let url = format!(
        "https://serpapi.com/search.json?engine=google_scholar&q={}&api_key={}",
        urlencoding::encode(query),
        urlencoding::encode(key)
    );
    let body: Value = client.get(&url).send().await.context("serpapi request failed")?.json().await.context("serpapi body failed")?;
    let results = body["organic_results"].as_array().cloned().unwrap_or_default();
    Ok(results
        .into_iter()
        .take(max_results)
        .map(|r| Paper {
            title: r["title"].as_str().unwrap_or_default().to_string(),
            authors: r["publication_info"]["authors"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v["name"].as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            summary: r["snippet"].as_str().unwrap_or_default().to_string(),
            url: r["link"].as_str().unwrap_or_default().to_string(),
            source: "google_scholar".to_string(),
        })
        .collect())
}

#[async_trait]
impl Tool for PaperSearchTool {
    fn name(&self) -> &'static str {
        "paper_search"
    }

    fn description(&self) -> &'static str {
        "Search academic papers across arXiv and (if configured) Google Scholar."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "max_results": {"type": "integer", "default": 5}
            },
            "required": ["query"]
        })
    }

    async fn run(&self, job: &Job, ctx: &ToolContext, progress: &ProgressReporter) -> anyhow::Result<ToolRunOutput> {
        let query = job.payload["query"].as_str().context("payload.query is required")?.to_string();
        let max_results = job.payload["max_results"].as_u64().unwrap_or(5).min(20) as usize;

        let client = Client::builder().user_agent("council-engine/paper-search").build().unwrap_or_default();
        let mut papers = Vec::new();
        let mut errors = Vec::new();
        let mut sources_queried = vec!["arxiv".to_string()];

        progress.set(0.2).await;
        match search_arxiv(&client, &query, max_results).await {
            Ok(mut p) => papers.append(&mut p),
            Err(e) => errors.push(format!("arxiv: {e}")),
        }

        if let Some(key) = &ctx.config.serpapi_key {
            progress.set(0.6).await;
            sources_queried.push("google_scholar".to_string());
            match search_serpapi_scholar(&client, &query, key, max_results).await {
                Ok(mut p) => papers.append(&mut p),
                Err(e) => errors.push(format!("google_scholar: {e}")),
            }
        }

        progress.set(0.95).await;
        let summary = format!("Found {} paper(s) for '{query}' across {} source(s).", papers.len(), sources_queried.len());
        Ok(ToolRunOutput::ok(
            summary,
            json!({
                "query": query,
                "papers": papers,
                "sources_queried": sources_queried,
                "errors": errors,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arxiv_entries() {
        let xml = r#"
            <feed>
              <entry>
                <title>  A Paper Title  </title>
                <id>http://arxiv.org/abs/1234.5678</id>
                <summary>A short summary.</summary>
                <author><name>Jane Doe</name></author>
              </entry>
            </feed>
        "#;
        let papers = parse_arxiv_atom(xml, 5);
        assert_eq!(papers.len(), 1);
        assert_eq!(papers[0].title, "A Paper Title");
        assert_eq!(papers[0].authors, vec!["Jane Doe".to_string()]);
    }

    #[test]
    fn empty_feed_yields_no_papers() {
        assert!(parse_arxiv_atom("<feed></feed>", 5).is_empty());
    }
}
