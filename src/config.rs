//! Environment-driven configuration.
//!
//! Mirrors `original_source/backend/config.py`'s surface: every provider
//! base URL/key, the job runner's per-type defaults (§4.6), and the data
//! directory layout (§6 "Persisted state layout"). Call [`Config::from_env`]
//! once at startup after `dotenv::dotenv().ok()`.

use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub openrouter_api_key: Option<String>,
    pub openrouter_api_url: String,
    pub dashscope_api_key: Option<String>,
    pub dashscope_base_url: String,
    pub apiyi_api_key: Option<String>,
    pub apiyi_base_url: String,
    pub ollama_base_url: String,

    pub neo4j_uri: Option<String>,
    pub neo4j_user: Option<String>,
    pub neo4j_password: Option<String>,

    pub serpapi_key: Option<String>,
    pub paper_playwright_enabled: bool,

    pub kb_embedding_model: Option<String>,
    pub kb_rerank_model: Option<String>,

    pub data_dir: PathBuf,

    pub job_type_timeouts_seconds: HashMap<&'static str, u64>,
    pub job_type_concurrency: HashMap<&'static str, usize>,
    pub job_type_result_ttl_seconds: HashMap<&'static str, u64>,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("COUNCIL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));

        Self {
            openrouter_api_key: env_opt("OPENROUTER_API_KEY"),
            openrouter_api_url: std::env::var("OPENROUTER_API_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1/chat/completions".to_string()),
            dashscope_api_key: env_opt("DASHSCOPE_API_KEY"),
            dashscope_base_url: std::env::var("DASHSCOPE_BASE_URL").unwrap_or_else(|_| {
                "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
            }),
            apiyi_api_key: env_opt("APIYI_API_KEY"),
            apiyi_base_url: std::env::var("APIYI_BASE_URL")
                .unwrap_or_else(|_| "https://api.apiyi.com/v1".to_string()),
            ollama_base_url: std::env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),

            neo4j_uri: env_opt("NEO4J_URI"),
            neo4j_user: env_opt("NEO4J_USER"),
            neo4j_password: env_opt("NEO4J_PASSWORD"),

            serpapi_key: env_opt("SERPAPI_KEY"),
            paper_playwright_enabled: std::env::var("PAPER_PLAYWRIGHT_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),

            kb_embedding_model: env_opt("KB_EMBEDDING_MODEL"),
            kb_rerank_model: env_opt("KB_RERANK_MODEL"),

            data_dir,

            job_type_timeouts_seconds: HashMap::from([
                ("kg_extract", 1800),
                ("kb_index", 1200),
                ("office_ingest", 600),
                ("web_search", 300),
                ("evidence_pack", 480),
                ("paper_search", 300),
            ]),
            job_type_concurrency: HashMap::from([
                ("kg_extract", 1),
                ("kb_index", 1),
                ("office_ingest", 1),
                ("web_search", 2),
                ("evidence_pack", 2),
                ("paper_search", 2),
            ]),
            job_type_result_ttl_seconds: HashMap::from([
                ("web_search", 300),
                ("evidence_pack", 600),
                ("paper_search", 600),
            ]),
        }
    }

    pub fn agents_file(&self) -> PathBuf {
        self.data_dir.join("agents.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn plugins_file(&self) -> PathBuf {
        self.data_dir.join("plugins.json")
    }

    pub fn traces_dir(&self) -> PathBuf {
        self.data_dir.join("traces")
    }

    pub fn jobs_db(&self) -> PathBuf {
        self.data_dir.join("jobs.sqlite")
    }

    pub fn kb_db(&self) -> PathBuf {
        self.data_dir.join("kb.sqlite")
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
