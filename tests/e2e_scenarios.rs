//! End-to-end scenario tests (§8 "End-to-end scenarios").
//!
//! Each scenario wires real collaborators (`AgentsStore`, `KbStore`,
//! `JobStore`, `HybridRetriever`, ...) against a temp directory and routes
//! any LLM-bound traffic through `support::MockServer` instead of a real
//! provider. `Gateway` posts plain JSON over `reqwest`, so the mock only
//! needs to speak HTTP/1.1 — see `tests/support/mod.rs`.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use council_engine::agents::{AgentConfig, AgentsStore};
use council_engine::config::Config;
use council_engine::conversation::{Conversation, DiscussionMode};
use council_engine::error::PipelineError;
use council_engine::gateway::Gateway;
use council_engine::jobs::JobStore;
use council_engine::kb::rerank::RerankCandidate;
use council_engine::kb::{HybridRetriever, KbScope, KbStore, Reranker, RetrievalMode, RetrieverQuery};
use council_engine::kg::InMemoryKnowledgeGraphStore;
use council_engine::pipeline::context::FixedSettings;
use council_engine::pipeline::types::Stage1Record;
use council_engine::pipeline::{self, lively, PipelineDeps};
use council_engine::settings::Settings;
use council_engine::trace::TraceSink;

use support::{chat_body, embeddings_body, MockServer};

fn blank_agent(id: &str, model_spec: &str, influence_weight: f64, seniority_years: u32) -> AgentConfig {
    AgentConfig {
        id: id.to_string(),
        name: id.to_string(),
        model_spec: model_spec.to_string(),
        enabled: true,
        persona: String::new(),
        influence_weight,
        seniority_years,
        kb_doc_ids: Vec::new(),
        kb_categories: Vec::new(),
        graph_id: String::new(),
        created_at: chrono::Utc::now(),
    }
}

fn quiet_settings() -> Settings {
    Settings {
        enable_date_context: false,
        enable_web_search: false,
        enable_preprocess: false,
        enable_roundtable: false,
        enable_fact_check: false,
        enable_report_generation: false,
        kb_embedding_model: String::new(),
        kb_enable_rerank: false,
        ..Settings::default()
    }
}

/// Builds a full `PipelineDeps` against a fresh temp `data_dir`, with
/// `openrouter_api_url`/`dashscope_base_url` pointed at `mock`.
async fn build_deps(mock: &MockServer, settings: Settings, agents: &[AgentConfig], chairman_model: &str, title_model: &str) -> (tempfile::TempDir, Arc<PipelineDeps>, Arc<AgentsStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::from_env();
    config.data_dir = dir.path().to_path_buf();
    config.openrouter_api_key = Some("test-key".to_string());
    config.openrouter_api_url = format!("{}/chat/completions", mock.base_url());
    config.dashscope_api_key = Some("test-key".to_string());
    config.dashscope_base_url = mock.base_url();
    let config = Arc::new(config);

    let agents_store = Arc::new(
        AgentsStore::load_or_init(&config.agents_file(), Vec::new(), chairman_model.to_string(), title_model.to_string())
            .expect("agents store"),
    );
    for agent in agents {
        agents_store.upsert(agent.clone()).expect("upsert agent");
    }

    let gateway = Arc::new(Gateway::new(config.clone()));
    let kb_store = Arc::new(KbStore::open(config.kb_db()).await.expect("kb store"));
    let reranker = Arc::new(Reranker::new(gateway.clone(), config.dashscope_api_key.clone(), config.dashscope_base_url.clone()));
    let retriever = Arc::new(HybridRetriever::new(kb_store.clone(), gateway.clone(), reranker));
    let jobs_store = Arc::new(JobStore::open(config.jobs_db()).await.expect("jobs store"));
    let trace = Arc::new(TraceSink::new(config.traces_dir()));

    let deps = Arc::new(PipelineDeps {
        config,
        gateway,
        retriever,
        kb_store,
        kg_store: Arc::new(InMemoryKnowledgeGraphStore::default()),
        agents_store: agents_store.clone(),
        settings: Arc::new(FixedSettings(settings)),
        trace,
        jobs: jobs_store,
        http: Client::new(),
        agent_web_search_semaphore: Arc::new(tokio::sync::Semaphore::new(3)),
    });
    (dir, deps, agents_store)
}

// 1. Happy path, serious, 2 agents — aggregate ranking matches §8 scenario 1's worked example.
#[tokio::test]
async fn scenario1_happy_path_serious_two_agents() {
    let mock = MockServer::start(|_path, body: &Value| {
        let model = body.get("model").and_then(Value::as_str).unwrap_or("");
        let last_user = body
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|ms| ms.iter().rev().find(|m| m["role"] == "user"))
            .and_then(|m| m["content"].as_str())
            .unwrap_or("");
        let is_stage2 = last_user.contains("你正在评估多个匿名回答");
        match (model, is_stage2) {
            ("titler", _) => (200, chat_body("测试标题")),
            ("model-a", false) => (200, chat_body("Model A's draft answer.")),
            ("model-b", false) => (200, chat_body("Model B's draft answer.")),
            ("model-a", true) => (200, chat_body("评审...\n\nFINAL RANKING:\n1. Response A\n2. Response B")),
            ("model-b", true) => (200, chat_body("评审...\n\nFINAL RANKING:\n1. Response B\n2. Response A")),
            ("chairman", _) => (200, chat_body("Chairman synthesis: B wins overall.")),
            _ => (404, json!({"error": "unexpected request"})),
        }
    })
    .await;

    let a1 = blank_agent("a1", "openrouter:model-a", 1.0, 0);
    let a2 = blank_agent("a2", "openrouter:model-b", 2.0, 10);
    let (_dir, deps, _agents_store) =
        build_deps(&mock, quiet_settings(), &[a1, a2], "openrouter:chairman", "openrouter:titler").await;

    let mut conversation = Conversation::new("conv1".to_string());
    let turn = pipeline::run_turn(&deps, &mut conversation, "是否应该采用微服务架构？")
        .await
        .expect("turn succeeds");

    assert_eq!(turn.stage1.len(), 2);
    assert_eq!(turn.stage2.len(), 2);
    assert_eq!(turn.stage3.response, "Chairman synthesis: B wins overall.");

    let agg = &turn.metadata.aggregate_rankings;
    assert_eq!(agg.len(), 2);
    let a = agg.iter().find(|e| e.model_spec == "openrouter:model-a").unwrap();
    let b = agg.iter().find(|e| e.model_spec == "openrouter:model-b").unwrap();
    assert!((a.average_rank - 1.8).abs() < 1e-9, "a.average_rank = {}", a.average_rank);
    assert!((b.average_rank - 1.2).abs() < 1e-9, "b.average_rank = {}", b.average_rank);
    assert_eq!(agg[0].model_spec, "openrouter:model-b", "B must sort first (lower average_rank wins)");

    // title(1) + stage1(2) + stage2(2) + stage3(1) = 6.
    assert_eq!(mock.call_count(), 6);
}

// 2. Provider-gated failure — the one enabled agent has no configured key.
#[tokio::test]
async fn scenario2_provider_gated_failure() {
    // No server needed: an unroutable loopback port stands in for "the call
    // to an unconfigured provider never comes back with a response".
    let a1 = blank_agent("a1", "openrouter:model-a", 1.0, 0);
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::from_env();
    config.data_dir = dir.path().to_path_buf();
    config.openrouter_api_key = None;
    config.openrouter_api_url = "http://127.0.0.1:1/chat/completions".to_string();
    let config = Arc::new(config);

    let agents_store = Arc::new(
        AgentsStore::load_or_init(&config.agents_file(), Vec::new(), "openrouter:model-a".to_string(), "openrouter:model-a".to_string())
            .expect("agents store"),
    );
    agents_store.upsert(a1).expect("upsert agent");

    let gateway = Arc::new(Gateway::new(config.clone()));
    let kb_store = Arc::new(KbStore::open(config.kb_db()).await.expect("kb store"));
    let reranker = Arc::new(Reranker::new(gateway.clone(), None, config.dashscope_base_url.clone()));
    let retriever = Arc::new(HybridRetriever::new(kb_store.clone(), gateway.clone(), reranker));
    let jobs_store = Arc::new(JobStore::open(config.jobs_db()).await.expect("jobs store"));
    let trace = Arc::new(TraceSink::new(config.traces_dir()));
    let deps = Arc::new(PipelineDeps {
        config,
        gateway,
        retriever,
        kb_store,
        kg_store: Arc::new(InMemoryKnowledgeGraphStore::default()),
        agents_store,
        settings: Arc::new(FixedSettings(quiet_settings())),
        trace,
        jobs: jobs_store,
        http: Client::new(),
        agent_web_search_semaphore: Arc::new(tokio::sync::Semaphore::new(3)),
    });

    let mut conversation = Conversation::new("conv2".to_string());
    let result = pipeline::run_turn(&deps, &mut conversation, "hello").await;

    match result {
        Err(PipelineError::NoAgentsResponded(missing)) => {
            assert_eq!(missing, "openrouter");
        }
        other => panic!("expected NoAgentsResponded(\"openrouter\"), got {other:?}"),
    }
}

// 3. Lively convergence by chairman — 3 agents, checkpoint fires at message 8.
#[tokio::test]
async fn scenario3_lively_convergence_by_chairman() {
    let mock = MockServer::start(|_path, body: &Value| {
        let model = body.get("model").and_then(Value::as_str).unwrap_or("");
        let content = body
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|ms| ms.iter().rev().find(|m| m["role"] == "user"))
            .and_then(|m| m["content"].as_str())
            .unwrap_or("");
        if model == "chairman" {
            if content.contains("作为弱主持人，请判断是否应该收敛讨论") {
                return (200, chat_body(r#"{"action":"converge"}"#));
            }
            if content.contains("你是自由讨论的弱主持人") {
                return (200, chat_body(r#"{"leaders":["a1"],"action":"continue"}"#));
            }
            return (404, json!({"error": "unexpected chairman prompt"}));
        }
        // Warm-up / leader-open / follower / free-flow agent speech: content
        // doesn't matter, any non-empty text advances the state machine.
        (200, chat_body(format!("{model} contributes a point to the discussion.")))
    })
    .await;

    let agents = vec![
        blank_agent("a1", "openrouter:m-a", 1.0, 0),
        blank_agent("a2", "openrouter:m-b", 1.0, 0),
        blank_agent("a3", "openrouter:m-c", 1.0, 0),
    ];
    let (_dir, deps, _agents_store) =
        build_deps(&mock, quiet_settings(), &agents, "openrouter:chairman", "openrouter:titler").await;

    let mut conversation = Conversation::new("conv3".to_string());
    conversation.discussion_mode = DiscussionMode::Lively;
    conversation.lively_max_messages = 12;
    conversation.lively_max_turns = 3;

    let stage1: Vec<Stage1Record> = agents
        .iter()
        .map(|a| Stage1Record {
            agent_id: a.id.clone(),
            agent_name: a.name.clone(),
            model_spec: a.model_spec.clone(),
            influence_weight: a.influence_weight,
            seniority_years: a.seniority_years,
            response: format!("{}'s initial draft.", a.name),
        })
        .collect();

    let result = lively::run(&deps, &agents, &conversation, "是否应该采用微服务架构？", &stage1).await;

    assert!(result.messages.len() <= 8, "transcript length {} exceeds the ≤8 bound", result.messages.len());
    assert_eq!(result.messages.len(), 8);
    assert_eq!(result.action, council_engine::pipeline::types::LivelyAction::Converge);
    assert_eq!(result.leaders, vec!["a1".to_string()]);
}

// 4. Retriever cache hit — identical searches within the TTL window reuse
// the cached result set; a revision bump forces a fresh embedding call.
#[tokio::test]
async fn scenario4_retriever_cache_hit_and_revision_invalidation() {
    let mock = MockServer::start(|path, body: &Value| {
        if path == "/embeddings" {
            let n = body.get("input").and_then(Value::as_array).map(|a| a.len()).unwrap_or(1);
            let vectors = vec![vec![1.0f32, 0.0, 0.0]; n];
            return (200, embeddings_body(&vectors));
        }
        (404, json!({"error": "unexpected path"}))
    })
    .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::from_env();
    config.data_dir = dir.path().to_path_buf();
    config.dashscope_api_key = Some("test-key".to_string());
    config.dashscope_base_url = mock.base_url();
    let config = Arc::new(config);

    let gateway = Arc::new(Gateway::new(config.clone()));
    let kb_store = Arc::new(KbStore::open(config.kb_db()).await.expect("kb store"));
    let reranker = Arc::new(Reranker::new(gateway.clone(), config.dashscope_api_key.clone(), config.dashscope_base_url.clone()));
    let retriever = HybridRetriever::new(kb_store.clone(), gateway, reranker);

    kb_store
        .add_document(
            "doc1".to_string(),
            "Doc One".to_string(),
            "unit-test".to_string(),
            "microservices split a system into independently deployable services.".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .await
        .expect("add_document");

    let chunks = kb_store.list_chunks(KbScope::default(), 10).await.expect("list_chunks");
    assert_eq!(chunks.len(), 1);
    let embeddings: HashMap<String, Vec<f32>> =
        chunks.iter().map(|c| (c.chunk_id.clone(), vec![1.0, 0.0, 0.0])).collect();
    kb_store
        .set_chunk_embeddings(embeddings, "dashscope:embed-model".to_string())
        .await
        .expect("set_chunk_embeddings");

    let query = RetrieverQuery {
        query: "microservices".to_string(),
        scope: KbScope::default(),
        limit: 5,
        mode: RetrievalMode::Hybrid,
        embedding_model_spec: "dashscope:embed-model".to_string(),
        enable_rerank: false,
        rerank_model_spec: String::new(),
        semantic_pool: 100,
        initial_k: Some(20),
    };

    for _ in 0..3 {
        let hits = retriever.search(query.clone(), Duration::from_secs(5)).await;
        assert!(!hits.is_empty());
    }
    assert_eq!(mock.call_count(), 1, "3 identical searches must cost exactly 1 embedding call (the query vector)");

    // Insert a second document with no pre-populated embedding, then bump
    // the revision: the cached result set must be discarded, and the new
    // chunk's missing embedding must trigger a fresh gateway call even
    // though the query vector itself stays cached.
    kb_store
        .add_document(
            "doc2".to_string(),
            "Doc Two".to_string(),
            "unit-test".to_string(),
            "a second document unrelated to the first, added after the cache was warm.".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .await
        .expect("add_document doc2");
    retriever.bump_revision();

    let hits = retriever.search(query.clone(), Duration::from_secs(5)).await;
    assert!(!hits.is_empty());
    assert_eq!(
        mock.call_count(),
        2,
        "a revision bump must invalidate the cached result set and re-embed the newly-added chunk"
    );
}

// 5. Job idempotency + TTL reuse + force_new.
#[tokio::test]
async fn scenario5_job_idempotency_and_ttl_reuse() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = JobStore::open(dir.path().join("jobs.sqlite")).await.expect("jobs store");

    // t0: create, claim, succeed.
    let job_t0 = store
        .create_and_enqueue("evidence_pack".to_string(), "conv5".to_string(), json!({"q": "x"}), Some("k".to_string()), 3, 1, false)
        .await
        .expect("create at t0");
    assert!(store.try_claim(&job_t0.id).await.expect("claim"));
    store.mark_succeeded(&job_t0.id, json!({"summary": "done"})).await.expect("mark succeeded");

    // t0 + ~300ms: stands in for t0+300s against a 600s TTL — well inside a
    // 1s TTL window here. Must reuse the same job id.
    let reused = store
        .create_and_enqueue("evidence_pack".to_string(), "conv5".to_string(), json!({"q": "x"}), Some("k".to_string()), 3, 1, false)
        .await
        .expect("create within ttl");
    assert_eq!(reused.id, job_t0.id, "re-create within TTL must reuse the succeeded job");

    // t0 + ~700ms past a 1s TTL window — stands in for t0+700s against a
    // 600s TTL. Must create a new job.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let fresh = store
        .create_and_enqueue("evidence_pack".to_string(), "conv5".to_string(), json!({"q": "x"}), Some("k".to_string()), 3, 1, false)
        .await
        .expect("create outside ttl");
    assert_ne!(fresh.id, job_t0.id, "re-create outside TTL must create a new job");

    // force_new always creates a new job regardless of TTL.
    let forced = store
        .create_and_enqueue("evidence_pack".to_string(), "conv5".to_string(), json!({"q": "x"}), Some("k".to_string()), 3, 1, true)
        .await
        .expect("create with force_new");
    assert_ne!(forced.id, fresh.id, "force_new must bypass reuse");
}

// 6. Rerank fallback on a 4xx — final results match the heuristic ordering
// with rerank_score absent.
#[tokio::test]
async fn scenario6_rerank_fallback_on_4xx() {
    let mock = MockServer::start(|_path, _body: &Value| (400, json!({"error": "bad request"}))).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::from_env();
    config.data_dir = dir.path().to_path_buf();
    config.openrouter_api_key = Some("test-key".to_string());
    config.openrouter_api_url = format!("{}/chat/completions", mock.base_url());
    let config = Arc::new(config);

    let gateway = Arc::new(Gateway::new(config.clone()));
    let kb_store = Arc::new(KbStore::open(config.kb_db()).await.expect("kb store"));
    let reranker = Arc::new(Reranker::new(gateway.clone(), None, config.dashscope_base_url.clone()));
    let retriever = HybridRetriever::new(kb_store.clone(), gateway, reranker);

    kb_store
        .add_document(
            "doc1".to_string(),
            "Doc One".to_string(),
            "unit-test".to_string(),
            "rust ownership rules prevent data races at compile time.".to_string(),
            Vec::new(),
            Vec::new(),
        )
        .await
        .expect("add_document");

    let query = RetrieverQuery {
        query: "ownership".to_string(),
        scope: KbScope::default(),
        limit: 5,
        mode: RetrievalMode::Fts,
        embedding_model_spec: String::new(),
        enable_rerank: true,
        rerank_model_spec: "openrouter:bad-rerank".to_string(),
        semantic_pool: 100,
        initial_k: Some(20),
    };

    let hits = retriever.search(query, Duration::from_secs(5)).await;
    assert!(!hits.is_empty(), "FTS hit must still surface despite rerank failing");
    assert!(hits.iter().all(|h| h.rerank_score.is_none()), "a failed rerank must leave rerank_score absent");
}

// Sanity-checks the non-chat rerank path directly against the same 4xx mock,
// independent of the retriever's heuristic fallback above.
#[tokio::test]
async fn scenario6_reranker_returns_empty_on_4xx() {
    let mock = MockServer::start(|_path, _body: &Value| (400, json!({"error": "bad request"}))).await;
    let mut config = Config::from_env();
    config.openrouter_api_key = Some("test-key".to_string());
    config.openrouter_api_url = format!("{}/chat/completions", mock.base_url());
    let gateway = Arc::new(Gateway::new(Arc::new(config)));
    let reranker = Reranker::new(gateway, None, String::new());

    let candidates = vec![RerankCandidate { text: "a".to_string(), title: None, source: None }];
    let scores = reranker.rerank("openrouter:bad-rerank", "q", &candidates, 5, Duration::from_secs(5)).await;
    assert!(scores.is_empty());
}
