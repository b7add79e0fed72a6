//! Binary entrypoint: wires every store/collaborator together, recovers the
//! job queue, and drives a minimal stdin/stdout demo of one deliberation
//! turn. The HTTP surface (§6) lives behind the `server` feature.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::Result;
use reqwest::Client;

use council_engine::agents::AgentsStore;
use council_engine::conversation::{ConversationStore, InMemoryConversationStore};
use council_engine::config::Config;
use council_engine::gateway::Gateway;
use council_engine::jobs::{JobRunner, JobStore, ToolContext};
use council_engine::kb::{HybridRetriever, KbStore, Reranker};
use council_engine::kg::{InMemoryKnowledgeGraphStore, KnowledgeGraphStore};
use council_engine::pipeline::context::FixedSettings;
use council_engine::pipeline::{self, PipelineDeps};
use council_engine::plugins::PluginsStore;
use council_engine::settings::SettingsStore;
use council_engine::tools::runner_with_plugins;
use council_engine::trace::TraceSink;

const DEFAULT_MODELS: &[&str] = &["openrouter:openai/gpt-4o", "openrouter:anthropic/claude-3.5-sonnet"];

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _telemetry = council_engine::telemetry::init("council-enginectl");

    let config = Arc::new(Config::from_env());
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(config.traces_dir())?;

    let default_embedding_model = config.kb_embedding_model.clone().unwrap_or_default();
    let default_rerank_model = config.kb_rerank_model.clone().unwrap_or_default();

    let agents_store = Arc::new(AgentsStore::load_or_init(
        &config.agents_file(),
        DEFAULT_MODELS.iter().map(|s| s.to_string()).collect(),
        DEFAULT_MODELS[0].to_string(),
        DEFAULT_MODELS[0].to_string(),
    )?);
    let settings_store = Arc::new(SettingsStore::load_or_init(
        &config.settings_file(),
        default_embedding_model,
        default_rerank_model,
    )?);
    let plugins_store = Arc::new(PluginsStore::load_or_init(&config.plugins_file())?);

    let gateway = Arc::new(Gateway::new(config.clone()));
    let kb_store = Arc::new(KbStore::open(config.kb_db()).await?);
    let reranker = Arc::new(Reranker::new(
        gateway.clone(),
        config.dashscope_api_key.clone(),
        config.dashscope_base_url.clone(),
    ));
    let retriever = Arc::new(HybridRetriever::new(kb_store.clone(), gateway.clone(), reranker));
    let kg_store: Arc<dyn KnowledgeGraphStore> = Arc::new(InMemoryKnowledgeGraphStore::default());
    let jobs_store = Arc::new(JobStore::open(config.jobs_db()).await?);
    let trace = Arc::new(TraceSink::new(config.traces_dir()));
    let conversations: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::default());

    let tool_ctx = Arc::new(ToolContext {
        config: config.clone(),
        gateway: gateway.clone(),
        kb_store: kb_store.clone(),
        retriever: retriever.clone(),
        kg_store: kg_store.clone(),
        agents_store: agents_store.clone(),
        trace: trace.clone(),
        jobs: jobs_store.clone(),
    });
    let (runner, plugin_manager) = runner_with_plugins(jobs_store.clone(), tool_ctx.clone(), plugins_store.clone());
    let runner = Arc::new(runner);
    runner.recover().await?;
    tokio::spawn(runner.clone().run());

    let deps = Arc::new(PipelineDeps {
        config: config.clone(),
        gateway,
        retriever,
        kb_store,
        kg_store,
        agents_store,
        settings: Arc::new(FixedSettingsHandle(settings_store.clone())),
        trace,
        jobs: jobs_store,
        http: Client::new(),
        agent_web_search_semaphore: Arc::new(tokio::sync::Semaphore::new(3)),
    });

    #[cfg(feature = "server")]
    {
        if std::env::var("COUNCIL_SERVE").map(|v| v == "1").unwrap_or(false) {
            return council_engine::server::serve(deps, conversations, plugins_store, tool_ctx, plugin_manager, runner)
                .await;
        }
    }
    #[cfg(not(feature = "server"))]
    let _ = &plugin_manager;

    run_demo_loop(deps, conversations).await
}

/// Thin adapter so `main` can hand the live `SettingsStore` to `PipelineDeps`
/// without `pipeline::context` depending on the concrete store type.
struct FixedSettingsHandle(Arc<SettingsStore>);
impl pipeline::context::SettingsStoreHandle for FixedSettingsHandle {
    fn get(&self) -> council_engine::settings::Settings {
        self.0.get()
    }
}

/// No HTTP surface compiled in: read one question from stdin per line, run
/// the full deliberation pipeline against a single ad-hoc conversation, and
/// print the chairman's synthesis. Not a replacement for the §6 HTTP API,
/// only a way to exercise the pipeline end-to-end without it.
async fn run_demo_loop(deps: Arc<PipelineDeps>, conversations: Arc<dyn ConversationStore>) -> Result<()> {
    let conversation_id = format!("demo-{}", uuid::Uuid::new_v4().simple());
    let mut conversation = conversations.create(conversation_id).await?;

    println!("council-enginectl demo — type a question, or Ctrl-D to exit.");
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let query = line.trim();
        if query.is_empty() {
            continue;
        }

        match pipeline::run_turn(&deps, &mut conversation, query).await {
            Ok(turn) => {
                println!("\n[{}] {}\n", turn.stage3.model_spec, turn.stage3.response);
                if let Some(report) = &turn.stage4 {
                    println!("--- report ---\n{}\n", report.markdown);
                }
            }
            Err(e) => {
                eprintln!("pipeline error: {e}");
            }
        }

        conversations.save(&conversation).await?;
    }

    Ok(())
}
