//! Thin representative HTTP surface (§6), compiled only behind the
//! `server` feature.
//!
//! Per spec §1 the HTTP surface is an external collaborator — only its
//! interface is specified. SPEC_FULL.md §11 nonetheless commits to a thin,
//! representative subset of §6's endpoints wired to the real pipeline so
//! the crate has a runnable demonstration surface beyond the stdin loop in
//! `main.rs`. Every handler is a direct pass-through to `pipeline`/`jobs`/
//! `tools` — no protocol logic is duplicated here. Grounded on the
//! teacher's `src/server.rs` (axum `AppState` + `ServerError` shape,
//! `Event::default().data(...)` SSE framing, `axum::serve` over a
//! `TcpListener`) generalized from its single-provider chat surface to
//! this spec's stage-bundle responses and job endpoints.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::conversation::ConversationStore;
use crate::error::PipelineError;
use crate::jobs::store::Job;
use crate::jobs::{JobRunner, JobStatus, ProgressReporter, ToolContext, ToolDispatch};
use crate::pipeline::{self, DirectInvocation, PipelineDeps};
use crate::plugins::PluginsStore;
use crate::tools::PluginManager;

#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<PipelineDeps>,
    pub conversations: Arc<dyn ConversationStore>,
    pub plugins: Arc<PluginsStore>,
    pub tool_ctx: Arc<ToolContext>,
    pub tool_dispatch: Arc<PluginManager>,
    pub job_runner: Arc<JobRunner>,
}

/// Error response shape `{"error": "..."}`, grounded on the teacher's
/// `ServerError`/`IntoResponse` pairing.
struct ApiError(StatusCode, String);

impl ApiError {
    fn internal(e: impl std::fmt::Display) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, msg.into())
    }

    fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::UnknownAgent(_) | PipelineError::UnknownConversation => {
                ApiError::not_found(e.to_string())
            }
            PipelineError::NoAgentsResponded(_) => ApiError::bad_request(e.to_string()),
        }
    }
}

/// Build the router and serve it on `COUNCIL_HTTP_ADDR` (default
/// `127.0.0.1:8787`) until the process is killed. CORS is opened to
/// `localhost`/`127.0.0.1` origins of any port (§6 "CORS wildcard over
/// localhost/127.0.0.1").
pub async fn serve(
    deps: Arc<PipelineDeps>,
    conversations: Arc<dyn ConversationStore>,
    plugins: Arc<PluginsStore>,
    tool_ctx: Arc<ToolContext>,
    tool_dispatch: Arc<PluginManager>,
    job_runner: Arc<JobRunner>,
) -> anyhow::Result<()> {
    let state = AppState { deps, conversations, plugins, tool_ctx, tool_dispatch, job_runner };

    let cors = CorsLayer::new()
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
        .allow_origin(AllowOrigin::predicate(|origin, _| {
            origin
                .to_str()
                .map(|s| s.contains("localhost") || s.contains("127.0.0.1"))
                .unwrap_or(false)
        }));

    let app = Router::new()
        .route("/conversations/{id}/message", post(post_message))
        .route("/conversations/{id}/message/stream", post(post_message_stream))
        .route("/conversations/{id}/invoke", post(post_invoke))
        .route("/kg/extract", post(post_kg_extract))
        .route("/kb/index", post(post_kb_index))
        .route("/jobs", get(list_jobs).post(post_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr =
        std::env::var("COUNCIL_HTTP_ADDR").unwrap_or_else(|_| "127.0.0.1:8787".to_string()).parse()?;
    tracing::info!(%addr, "council_engine http surface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Deserialize)]
struct MessageRequest {
    query: String,
}

/// `POST /conversations/{id}/message` (§6): run the pipeline to completion
/// and return the full stage bundle in one response.
async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut conversation = state
        .conversations
        .get(&id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("unknown conversation"))?;

    match pipeline::run_turn(&state.deps, &mut conversation, &body.query).await {
        Ok(turn) => {
            state.conversations.save(&conversation).await.map_err(ApiError::internal)?;
            Ok(Json(serde_json::to_value(&turn).map_err(ApiError::internal)?))
        }
        // §7 "Provider misconfiguration": surfaced as a response body, not
        // an HTTP error, per §8 scenario 2.
        Err(PipelineError::NoAgentsResponded(missing)) => Ok(Json(json!({
            "model": "error",
            "response": format!("No model responded. Missing API key(s) for provider(s): {missing}"),
        }))),
        Err(e) => Err(e.into()),
    }
}

/// `POST /conversations/{id}/message/stream` (§6): SSE framing of one
/// event per stage start/complete plus `title_complete` and `complete`/
/// `error`. Stage boundaries are read off the same trace JSONL the
/// pipeline already writes to (§4.5's tracing paragraph) rather than
/// threading a second notification channel through every stage function.
async fn post_message_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MessageRequest>,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();

    let deps = state.deps.clone();
    let conversations = state.conversations.clone();
    tokio::spawn(async move {
        stream_turn(deps, conversations, id, body.query, tx).await;
    });

    Sse::new(UnboundedReceiverStream::new(rx)).into_response()
}

fn send_event(tx: &mpsc::UnboundedSender<Result<Event, Infallible>>, name: &str, data: Value) {
    let _ = tx.send(Ok(Event::default().event(name).data(data.to_string())));
}

/// Maps a `stage_start`/`stage_complete` trace event onto its SSE name
/// (`stage1_start`, `stage2_complete`, ...); anything else is not part of
/// §6's SSE event list and is skipped.
fn emit_trace_event(tx: &mpsc::UnboundedSender<Result<Event, Infallible>>, ev: &Value) {
    let kind = ev.get("type").and_then(Value::as_str).unwrap_or("");
    let stage = ev.get("stage").and_then(Value::as_str);
    let name = match (kind, stage) {
        ("stage_start", Some(s)) => format!("{s}_start"),
        ("stage_complete", Some(s)) => format!("{s}_complete"),
        _ => return,
    };
    send_event(tx, &name, ev.clone());
}

async fn stream_turn(
    deps: Arc<PipelineDeps>,
    conversations: Arc<dyn ConversationStore>,
    conversation_id: String,
    query: String,
    tx: mpsc::UnboundedSender<Result<Event, Infallible>>,
) {
    let conversation = match conversations.get(&conversation_id).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            send_event(&tx, "error", json!({"error": "unknown conversation"}));
            return;
        }
        Err(e) => {
            send_event(&tx, "error", json!({"error": e.to_string()}));
            return;
        }
    };

    let trace = deps.trace.clone();
    let cid = conversation_id.clone();
    let mut seen = 0usize;

    let mut run_conversation = conversation;
    let run_deps = deps.clone();
    let run_query = query;
    let mut run_fut = Box::pin(async move {
        let result = pipeline::run_turn(&run_deps, &mut run_conversation, &run_query).await;
        (run_conversation, result)
    });

    loop {
        tokio::select! {
            out = &mut run_fut => {
                if let Ok(events) = trace.read_events(&cid, 10_000).await {
                    for ev in events.iter().skip(seen) {
                        emit_trace_event(&tx, ev);
                    }
                }
                match out {
                    (saved, Ok(turn)) => {
                        send_event(&tx, "title_complete", json!({"title": saved.title}));
                        if let Err(e) = conversations.save(&saved).await {
                            send_event(&tx, "error", json!({"error": e.to_string()}));
                            return;
                        }
                        let data = serde_json::to_value(&turn).unwrap_or(Value::Null);
                        send_event(&tx, "complete", data);
                    }
                    (_, Err(e)) => send_event(&tx, "error", json!({"error": e.to_string()})),
                }
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(150)) => {
                if let Ok(events) = trace.read_events(&cid, 10_000).await {
                    for ev in events.iter().skip(seen) {
                        emit_trace_event(&tx, ev);
                    }
                    seen = events.len();
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum InvokeRequest {
    Ask {
        agent_id: String,
        query: String,
    },
    Report {
        agent_id: Option<String>,
        #[serde(default)]
        query: Option<String>,
        requirements_override: Option<String>,
    },
}

/// `POST /conversations/{id}/invoke` (§4.5.8, §6): direct single-agent
/// `ask`, or an ad-hoc `report` over the conversation's latest stage
/// bundle.
async fn post_invoke(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<InvokeRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut conversation = state
        .conversations
        .get(&id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("unknown conversation"))?;

    let result = match body {
        InvokeRequest::Ask { agent_id, query } => {
            pipeline::invoke_direct(&state.deps, &mut conversation, DirectInvocation::Ask { agent_id: &agent_id }, &query)
                .await?
        }
        InvokeRequest::Report { agent_id, query, requirements_override } => {
            pipeline::invoke_direct(
                &state.deps,
                &mut conversation,
                DirectInvocation::Report {
                    agent_id: agent_id.as_deref(),
                    requirements_override: requirements_override.as_deref(),
                },
                &query.unwrap_or_default(),
            )
            .await?
        }
    };

    state.conversations.save(&conversation).await.map_err(ApiError::internal)?;
    Ok(Json(serde_json::to_value(&result).map_err(ApiError::internal)?))
}

/// A job struct that is never persisted, used by the synchronous (no
/// `async_job`) branch of `/kg/extract` and `/kb/index` to run the exact
/// same `Tool::run` a queued job would, without round-tripping through
/// the store. `ProgressReporter` writes against this id are simply
/// no-ops (no row exists to update).
fn transient_job(job_type: &str, conversation_id: String, payload: Value) -> Job {
    let now = chrono::Utc::now();
    Job {
        id: uuid::Uuid::new_v4().to_string(),
        job_type: job_type.to_string(),
        status: JobStatus::Running,
        conversation_id,
        payload,
        progress: 0.0,
        result: None,
        error: None,
        idempotency_key: String::new(),
        attempts: 0,
        max_attempts: 1,
        run_after_ts: now,
        injected: false,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Deserialize)]
struct KgExtractRequest {
    graph_id: String,
    doc_id: String,
    text: String,
    model_spec: Option<String>,
    output_language: Option<String>,
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    async_job: bool,
}

/// `POST /kg/extract` (§6): `async_job=true` enqueues the `kg_extract` job
/// type and returns a job handle; otherwise the extraction runs inline and
/// the tool's result is returned directly.
async fn post_kg_extract(
    State(state): State<AppState>,
    Json(req): Json<KgExtractRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let payload = json!({
        "graph_id": req.graph_id,
        "doc_id": req.doc_id,
        "text": req.text,
        "model_spec": req.model_spec,
        "output_language": req.output_language,
    });

    if req.async_job {
        let job = state
            .deps
            .jobs
            .create_and_enqueue("kg_extract".to_string(), req.conversation_id, payload, None, 3, 0, false)
            .await
            .map_err(ApiError::internal)?;
        state.job_runner.notify_queued(job.id.clone());
        return Ok((StatusCode::ACCEPTED, Json(serde_json::to_value(&job).map_err(ApiError::internal)?)));
    }

    let job = transient_job("kg_extract", req.conversation_id, payload);
    let progress = ProgressReporter::new(state.deps.jobs.clone(), job.id.clone());
    let output = state.tool_dispatch.dispatch(&job, &state.tool_ctx, &progress).await.map_err(ApiError::internal)?;
    Ok((StatusCode::OK, Json(json!({"ok": output.ok, "summary": output.summary, "data": output.data}))))
}

#[derive(Deserialize)]
struct KbIndexRequest {
    doc_ids: Option<Vec<String>>,
    embedding_model_spec: Option<String>,
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    async_job: bool,
}

/// `POST /kb/index` (§6): same `async_job` split as `/kg/extract`, over
/// the `kb_index` tool.
async fn post_kb_index(
    State(state): State<AppState>,
    Json(req): Json<KbIndexRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let payload = json!({
        "doc_ids": req.doc_ids,
        "embedding_model_spec": req.embedding_model_spec,
    });

    if req.async_job {
        let job = state
            .deps
            .jobs
            .create_and_enqueue("kb_index".to_string(), req.conversation_id, payload, None, 3, 0, false)
            .await
            .map_err(ApiError::internal)?;
        state.job_runner.notify_queued(job.id.clone());
        return Ok((StatusCode::ACCEPTED, Json(serde_json::to_value(&job).map_err(ApiError::internal)?)));
    }

    let job = transient_job("kb_index", req.conversation_id, payload);
    let progress = ProgressReporter::new(state.deps.jobs.clone(), job.id.clone());
    let output = state.tool_dispatch.dispatch(&job, &state.tool_ctx, &progress).await.map_err(ApiError::internal)?;
    Ok((StatusCode::OK, Json(json!({"ok": output.ok, "summary": output.summary, "data": output.data}))))
}

#[derive(Deserialize)]
struct CreateJobRequest {
    job_type: String,
    conversation_id: String,
    #[serde(default)]
    payload: Value,
    idempotency_key: Option<String>,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default)]
    result_ttl_seconds: u64,
    #[serde(default)]
    force_new: bool,
}

fn default_max_attempts() -> u32 {
    3
}

/// `POST /jobs` (§6): generic job creation for any registered, enabled
/// tool. Rejects `job_type`s a disabled plugin has unregistered (§4.7,
/// §7 "Input validation ... disabled tool").
async fn post_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    if state.tool_dispatch.registry().get(&req.job_type).is_none() {
        return Err(ApiError::bad_request(format!("unknown or disabled job type: {}", req.job_type)));
    }

    let job = state
        .deps
        .jobs
        .create_and_enqueue(
            req.job_type,
            req.conversation_id,
            req.payload,
            req.idempotency_key,
            req.max_attempts,
            req.result_ttl_seconds,
            req.force_new,
        )
        .await
        .map_err(ApiError::internal)?;
    state.job_runner.notify_queued(job.id.clone());
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Deserialize)]
struct ListJobsQuery {
    conversation_id: Option<String>,
    status: Option<String>,
}

/// `GET /jobs` (§6), optionally filtered by `conversation_id` and/or
/// `status`.
async fn list_jobs(
    State(state): State<AppState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let status = q.status.as_deref().map(JobStatus::parse);
    let jobs =
        state.deps.jobs.list(q.conversation_id.as_deref(), status).await.map_err(ApiError::internal)?;
    Ok(Json(jobs))
}

/// `GET /jobs/{id}` (§6).
async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Job>, ApiError> {
    state
        .deps
        .jobs
        .get(&id)
        .await
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("job not found"))
}

/// `POST /jobs/{id}/cancel` (§6): cooperative cancellation (§4.6, §5).
async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let canceled = state.job_runner.cancel(&id).await.map_err(ApiError::internal)?;
    if canceled {
        Ok(Json(json!({"canceled": true})))
    } else {
        Err(ApiError::not_found("job not found or already in a terminal state"))
    }
}
