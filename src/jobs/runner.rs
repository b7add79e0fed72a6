//! In-process job dispatcher (§4.6 "Job Runner").
//!
//! Grounded on the teacher's `SqliteTaskQueue` consumer loop shape, extended
//! with per-`job_type` concurrency semaphores, a crash-recovery replay pass
//! at startup, and cooperative cancellation via `ToolContext::is_canceled`.
//! The in-process dispatch queue is an `mpsc` channel of job ids, kept
//! separate from the persistent `JobStore` so the store alone remains the
//! source of truth after a restart (§4.6 "the in-process queue mirrors, but
//! never replaces, the persistent store").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::AbortHandle;

use crate::agents::AgentsStore;
use crate::config::Config;
use crate::gateway::Gateway;
use crate::jobs::store::{Job, JobStore};
use crate::kb::{HybridRetriever, KbStore};
use crate::kg::KnowledgeGraphStore;
use crate::trace::TraceSink;

/// Shared dependencies every tool needs, assembled once and handed to each
/// `Tool::run` call (§4.7's job-based `ctx` argument).
pub struct ToolContext {
    pub config: Arc<Config>,
    pub gateway: Arc<Gateway>,
    pub kb_store: Arc<KbStore>,
    pub retriever: Arc<HybridRetriever>,
    pub kg_store: Arc<dyn KnowledgeGraphStore>,
    pub agents_store: Arc<AgentsStore>,
    pub trace: Arc<TraceSink>,
    pub jobs: Arc<JobStore>,
}

impl ToolContext {
    /// Cooperative cancellation check — tools call this between sub-steps
    /// at whatever granularity makes sense for the work they're doing
    /// (e.g. between per-source fetches, between extraction chunks).
    pub async fn is_canceled(&self, job_id: &str) -> bool {
        matches!(
            self.jobs.get(job_id).await,
            Ok(Some(job)) if job.status == crate::jobs::store::JobStatus::Canceled
        )
    }
}

/// Handed to `Tool::run` so a tool can push progress without depending on
/// `JobStore` directly.
pub struct ProgressReporter {
    jobs: Arc<JobStore>,
    job_id: String,
}

impl ProgressReporter {
    pub fn new(jobs: Arc<JobStore>, job_id: String) -> Self {
        Self { jobs, job_id }
    }

    pub async fn set(&self, fraction: f64) {
        let _ = self.jobs.update_progress(&self.job_id, fraction).await;
    }
}

#[async_trait::async_trait]
pub trait ToolDispatch: Send + Sync {
    async fn dispatch(
        &self,
        job: &Job,
        ctx: &ToolContext,
        progress: &ProgressReporter,
    ) -> Result<crate::tools::ToolRunOutput>;
}

pub struct JobRunner {
    store: Arc<JobStore>,
    ctx: Arc<ToolContext>,
    registry: Arc<dyn ToolDispatch>,
    concurrency: HashMap<String, Arc<Semaphore>>,
    default_concurrency: usize,
    timeouts: HashMap<String, Duration>,
    default_timeout: Duration,
    sender: mpsc::UnboundedSender<String>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    /// Per-job cancel signal + abort handle for the in-flight dispatch task
    /// (§4.6 "Cancellation" (b)/(c)). Populated while a job is executing,
    /// removed once it settles.
    inflight: Mutex<HashMap<String, (Arc<Notify>, AbortHandle)>>,
}

impl JobRunner {
    pub fn new(store: Arc<JobStore>, ctx: Arc<ToolContext>, registry: Arc<dyn ToolDispatch>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let concurrency = ctx
            .config
            .job_type_concurrency
            .iter()
            .map(|(k, v)| (k.to_string(), Arc::new(Semaphore::new((*v).max(1)))))
            .collect();
        let timeouts = ctx
            .config
            .job_type_timeouts_seconds
            .iter()
            .map(|(k, v)| (k.to_string(), Duration::from_secs(*v)))
            .collect();
        Self {
            store,
            ctx,
            registry,
            concurrency,
            default_concurrency: 2,
            timeouts,
            default_timeout: Duration::from_secs(120),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore_for(&self, job_type: &str) -> Arc<Semaphore> {
        self.concurrency
            .get(job_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(Semaphore::new(self.default_concurrency)))
    }

    fn timeout_for(&self, job_type: &str) -> Duration {
        self.timeouts.get(job_type).copied().unwrap_or(self.default_timeout)
    }

    /// Enqueue a job id onto the in-process dispatch queue. Called after
    /// `JobStore::create_and_enqueue` by whatever created the job (pipeline
    /// stage, direct tool invocation endpoint), and again by `recover` at
    /// startup for any job left `queued` from a previous run.
    pub fn notify_queued(&self, job_id: String) {
        let _ = self.sender.send(job_id);
    }

    /// Cooperative cancellation (§4.6): (a) mark the job `canceled` in the
    /// store, (b) wake the per-job cancel signal so any cooperative
    /// `ToolContext::is_canceled` poll sees it immediately, (c) abort the
    /// executing task outright rather than waiting for it to poll. Returns
    /// `false` if the job was already in a terminal state or unknown.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let canceled = self.store.cancel(job_id).await?;
        let entry = {
            let inflight = self.inflight.lock().await;
            inflight.get(job_id).cloned()
        };
        if let Some((notify, abort)) = entry {
            notify.notify_waiters();
            abort.abort();
        }
        Ok(canceled)
    }

    /// Crash recovery (§4.6): requeue jobs stuck `running`, then re-feed
    /// every `queued` job (insertion order) onto the in-process channel so
    /// work resumes without the caller replaying anything itself.
    pub async fn recover(&self) -> Result<()> {
        self.store.requeue_stuck_running().await?;
        for id in self.store.list_queued_ids_in_order().await? {
            self.notify_queued(id);
        }
        Ok(())
    }

    /// Drive the dispatch loop. Spawns one task per dequeued job id, gated
    /// by that job type's concurrency semaphore, and returns once the
    /// channel closes (all senders including `self` dropped) — callers
    /// typically run this inside `tokio::spawn` for the process lifetime.
    pub async fn run(self: Arc<Self>) {
        loop {
            let next = {
                let mut rx = self.receiver.lock().await;
                rx.recv().await
            };
            let Some(job_id) = next else { break };
            let runner = self.clone();
            tokio::spawn(async move {
                if let Err(err) = runner.execute_one(&job_id).await {
                    tracing::warn!(job_id = %job_id, error = %err, "job execution failed");
                }
            });
        }
    }

    async fn execute_one(&self, job_id: &str) -> Result<()> {
        let Some(job) = self.store.get(job_id).await? else { return Ok(()) };
        if job.status != crate::jobs::store::JobStatus::Queued {
            return Ok(());
        }
        if !self.store.try_claim(job_id).await? {
            return Ok(());
        }
        // `try_claim` already bumped `attempts` in the store; re-fetch so the
        // retry predicate in `handle_failure` sees the post-increment value
        // (§3 invariant: `attempts <= max_attempts`).
        let job = self.store.get(job_id).await?.ok_or_else(|| anyhow!("job {job_id} vanished after claim"))?;

        let permit = self.semaphore_for(&job.job_type).acquire_owned().await.map_err(|e| anyhow!(e))?;
        let timeout = self.timeout_for(&job.job_type);
        let progress = ProgressReporter::new(self.store.clone(), job.id.clone());

        // Dispatch runs as its own task so a cancel can abort it outright
        // instead of only dropping our handle to it (§4.6 "Cancellation"
        // (c)) — `tokio::time::timeout` around a plain future only stops
        // *this* task from awaiting it, it doesn't stop the work itself.
        let registry = self.registry.clone();
        let ctx = self.ctx.clone();
        let dispatch_job = job.clone();
        let handle = tokio::spawn(async move { registry.dispatch(&dispatch_job, &ctx, &progress).await });
        let abort_handle = handle.abort_handle();
        let cancel_signal = Arc::new(Notify::new());
        self.inflight.lock().await.insert(job.id.clone(), (cancel_signal.clone(), abort_handle.clone()));

        enum Outcome {
            Finished(std::result::Result<Result<crate::tools::ToolRunOutput>, tokio::task::JoinError>),
            TimedOut,
            Canceled,
        }
        let outcome = tokio::select! {
            res = tokio::time::timeout(timeout, handle) => match res {
                Ok(joined) => Outcome::Finished(joined),
                Err(_elapsed) => Outcome::TimedOut,
            },
            _ = cancel_signal.notified() => Outcome::Canceled,
        };

        self.inflight.lock().await.remove(&job.id);
        drop(permit);

        match outcome {
            Outcome::Finished(Ok(Ok(output))) => {
                self.store
                    .mark_succeeded(
                        job_id,
                        serde_json::json!({"ok": output.ok, "summary": output.summary, "data": output.data}),
                    )
                    .await?;
            }
            Outcome::Finished(Ok(Err(err))) => {
                self.handle_failure(&job, err.to_string()).await?;
            }
            Outcome::Finished(Err(join_err)) => {
                if !join_err.is_cancelled() {
                    self.handle_failure(&job, format!("task join error: {join_err}")).await?;
                }
            }
            Outcome::TimedOut => {
                abort_handle.abort();
                self.handle_failure(&job, format!("timed out after {:?}", timeout)).await?;
            }
            Outcome::Canceled => {
                abort_handle.abort();
                // Status was already set to `canceled` by whoever signaled
                // this — terminal-state stickiness in `mark_failed`/
                // `mark_succeeded` prevents either from clobbering it.
            }
        }
        Ok(())
    }

    async fn handle_failure(&self, job: &Job, error: String) -> Result<()> {
        let retry = job.attempts < job.max_attempts;
        let backoff = backoff_seconds(job.attempts);
        self.store.mark_failed(&job.id, error, retry, backoff).await?;
        if retry {
            let job_id = job.id.clone();
            let delay = Duration::from_secs(backoff);
            let sender = self.sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = sender.send(job_id);
            });
        }
        Ok(())
    }
}

/// `min(30min, 2^min(15, attempts+1))` seconds (§4.6 "Backoff").
fn backoff_seconds(attempts: u32) -> u64 {
    let exponent = attempts.saturating_add(1).min(15);
    let seconds = 2u64.saturating_pow(exponent);
    seconds.min(30 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_thirty_minutes() {
        assert_eq!(backoff_seconds(0), 2);
        assert_eq!(backoff_seconds(1), 4);
        assert_eq!(backoff_seconds(20), 30 * 60);
    }
}
