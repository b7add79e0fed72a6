//! Persistent job queue (§3 "Job", §6 `data/jobs.sqlite`).
//!
//! Grounded on `original_source/backend/jobs_store.py`, reworked onto the
//! teacher's `SqliteTaskQueue` idiom (`examples/ProdByBuddha-rust_agency/src/orchestrator/queue.rs`):
//! a `PathBuf` held by the store, one `rusqlite::Connection::open` per call
//! wrapped in `spawn_blocking`. The idempotency rule implemented is spec
//! §4.6's richer explicit rule (reuse active queued/running; reuse a
//! succeeded job only within its type's `result_ttl_seconds`; `force_new`
//! bypasses reuse) rather than the simpler on-disk Python, noted in
//! DESIGN.md as a deliberate deviation.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => Self::Queued,
        }
    }

    /// Terminal states never transition — §3's Job invariant.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub conversation_id: String,
    pub payload: Value,
    pub progress: f64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub idempotency_key: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_after_ts: DateTime<Utc>,
    pub injected: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Notification fired on status change, result/error write, or progress
/// crossing a 5%-bucket boundary (§4.6 "Notifications") — for SSE fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub progress: f64,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    StatusChanged,
    ResultWritten,
    ProgressBucket,
}

/// Stable default idempotency key: a hash of type + conversation_id +
/// payload, used when the caller doesn't supply one explicitly.
pub fn default_idempotency_key(job_type: &str, conversation_id: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update(b"\0");
    hasher.update(conversation_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(payload.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct JobStore {
    db_path: PathBuf,
    events: broadcast::Sender<JobEvent>,
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let payload_json: String = row.get(3)?;
    let result_json: Option<String> = row.get(5)?;
    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        status: JobStatus::parse(&row.get::<_, String>(2)?),
        conversation_id: row.get(9)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        progress: row.get(4)?,
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(6)?,
        idempotency_key: row.get(10)?,
        attempts: row.get::<_, i64>(7)? as u32,
        max_attempts: row.get::<_, i64>(8)? as u32,
        run_after_ts: parse_ts(&row.get::<_, String>(11)?),
        injected: row.get::<_, i64>(12)? != 0,
        created_at: parse_ts(&row.get::<_, String>(13)?),
        updated_at: parse_ts(&row.get::<_, String>(14)?),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

const SELECT_COLUMNS: &str = "id,job_type,status,payload_json,progress,result_json,error,attempts,max_attempts,\
     conversation_id,idempotency_key,run_after_ts,injected,created_at,updated_at";

impl JobStore {
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        let path = db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = connect(&path)?;
            ensure_schema(&conn)?;
            Ok(())
        })
        .await??;
        let (events, _) = broadcast::channel(256);
        Ok(Self { db_path, events })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn notify(&self, job: &Job, kind: JobEventKind) {
        let _ = self.events.send(JobEvent {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            status: job.status,
            progress: job.progress,
            kind,
        });
    }

    /// Create-or-reuse per §4.6's idempotency rule. `result_ttl_seconds`
    /// is the caller's per-`job_type` reuse window for a `succeeded` job
    /// (0 = never reuse a succeeded job).
    pub async fn create_and_enqueue(
        &self,
        job_type: String,
        conversation_id: String,
        payload: Value,
        idempotency_key: Option<String>,
        max_attempts: u32,
        result_ttl_seconds: u64,
        force_new: bool,
    ) -> Result<Job> {
        let key = idempotency_key.unwrap_or_else(|| default_idempotency_key(&job_type, &conversation_id, &payload));
        if !force_new {
            if let Some(existing) = self.find_reusable(&job_type, &key, result_ttl_seconds).await? {
                return Ok(existing);
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let job = Job {
            id: id.clone(),
            job_type: job_type.clone(),
            status: JobStatus::Queued,
            conversation_id,
            payload,
            progress: 0.0,
            result: None,
            error: None,
            idempotency_key: key,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            run_after_ts: now,
            injected: false,
            created_at: now,
            updated_at: now,
        };

        let path = self.db_path.clone();
        let insert = job.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = connect(&path)?;
            conn.execute(
                "INSERT INTO jobs(id,job_type,status,payload_json,progress,result_json,error,attempts,max_attempts,\
                 conversation_id,idempotency_key,run_after_ts,injected,created_at,updated_at) \
                 VALUES(?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
                params![
                    insert.id,
                    insert.job_type,
                    insert.status.as_str(),
                    insert.payload.to_string(),
                    insert.progress,
                    Option::<String>::None,
                    Option::<String>::None,
                    insert.attempts as i64,
                    insert.max_attempts as i64,
                    insert.conversation_id,
                    insert.idempotency_key,
                    insert.run_after_ts.to_rfc3339(),
                    0i64,
                    insert.created_at.to_rfc3339(),
                    insert.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await??;

        self.notify(&job, JobEventKind::StatusChanged);
        Ok(job)
    }

    async fn find_reusable(&self, job_type: &str, key: &str, result_ttl_seconds: u64) -> Result<Option<Job>> {
        let path = self.db_path.clone();
        let job_type = job_type.to_string();
        let key = key.to_string();
        let candidate = tokio::task::spawn_blocking(move || -> Result<Option<Job>> {
            let conn = connect(&path)?;
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM jobs WHERE job_type=? AND idempotency_key=? ORDER BY created_at DESC LIMIT 1"
            );
            conn.query_row(&sql, params![job_type, key], row_to_job).optional().map_err(Into::into)
        })
        .await??;

        let Some(job) = candidate else { return Ok(None) };
        match job.status {
            JobStatus::Queued | JobStatus::Running => Ok(Some(job)),
            JobStatus::Succeeded => {
                let age = (Utc::now() - job.updated_at).num_seconds().max(0) as u64;
                if result_ttl_seconds > 0 && age <= result_ttl_seconds {
                    Ok(Some(job))
                } else {
                    Ok(None)
                }
            }
            JobStatus::Failed | JobStatus::Canceled => Ok(None),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let path = self.db_path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Job>> {
            let conn = connect(&path)?;
            let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id=?");
            conn.query_row(&sql, [&id], row_to_job).optional().map_err(Into::into)
        })
        .await?
    }

    pub async fn list(&self, conversation_id: Option<&str>, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let path = self.db_path.clone();
        let conversation_id = conversation_id.map(str::to_string);
        tokio::task::spawn_blocking(move || -> Result<Vec<Job>> {
            let conn = connect(&path)?;
            let mut clauses = Vec::new();
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(cid) = &conversation_id {
                clauses.push("conversation_id=?".to_string());
                params.push(Box::new(cid.clone()));
            }
            if let Some(st) = status {
                clauses.push("status=?".to_string());
                params.push(Box::new(st.as_str().to_string()));
            }
            let where_sql = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
            let sql = format!("SELECT {SELECT_COLUMNS} FROM jobs {where_sql} ORDER BY created_at ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())), row_to_job)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await?
    }

    /// Atomic compare-and-swap `queued -> running`, bumping `attempts`.
    /// Returns `true` only if this caller won the claim, preventing
    /// duplicate execution under parallel workers (§4.6 "Claim protocol").
    pub async fn try_claim(&self, id: &str) -> Result<bool> {
        let path = self.db_path.clone();
        let id_owned = id.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = connect(&path)?;
            let n = conn.execute(
                "UPDATE jobs SET status='running', attempts=attempts+1, updated_at=? WHERE id=? AND status='queued'",
                params![now, id_owned],
            )?;
            Ok(n)
        })
        .await??;
        if changed == 1 {
            if let Some(job) = self.get(id).await? {
                self.notify(&job, JobEventKind::StatusChanged);
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn mark_succeeded(&self, id: &str, result: Value) -> Result<()> {
        let path = self.db_path.clone();
        let id_owned = id.to_string();
        let now = Utc::now().to_rfc3339();
        let result_json = result.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = connect(&path)?;
            conn.execute(
                "UPDATE jobs SET status='succeeded', progress=1.0, result_json=?, updated_at=? WHERE id=? AND status='running'",
                params![result_json, now, id_owned],
            )?;
            Ok(())
        })
        .await??;
        if let Some(job) = self.get(id).await? {
            self.notify(&job, JobEventKind::ResultWritten);
        }
        Ok(())
    }

    /// `retry=true` sends the job back to `queued` with an exponential
    /// backoff `run_after_ts` (§4.6); otherwise the failure is terminal.
    pub async fn mark_failed(&self, id: &str, error: String, retry: bool, backoff_seconds: u64) -> Result<()> {
        let path = self.db_path.clone();
        let id_owned = id.to_string();
        let now = Utc::now();
        let new_status = if retry { "queued" } else { "failed" };
        let run_after = (now + chrono::Duration::seconds(backoff_seconds as i64)).to_rfc3339();
        let now_s = now.to_rfc3339();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = connect(&path)?;
            conn.execute(
                "UPDATE jobs SET status=?, error=?, run_after_ts=?, updated_at=? WHERE id=? AND status='running'",
                params![new_status, error, run_after, now_s, id_owned],
            )?;
            Ok(())
        })
        .await??;
        if let Some(job) = self.get(id).await? {
            self.notify(&job, JobEventKind::StatusChanged);
        }
        Ok(())
    }

    /// Cooperative cancellation: sets status only if not already terminal.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let path = self.db_path.clone();
        let id_owned = id.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = connect(&path)?;
            let n = conn.execute(
                "UPDATE jobs SET status='canceled', updated_at=? WHERE id=? AND status IN ('queued','running')",
                params![now, id_owned],
            )?;
            Ok(n)
        })
        .await??;
        if changed == 1 {
            if let Some(job) = self.get(id).await? {
                self.notify(&job, JobEventKind::StatusChanged);
            }
        }
        Ok(changed == 1)
    }

    /// Updates progress and returns `true` if this write crossed a new
    /// 5%-bucket boundary (used to decide whether to notify).
    pub async fn update_progress(&self, id: &str, progress: f64) -> Result<bool> {
        let progress = progress.clamp(0.0, 1.0);
        let previous = self.get(id).await?.map(|j| j.progress).unwrap_or(0.0);
        let path = self.db_path.clone();
        let id_owned = id.to_string();
        let now = Utc::now().to_rfc3339();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = connect(&path)?;
            conn.execute("UPDATE jobs SET progress=?, updated_at=? WHERE id=?", params![progress, now, id_owned])?;
            Ok(())
        })
        .await??;
        let crossed = (previous * 20.0).floor() as i64 != (progress * 20.0).floor() as i64;
        if crossed {
            if let Some(job) = self.get(id).await? {
                self.notify(&job, JobEventKind::ProgressBucket);
            }
        }
        Ok(crossed)
    }

    /// Fetch up to `limit` succeeded-but-not-yet-injected jobs for a
    /// conversation and mark them injected in the same call (§4.6 "Result
    /// injection") so a later turn never replays the same summary twice.
    pub async fn fetch_injectable(&self, conversation_id: &str, limit: usize) -> Result<Vec<Job>> {
        let path = self.db_path.clone();
        let conversation_id = conversation_id.to_string();
        let jobs = tokio::task::spawn_blocking(move || -> Result<Vec<Job>> {
            let conn = connect(&path)?;
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM jobs WHERE conversation_id=? AND status='succeeded' AND injected=0 \
                 ORDER BY created_at ASC LIMIT ?"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![conversation_id, limit as i64], row_to_job)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await??;

        if !jobs.is_empty() {
            let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
            let path = self.db_path.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut conn = connect(&path)?;
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute("UPDATE jobs SET injected=1 WHERE id=?", [id])?;
                }
                tx.commit()?;
                Ok(())
            })
            .await??;
        }
        Ok(jobs)
    }

    /// Crash recovery (§4.6): every `running` job was mid-execution when the
    /// process died, so it is requeued; at-least-once plus idempotency
    /// prevents user-visible duplication.
    pub async fn requeue_stuck_running(&self) -> Result<Vec<String>> {
        let path = self.db_path.clone();
        let now = Utc::now().to_rfc3339();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = connect(&path)?;
            let mut stmt = conn.prepare("SELECT id FROM jobs WHERE status='running' ORDER BY created_at ASC")?;
            let ids: Vec<String> = stmt.query_map([], |r| r.get(0))?.collect::<std::result::Result<_, _>>()?;
            for id in &ids {
                conn.execute("UPDATE jobs SET status='queued', updated_at=? WHERE id=?", params![now, id])?;
            }
            Ok(ids)
        })
        .await?
    }

    pub async fn list_queued_ids_in_order(&self) -> Result<Vec<String>> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = connect(&path)?;
            let mut stmt = conn.prepare("SELECT id FROM jobs WHERE status='queued' ORDER BY created_at ASC")?;
            let ids = stmt.query_map([], |r| r.get(0))?.collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
        .await?
    }
}

fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          job_type TEXT NOT NULL,
          status TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          progress REAL NOT NULL DEFAULT 0,
          result_json TEXT,
          error TEXT,
          attempts INTEGER NOT NULL DEFAULT 0,
          max_attempts INTEGER NOT NULL DEFAULT 1,
          conversation_id TEXT NOT NULL,
          idempotency_key TEXT NOT NULL,
          run_after_ts TEXT NOT NULL,
          injected INTEGER NOT NULL DEFAULT 0,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS jobs_conversation_id ON jobs(conversation_id);
        CREATE INDEX IF NOT EXISTS jobs_status ON jobs(status);
        CREATE INDEX IF NOT EXISTS jobs_updated_at ON jobs(updated_at);
        CREATE INDEX IF NOT EXISTS jobs_type_key ON jobs(job_type, idempotency_key);
        CREATE INDEX IF NOT EXISTS jobs_run_after_ts ON jobs(run_after_ts);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("jobs.sqlite")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_then_claim_then_succeed() {
        let (_dir, store) = open_store().await;
        let job = store
            .create_and_enqueue("web_search".into(), "c1".into(), json!({"q": "rust"}), None, 3, 300, false)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        assert!(store.try_claim(&job.id).await.unwrap());
        assert!(!store.try_claim(&job.id).await.unwrap(), "second claim must fail CAS");

        store.mark_succeeded(&job.id, json!({"summary": "ok"})).await.unwrap();
        let reloaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Succeeded);
        assert_eq!(reloaded.attempts, 1);
    }

    #[tokio::test]
    async fn idempotent_create_reuses_active_job() {
        let (_dir, store) = open_store().await;
        let a = store
            .create_and_enqueue("evidence_pack".into(), "c1".into(), json!({}), Some("k".into()), 3, 600, false)
            .await
            .unwrap();
        let b = store
            .create_and_enqueue("evidence_pack".into(), "c1".into(), json!({}), Some("k".into()), 3, 600, false)
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn force_new_bypasses_reuse() {
        let (_dir, store) = open_store().await;
        let a = store
            .create_and_enqueue("evidence_pack".into(), "c1".into(), json!({}), Some("k".into()), 3, 600, false)
            .await
            .unwrap();
        let b = store
            .create_and_enqueue("evidence_pack".into(), "c1".into(), json!({}), Some("k".into()), 3, 600, true)
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn succeeded_job_outside_ttl_is_not_reused() {
        let (_dir, store) = open_store().await;
        let a = store
            .create_and_enqueue("evidence_pack".into(), "c1".into(), json!({}), Some("k".into()), 3, 1, false)
            .await
            .unwrap();
        store.try_claim(&a.id).await.unwrap();
        store.mark_succeeded(&a.id, json!({"summary": "done"})).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let b = store
            .create_and_enqueue("evidence_pack".into(), "c1".into(), json!({}), Some("k".into()), 3, 1, false)
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn terminal_status_never_transitions() {
        let (_dir, store) = open_store().await;
        let job = store
            .create_and_enqueue("web_search".into(), "c1".into(), json!({}), None, 1, 0, false)
            .await
            .unwrap();
        store.try_claim(&job.id).await.unwrap();
        store.mark_succeeded(&job.id, json!({})).await.unwrap();

        // A stray failure write after success must not revert the status —
        // the UPDATE is gated on status='running', which no longer matches.
        store.mark_failed(&job.id, "late error".into(), true, 1).await.unwrap();
        let reloaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn injected_implies_succeeded_and_is_not_replayed() {
        let (_dir, store) = open_store().await;
        let job = store
            .create_and_enqueue("web_search".into(), "c1".into(), json!({}), None, 1, 0, false)
            .await
            .unwrap();
        store.try_claim(&job.id).await.unwrap();
        store.mark_succeeded(&job.id, json!({"summary": "s"})).await.unwrap();

        let first = store.fetch_injectable("c1", 4).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first[0].injected);

        let second = store.fetch_injectable("c1", 4).await.unwrap();
        assert!(second.is_empty());

        let reloaded = store.get(&job.id).await.unwrap().unwrap();
        assert!(reloaded.injected);
        assert_eq!(reloaded.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn crash_recovery_requeues_running_jobs() {
        let (_dir, store) = open_store().await;
        let job = store
            .create_and_enqueue("kg_extract".into(), "c1".into(), json!({}), None, 3, 0, false)
            .await
            .unwrap();
        store.try_claim(&job.id).await.unwrap();

        let requeued = store.requeue_stuck_running().await.unwrap();
        assert_eq!(requeued, vec![job.id.clone()]);
        let reloaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Queued);
    }
}
