//! Append-only structured event log, one file per conversation (§3 "Trace
//! event", §6 `data/traces/{id}.jsonl`, §5 "Trace files").
//!
//! Grounded on `original_source/backend/trace_store.py`. A single-writer
//! assumption per conversation is acceptable per §5, so a per-conversation
//! `tokio::sync::Mutex` plus `OpenOptions::append` is enough; there is no
//! cross-process coordination.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

pub struct TraceSink {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TraceSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, locks: Mutex::new(HashMap::new()) }
    }

    fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{conversation_id}.jsonl"))
    }

    async fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append one event, stamping `ts` and `conversation_id` onto whatever
    /// payload the caller built.
    pub async fn append(&self, conversation_id: &str, event_type: &str, mut payload: Value) -> Result<()> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(conversation_id);

        if let Some(obj) = payload.as_object_mut() {
            obj.insert("ts".to_string(), Value::String(Utc::now().to_rfc3339()));
            obj.insert("conversation_id".to_string(), Value::String(conversation_id.to_string()));
            obj.insert("type".to_string(), Value::String(event_type.to_string()));
        }

        let line = serde_json::to_string(&payload)?;
        let path_clone = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path_clone)?;
            writeln!(file, "{line}")?;
            file.flush()?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn read_events(&self, conversation_id: &str, limit: usize) -> Result<Vec<Value>> {
        let path = self.path_for(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let body = tokio::fs::read_to_string(&path).await?;
        let mut events: Vec<Value> = body
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if events.len() > limit {
            events = events.split_off(events.len() - limit);
        }
        Ok(events)
    }

    pub async fn delete(&self, conversation_id: &str) -> Result<()> {
        let path = self.path_for(conversation_id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TraceSink::new(dir.path().to_path_buf());
        sink.append("c1", "stage_start", json!({"stage": "stage1"})).await.unwrap();
        sink.append("c1", "stage_complete", json!({"stage": "stage1", "count": 2})).await.unwrap();

        let events = sink.read_events("c1", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "stage_start");
        assert_eq!(events[1]["count"], 2);
    }

    #[tokio::test]
    async fn read_events_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TraceSink::new(dir.path().to_path_buf());
        for i in 0..5 {
            sink.append("c1", "stage_start", json!({"i": i})).await.unwrap();
        }
        let events = sink.read_events("c1", 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["i"], 3);
        assert_eq!(events[1]["i"], 4);
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TraceSink::new(dir.path().to_path_buf());
        sink.append("c1", "stage_start", json!({})).await.unwrap();
        sink.delete("c1").await.unwrap();
        assert_eq!(sink.read_events("c1", 10).await.unwrap().len(), 0);
    }
}
