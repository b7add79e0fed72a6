//! SQLite + FTS5 knowledge-base store (§3 "KB chunk", §6 `data/kb.sqlite`).
//!
//! Grounded on `original_source/backend/kb_store.py`, reworked onto the
//! teacher's `SqliteTaskQueue` idiom (`examples/ProdByBuddha-rust_agency/src/orchestrator/queue.rs`):
//! a `PathBuf` held by the store, one `rusqlite::Connection::open` per call
//! wrapped in `spawn_blocking` — no pooling, matching the teacher's shape.
//!
//! Deviation from the Python source: `kb_chunk_embeddings` is keyed by the
//! composite `(chunk_id, model_spec)` rather than `chunk_id` alone, per §3's
//! "Embeddings live in a separate table keyed by `(chunk_id, embedding_model_spec)`
//! to support multiple models concurrently" — recorded in DESIGN.md.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbDocument {
    pub id: String,
    pub title: String,
    pub source: String,
    pub text: String,
    pub categories: Vec<String>,
    pub agent_ids: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbDocumentMeta {
    pub id: String,
    pub title: String,
    pub source: String,
    pub categories: Vec<String>,
    pub agent_ids: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtsHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub score: f64,
    pub text: String,
    pub title: String,
    pub source: String,
    pub categories: Vec<String>,
    pub agent_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub title: String,
    pub source: String,
    pub categories: Vec<String>,
    pub agent_ids: Vec<String>,
    pub created_at: String,
}

/// Scope shared by `search` and `list_chunks`: doc-id allowlist takes
/// precedence, then agent-id membership, then category membership — mirrors
/// the `WHERE` clause construction in `kb_store.py::search`.
#[derive(Debug, Clone, Default)]
pub struct KbScope {
    pub agent_id: Option<String>,
    pub doc_ids: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
}

pub struct KbStore {
    db_path: PathBuf,
}

impl KbStore {
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
        Ok(Self { db_path })
    }

    pub async fn add_document(
        &self,
        doc_id: String,
        title: String,
        source: String,
        text: String,
        categories: Vec<String>,
        agent_ids: Vec<String>,
    ) -> Result<usize> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut conn = connect(&path)?;
            let chunks = chunk_text(&text, 800, 100);
            let created_at = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO kb_documents(id,title,source,text,categories_json,agent_ids_json,created_at) VALUES(?,?,?,?,?,?,?)",
                rusqlite::params![
                    doc_id,
                    title,
                    source,
                    text,
                    serde_json::to_string(&categories)?,
                    serde_json::to_string(&agent_ids)?,
                    created_at,
                ],
            )?;
            for chunk in &chunks {
                let chunk_id = Uuid::new_v4().simple().to_string();
                tx.execute(
                    "INSERT INTO kb_chunks(id,doc_id,text,created_at) VALUES(?,?,?,?)",
                    rusqlite::params![chunk_id, doc_id, chunk, created_at],
                )?;
                tx.execute(
                    "INSERT INTO kb_chunks_fts(chunk_id,doc_id,text) VALUES(?,?,?)",
                    rusqlite::params![chunk_id, doc_id, chunk],
                )?;
            }
            tx.commit()?;
            Ok(chunks.len())
        })
        .await?
    }

    /// Delete-then-re-add by `doc_id`, used by `office_ingest`'s deterministic
    /// replace semantics.
    pub async fn replace_document(
        &self,
        doc_id: String,
        title: String,
        source: String,
        text: String,
        categories: Vec<String>,
        agent_ids: Vec<String>,
    ) -> Result<usize> {
        self.delete_document(doc_id.clone()).await?;
        self.add_document(doc_id, title, source, text, categories, agent_ids).await
    }

    pub async fn get_document(&self, doc_id: String) -> Result<Option<KbDocument>> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<KbDocument>> {
            let conn = connect(&path)?;
            let row = conn.query_row(
                "SELECT id,title,source,text,categories_json,agent_ids_json,created_at FROM kb_documents WHERE id=?",
                [&doc_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, String>(6)?,
                    ))
                },
            );
            let (id, title, source, mut text, categories_json, agent_ids_json, created_at) = match row {
                Ok(r) => r,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if text.is_empty() {
                let mut stmt = conn.prepare("SELECT text FROM kb_chunks WHERE doc_id=? ORDER BY created_at ASC")?;
                let rows = stmt.query_map([&id], |r| r.get::<_, String>(0))?;
                let mut parts = Vec::new();
                for r in rows {
                    parts.push(r?);
                }
                text = parts.join("\n");
            }
            Ok(Some(KbDocument {
                id,
                title,
                source,
                text,
                categories: serde_json::from_str(&categories_json).unwrap_or_default(),
                agent_ids: serde_json::from_str(&agent_ids_json).unwrap_or_default(),
                created_at,
            }))
        })
        .await?
    }

    pub async fn list_documents(&self) -> Result<Vec<KbDocumentMeta>> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<KbDocumentMeta>> {
            let conn = connect(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id,title,source,categories_json,agent_ids_json,created_at FROM kb_documents ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(KbDocumentMeta {
                    id: r.get(0)?,
                    title: r.get(1)?,
                    source: r.get(2)?,
                    categories: serde_json::from_str(&r.get::<_, String>(3)?).unwrap_or_default(),
                    agent_ids: serde_json::from_str(&r.get::<_, String>(4)?).unwrap_or_default(),
                    created_at: r.get(5)?,
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await?
    }

    pub async fn delete_document(&self, doc_id: String) -> Result<bool> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = connect(&path)?;
            conn.execute("DELETE FROM kb_chunks_fts WHERE doc_id=?", [&doc_id])?;
            conn.execute("DELETE FROM kb_chunk_embeddings WHERE chunk_id IN (SELECT id FROM kb_chunks WHERE doc_id=?)", [&doc_id])?;
            conn.execute("DELETE FROM kb_chunks WHERE doc_id=?", [&doc_id])?;
            let changed = conn.execute("DELETE FROM kb_documents WHERE id=?", [&doc_id])?;
            Ok(changed > 0)
        })
        .await?
    }

    pub async fn set_document_agents(&self, doc_id: String, agent_ids: Vec<String>) -> Result<bool> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = connect(&path)?;
            let changed = conn.execute(
                "UPDATE kb_documents SET agent_ids_json=? WHERE id=?",
                rusqlite::params![serde_json::to_string(&agent_ids)?, doc_id],
            )?;
            Ok(changed > 0)
        })
        .await?
    }

    pub async fn set_document_categories(&self, doc_id: String, categories: Vec<String>) -> Result<bool> {
        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<String> = categories
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .collect();
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = connect(&path)?;
            let changed = conn.execute(
                "UPDATE kb_documents SET categories_json=? WHERE id=?",
                rusqlite::params![serde_json::to_string(&deduped)?, doc_id],
            )?;
            Ok(changed > 0)
        })
        .await?
    }

    /// BM25 full-text search. `fts5` quotes the raw query as a phrase match
    /// (`_fts_query` in the Python source), so special characters don't
    /// break MATCH syntax.
    pub async fn search(&self, query: String, scope: KbScope, limit: usize) -> Result<Vec<FtsHit>> {
        let fts_query = fts_query(&query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<FtsHit>> {
            let conn = connect(&path)?;
            let (where_sql, mut params) = build_where(&scope);
            let sql = format!(
                "SELECT f.chunk_id, f.doc_id, f.text, bm25(kb_chunks_fts) AS score, \
                 d.title, d.source, d.categories_json, d.agent_ids_json \
                 FROM kb_chunks_fts f JOIN kb_documents d ON d.id = f.doc_id \
                 {where_sql} {and_or_where} kb_chunks_fts MATCH ? \
                 ORDER BY score ASC LIMIT ?",
                where_sql = where_sql,
                and_or_where = if where_sql.is_empty() { "WHERE" } else { "AND" },
            );
            // Anonymous `?` placeholders bind in left-to-right textual order,
            // so the scope's WHERE params (appearing first in the SQL) must
            // come before the MATCH/LIMIT params appended here.
            params.push(Box::new(fts_query));
            params.push(Box::new(limit as i64));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter().map(|b| b.as_ref())), |r| {
                Ok(FtsHit {
                    chunk_id: r.get(0)?,
                    doc_id: r.get(1)?,
                    text: r.get(2)?,
                    score: r.get(3)?,
                    title: r.get(4)?,
                    source: r.get(5)?,
                    categories: serde_json::from_str(&r.get::<_, String>(6)?).unwrap_or_default(),
                    agent_ids: serde_json::from_str(&r.get::<_, String>(7)?).unwrap_or_default(),
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await?
    }

    pub async fn list_chunks(&self, scope: KbScope, limit: usize) -> Result<Vec<ChunkRow>> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ChunkRow>> {
            let conn = connect(&path)?;
            let (where_sql, mut params) = build_where(&scope);
            let sql = format!(
                "SELECT c.id, c.doc_id, c.text, c.created_at, d.title, d.source, d.categories_json, d.agent_ids_json \
                 FROM kb_chunks c JOIN kb_documents d ON d.id = c.doc_id \
                 {where_sql} ORDER BY c.created_at DESC LIMIT ?",
                where_sql = where_sql,
            );
            params.push(Box::new(limit as i64));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params.iter().map(|b| b.as_ref())), |r| {
                Ok(ChunkRow {
                    chunk_id: r.get(0)?,
                    doc_id: r.get(1)?,
                    text: r.get(2)?,
                    created_at: r.get(3)?,
                    title: r.get(4)?,
                    source: r.get(5)?,
                    categories: serde_json::from_str(&r.get::<_, String>(6)?).unwrap_or_default(),
                    agent_ids: serde_json::from_str(&r.get::<_, String>(7)?).unwrap_or_default(),
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await?
    }

    pub async fn get_chunk_embeddings(&self, chunk_ids: Vec<String>, model_spec: String) -> Result<HashMap<String, Vec<f32>>> {
        if chunk_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<HashMap<String, Vec<f32>>> {
            let conn = connect(&path)?;
            let placeholders = chunk_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT chunk_id, vector_json FROM kb_chunk_embeddings WHERE model_spec=? AND chunk_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut all_params: Vec<&dyn rusqlite::ToSql> = vec![&model_spec];
            all_params.extend(chunk_ids.iter().map(|c| c as &dyn rusqlite::ToSql));
            let rows = stmt.query_map(params_from_iter(all_params), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            let mut out = HashMap::new();
            for row in rows {
                let (chunk_id, vector_json) = row?;
                if let Ok(v) = serde_json::from_str::<Vec<f32>>(&vector_json) {
                    out.insert(chunk_id, v);
                }
            }
            Ok(out)
        })
        .await?
    }

    pub async fn set_chunk_embeddings(&self, items: HashMap<String, Vec<f32>>, model_spec: String) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut conn = connect(&path)?;
            let created_at = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            let count = items.len();
            for (chunk_id, vector) in items {
                tx.execute(
                    "INSERT INTO kb_chunk_embeddings(chunk_id,model_spec,vector_json,created_at) VALUES(?,?,?,?) \
                     ON CONFLICT(chunk_id, model_spec) DO UPDATE SET vector_json=excluded.vector_json, created_at=excluded.created_at",
                    rusqlite::params![chunk_id, model_spec, serde_json::to_string(&vector)?, created_at],
                )?;
            }
            tx.commit()?;
            Ok(count)
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
        CREATE TABLE IF NOT EXISTS kb_documents (
          id TEXT PRIMARY KEY,
          title TEXT NOT NULL,
          source TEXT NOT NULL,
          text TEXT NOT NULL DEFAULT '',
          categories_json TEXT NOT NULL DEFAULT '[]',
          agent_ids_json TEXT NOT NULL DEFAULT '[]',
          created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kb_chunks (
          id TEXT PRIMARY KEY,
          doc_id TEXT NOT NULL REFERENCES kb_documents(id) ON DELETE CASCADE,
          text TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS kb_chunks_fts USING fts5(
          chunk_id UNINDEXED,
          doc_id UNINDEXED,
          text,
          tokenize = 'unicode61'
        );

        CREATE TABLE IF NOT EXISTS kb_chunk_embeddings (
          chunk_id TEXT NOT NULL,
          model_spec TEXT NOT NULL,
          vector_json TEXT NOT NULL,
          created_at TEXT NOT NULL,
          PRIMARY KEY (chunk_id, model_spec)
        );

        CREATE INDEX IF NOT EXISTS kb_chunks_doc_id ON kb_chunks(doc_id);
        CREATE INDEX IF NOT EXISTS kb_chunk_embeddings_model ON kb_chunk_embeddings(model_spec);
        ",
    )?;
    Ok(())
}

fn build_where(scope: &KbScope) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut clauses = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(doc_ids) = &scope.doc_ids {
        if !doc_ids.is_empty() {
            let placeholders = doc_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            clauses.push(format!("d.id IN ({placeholders})"));
            for id in doc_ids {
                params.push(Box::new(id.clone()));
            }
        }
    }
    if let Some(agent_id) = &scope.agent_id {
        clauses.push("d.agent_ids_json LIKE ?".to_string());
        params.push(Box::new(format!("%\"{agent_id}\"%")));
    }
    if let Some(categories) = &scope.categories {
        let cats: Vec<&String> = categories.iter().filter(|c| !c.trim().is_empty()).collect();
        if !cats.is_empty() {
            let ors = cats.iter().map(|_| "d.categories_json LIKE ?").collect::<Vec<_>>().join(" OR ");
            clauses.push(format!("({ors})"));
            for c in cats {
                params.push(Box::new(format!("%\"{c}\"%")));
            }
        }
    }

    let where_sql = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
    (where_sql, params)
}

fn fts_query(q: &str) -> String {
    let cleaned = q.trim().replace('"', " ");
    if cleaned.is_empty() {
        String::new()
    } else {
        format!("\"{cleaned}\"")
    }
}

/// Stable character-window chunker shared with the KG extractor's splitter
/// shape (different defaults: KB uses 800/100, KG uses 1200/120).
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    let step = (chunk_size.saturating_sub(overlap)).max(1);
    let mut chunks = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let end = (i + chunk_size).min(chars.len());
        let chunk: String = chars[i..end].iter().collect::<String>().trim().to_string();
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        i += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_get_document_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = KbStore::open(dir.path().join("kb.sqlite")).await.unwrap();
        store
            .add_document(
                "doc-1".into(),
                "Title".into(),
                "source".into(),
                "hello world, this is a test document about council deliberation".into(),
                vec!["general".into()],
                vec!["agent-1".into()],
            )
            .await
            .unwrap();

        let doc = store.get_document("doc-1".into()).await.unwrap().unwrap();
        assert_eq!(doc.title, "Title");
        assert!(doc.text.contains("deliberation"));
    }

    #[tokio::test]
    async fn search_scoped_to_doc_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = KbStore::open(dir.path().join("kb.sqlite")).await.unwrap();
        store
            .add_document("doc-1".into(), "T1".into(), "s".into(), "apples and oranges".into(), vec![], vec![])
            .await
            .unwrap();
        store
            .add_document("doc-2".into(), "T2".into(), "s".into(), "bananas and grapes".into(), vec![], vec![])
            .await
            .unwrap();

        let hits = store
            .search(
                "apples".into(),
                KbScope { doc_ids: Some(vec!["doc-1".into()]), ..Default::default() },
                6,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "doc-1");

        let no_hits = store
            .search(
                "apples".into(),
                KbScope { doc_ids: Some(vec!["doc-2".into()]), ..Default::default() },
                6,
            )
            .await
            .unwrap();
        assert!(no_hits.is_empty());
    }

    #[tokio::test]
    async fn set_then_get_chunk_embeddings_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = KbStore::open(dir.path().join("kb.sqlite")).await.unwrap();
        let mut items = HashMap::new();
        items.insert("chunk-1".to_string(), vec![0.1f32, 0.2, 0.3]);
        store.set_chunk_embeddings(items, "openrouter:text-embedding-3-small".into()).await.unwrap();

        let fetched = store
            .get_chunk_embeddings(vec!["chunk-1".into()], "openrouter:text-embedding-3-small".into())
            .await
            .unwrap();
        assert_eq!(fetched.get("chunk-1"), Some(&vec![0.1f32, 0.2, 0.3]));

        let other_model = store.get_chunk_embeddings(vec!["chunk-1".into()], "ollama:nomic".into()).await.unwrap();
        assert!(other_model.is_empty());
    }

    #[test]
    fn chunker_produces_overlapping_windows() {
        let text = "a".repeat(1000);
        let chunks = chunk_text(&text, 800, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 800);
    }
}
