//! Hybrid FTS + embedding + rerank retrieval (§4.3 "Hybrid retrieval").
//!
//! Grounded on `original_source/backend/kb_retrieval.py::KBHybridRetriever`.
//! Streaming top-K scoring keeps at most `top_k` candidates in a min-heap
//! instead of materializing every cosine score, matching the Python's
//! `heapq` use.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::Gateway;
use crate::kb::rerank::{RerankCandidate, Reranker};
use crate::kb::store::{ChunkRow, KbScope, KbStore};
use crate::cache::TtlCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrievalMode {
    Fts,
    Semantic,
    Hybrid,
}

impl RetrievalMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "fts" => Self::Fts,
            "semantic" => Self::Semantic,
            _ => Self::Hybrid,
        }
    }

    fn wants_fts(self) -> bool {
        matches!(self, Self::Fts | Self::Hybrid)
    }

    fn wants_semantic(self) -> bool {
        matches!(self, Self::Semantic | Self::Hybrid)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetrieverQuery {
    pub query: String,
    pub scope: KbScope,
    pub limit: usize,
    pub mode: RetrievalMode,
    pub embedding_model_spec: String,
    pub enable_rerank: bool,
    pub rerank_model_spec: String,
    pub semantic_pool: usize,
    pub initial_k: Option<usize>,
}

impl Default for RetrievalMode {
    fn default() -> Self {
        Self::Hybrid
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub title: String,
    pub source: String,
    pub categories: Vec<String>,
    pub agent_ids: Vec<String>,
    pub semantic_score: f64,
    pub fts_score: f64,
    pub fts_quality: f64,
    pub rerank_score: Option<f64>,
    pub retrieval: Vec<String>,
}

fn heuristic_score(hit: &SearchHit) -> f64 {
    0.65 * hit.semantic_score + 0.35 * hit.fts_quality
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom <= 0.0 {
        0.0
    } else {
        dot / denom
    }
}

fn fts_quality(score: f64) -> f64 {
    1.0 / (1.0 + score.abs())
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry(f64);

impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so `BinaryHeap` (a max-heap) behaves as a min-heap keyed
        // on score, matching `heapq`'s default ordering.
        other.0.partial_cmp(&self.0).unwrap_or(Ordering::Equal)
    }
}

pub struct HybridRetriever {
    kb: Arc<KbStore>,
    gateway: Arc<Gateway>,
    reranker: Arc<Reranker>,
    query_embedding_cache: TtlCache<(String, String), Vec<f32>>,
    search_cache: TtlCache<String, Vec<SearchHit>>,
    revision: AtomicU64,
}

impl HybridRetriever {
    pub fn new(kb: Arc<KbStore>, gateway: Arc<Gateway>, reranker: Arc<Reranker>) -> Self {
        Self {
            kb,
            gateway,
            reranker,
            query_embedding_cache: TtlCache::new(256, Duration::from_secs(3600)),
            search_cache: TtlCache::new(256, Duration::from_secs(90)),
            revision: AtomicU64::new(0),
        }
    }

    /// Call after any write that should invalidate cached search results.
    pub fn bump_revision(&self) {
        self.revision.fetch_add(1, AtomicOrdering::Relaxed);
    }

    async fn semantic_search(
        &self,
        query: &str,
        embedding_model_spec: &str,
        scope: &KbScope,
        pool: usize,
        top_k: usize,
        timeout: Duration,
    ) -> Vec<SearchHit> {
        let top_k = top_k.max(1);
        let chunks = match self.kb.list_chunks(scope.clone(), pool).await {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        if chunks.is_empty() {
            return Vec::new();
        }

        let cache_key = (embedding_model_spec.to_string(), query.to_string());
        let qvec = match self.query_embedding_cache.get(&cache_key).await {
            Some(v) => v,
            None => {
                let vecs = self.gateway.embed(embedding_model_spec, &[query.to_string()], timeout).await;
                let Some(vecs) = vecs else { return Vec::new() };
                let Some(qvec) = vecs.into_iter().next().filter(|v| !v.is_empty()) else {
                    return Vec::new();
                };
                self.query_embedding_cache.set(cache_key, qvec.clone()).await;
                qvec
            }
        };

        let chunks_by_id: HashMap<String, ChunkRow> =
            chunks.into_iter().map(|c| (c.chunk_id.clone(), c)).collect();
        let chunk_ids: Vec<String> = chunks_by_id.keys().cloned().collect();

        let mut heap: BinaryHeap<(HeapEntry, String)> = BinaryHeap::new();
        let batch_size = 128;
        for batch in chunk_ids.chunks(batch_size) {
            let batch_vec = batch.to_vec();
            let mut embeddings = match self
                .kb
                .get_chunk_embeddings(batch_vec.clone(), embedding_model_spec.to_string())
                .await
            {
                Ok(e) => e,
                Err(_) => HashMap::new(),
            };

            let missing: Vec<String> =
                batch.iter().filter(|id| !embeddings.contains_key(*id)).cloned().collect();
            if !missing.is_empty() {
                let embed_batch = 32;
                let mut new_items: HashMap<String, Vec<f32>> = HashMap::new();
                for part in missing.chunks(embed_batch) {
                    let texts: Vec<String> =
                        part.iter().map(|id| chunks_by_id.get(id).map(|c| c.text.clone()).unwrap_or_default()).collect();
                    if let Some(vecs) = self.gateway.embed(embedding_model_spec, &texts, timeout).await {
                        if vecs.len() == part.len() {
                            for (id, v) in part.iter().zip(vecs.into_iter()) {
                                if !v.is_empty() {
                                    new_items.insert(id.clone(), v);
                                }
                            }
                        }
                    }
                }
                if !new_items.is_empty() {
                    let _ = self
                        .kb
                        .set_chunk_embeddings(new_items.clone(), embedding_model_spec.to_string())
                        .await;
                    embeddings.extend(new_items);
                }
            }

            for (cid, vector) in embeddings {
                if vector.is_empty() {
                    continue;
                }
                let score = cosine(&qvec, &vector);
                if heap.len() < top_k {
                    heap.push((HeapEntry(score), cid));
                } else if let Some((worst, _)) = heap.peek() {
                    if score > worst.0 {
                        heap.pop();
                        heap.push((HeapEntry(score), cid));
                    }
                }
            }
        }

        let mut scored: Vec<(f64, String)> = heap.into_iter().map(|(e, cid)| (e.0, cid)).collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut out = Vec::with_capacity(scored.len());
        for (score, cid) in scored.into_iter().take(top_k) {
            if let Some(c) = chunks_by_id.get(&cid) {
                out.push(SearchHit {
                    chunk_id: c.chunk_id.clone(),
                    doc_id: c.doc_id.clone(),
                    text: c.text.clone(),
                    title: c.title.clone(),
                    source: c.source.clone(),
                    categories: c.categories.clone(),
                    agent_ids: c.agent_ids.clone(),
                    semantic_score: score,
                    fts_score: 0.0,
                    fts_quality: 0.0,
                    rerank_score: None,
                    retrieval: vec!["semantic".to_string()],
                });
            }
        }
        out
    }

    pub async fn search(&self, query: RetrieverQuery, timeout: Duration) -> Vec<SearchHit> {
        let q = query.query.trim();
        if q.is_empty() {
            return Vec::new();
        }
        let limit = query.limit.clamp(1, 50);
        let initial_k = query.initial_k.unwrap_or_else(|| (limit * 4).max(24)).max(limit);

        let cache_key = serde_json::json!({
            "rev": self.revision.load(AtomicOrdering::Relaxed),
            "q": q,
            "scope": format!("{:?}", query.scope),
            "limit": limit,
            "mode": format!("{:?}", query.mode),
            "embedding_model_spec": query.embedding_model_spec,
            "enable_rerank": query.enable_rerank,
            "rerank_model_spec": query.rerank_model_spec,
            "semantic_pool": query.semantic_pool,
            "initial_k": initial_k,
        })
        .to_string();
        if let Some(cached) = self.search_cache.get(&cache_key).await {
            return cached;
        }

        let mut combined: HashMap<String, SearchHit> = HashMap::new();

        if query.mode.wants_fts() {
            if let Ok(fts_hits) = self.kb.search(q.to_string(), query.scope.clone(), initial_k).await {
                for h in fts_hits {
                    let entry = combined.entry(h.chunk_id.clone()).or_insert_with(|| SearchHit {
                        chunk_id: h.chunk_id.clone(),
                        doc_id: h.doc_id.clone(),
                        text: h.text.clone(),
                        title: h.title.clone(),
                        source: h.source.clone(),
                        categories: h.categories.clone(),
                        agent_ids: h.agent_ids.clone(),
                        semantic_score: 0.0,
                        fts_score: 0.0,
                        fts_quality: 0.0,
                        rerank_score: None,
                        retrieval: Vec::new(),
                    });
                    entry.fts_score = h.score;
                    entry.fts_quality = fts_quality(h.score);
                    if !entry.retrieval.contains(&"fts".to_string()) {
                        entry.retrieval.push("fts".to_string());
                    }
                }
            }
        }

        if query.mode.wants_semantic() && !query.embedding_model_spec.is_empty() {
            let sem_hits = self
                .semantic_search(
                    q,
                    &query.embedding_model_spec,
                    &query.scope,
                    query.semantic_pool,
                    initial_k,
                    timeout,
                )
                .await;
            for h in sem_hits {
                let entry = combined.entry(h.chunk_id.clone()).or_insert_with(|| SearchHit {
                    chunk_id: h.chunk_id.clone(),
                    doc_id: h.doc_id.clone(),
                    text: h.text.clone(),
                    title: h.title.clone(),
                    source: h.source.clone(),
                    categories: h.categories.clone(),
                    agent_ids: h.agent_ids.clone(),
                    semantic_score: 0.0,
                    fts_score: 0.0,
                    fts_quality: 0.0,
                    rerank_score: None,
                    retrieval: Vec::new(),
                });
                entry.semantic_score = h.semantic_score;
                if !entry.retrieval.contains(&"semantic".to_string()) {
                    entry.retrieval.push("semantic".to_string());
                }
            }
        }

        if combined.is_empty() {
            return Vec::new();
        }

        let mut pool_items: Vec<SearchHit> = combined.into_values().collect();
        pool_items.sort_by(|a, b| heuristic_score(b).partial_cmp(&heuristic_score(a)).unwrap_or(Ordering::Equal));
        let pool_cap = initial_k.max(limit * 6);
        pool_items.truncate(pool_cap);
        for item in &mut pool_items {
            item.retrieval.sort();
        }

        if query.enable_rerank && !query.rerank_model_spec.is_empty() {
            let candidates: Vec<RerankCandidate> = pool_items
                .iter()
                .map(|h| RerankCandidate {
                    text: h.text.clone(),
                    title: Some(h.title.clone()),
                    source: Some(h.source.clone()),
                })
                .collect();
            let ranking = self
                .reranker
                .rerank(&query.rerank_model_spec, q, &candidates, limit, timeout)
                .await;
            if !ranking.is_empty() {
                let mut out = Vec::with_capacity(ranking.len());
                for r in ranking {
                    if let Some(item) = pool_items.get(r.index) {
                        let mut item = item.clone();
                        item.rerank_score = Some(r.score);
                        out.push(item);
                    }
                }
                self.search_cache.set(cache_key, out.clone()).await;
                return out;
            }
        }

        pool_items.truncate(limit);
        self.search_cache.set(cache_key, pool_items.clone()).await;
        pool_items
    }

    /// Best-effort backfill of missing embeddings across the whole scope,
    /// reusing the same batching shape as `semantic_search`'s missing-vector
    /// top-up. `check_cancelled` mirrors the job runner's cooperative
    /// cancellation contract (§4.6).
    pub async fn index_embeddings(
        &self,
        embedding_model_spec: &str,
        scope: KbScope,
        pool: usize,
        timeout: Duration,
        check_cancelled: Option<&(dyn Fn() -> anyhow::Result<()> + Send + Sync)>,
    ) -> anyhow::Result<(usize, usize)> {
        let chunks = self.kb.list_chunks(scope, pool).await?;
        let total = chunks.len();
        let chunks_by_id: HashMap<String, ChunkRow> =
            chunks.into_iter().map(|c| (c.chunk_id.clone(), c)).collect();
        let chunk_ids: Vec<String> = chunks_by_id.keys().cloned().collect();

        let batch_size = 128;
        let embed_batch = 32;
        let mut indexed = 0usize;

        for batch in chunk_ids.chunks(batch_size) {
            if let Some(check) = check_cancelled {
                check()?;
            }
            let existing = self
                .kb
                .get_chunk_embeddings(batch.to_vec(), embedding_model_spec.to_string())
                .await?;
            let missing: Vec<String> =
                batch.iter().filter(|id| !existing.contains_key(*id)).cloned().collect();
            if missing.is_empty() {
                continue;
            }

            for part in missing.chunks(embed_batch) {
                if let Some(check) = check_cancelled {
                    check()?;
                }
                let texts: Vec<String> =
                    part.iter().map(|id| chunks_by_id.get(id).map(|c| c.text.clone()).unwrap_or_default()).collect();
                let Some(vecs) = self.gateway.embed(embedding_model_spec, &texts, timeout).await else { continue };
                if vecs.len() != part.len() {
                    continue;
                }
                let mut items = HashMap::new();
                for (id, v) in part.iter().zip(vecs.into_iter()) {
                    if !v.is_empty() {
                        items.insert(id.clone(), v);
                    }
                }
                if !items.is_empty() {
                    let count = items.len();
                    self.kb.set_chunk_embeddings(items, embedding_model_spec.to_string()).await?;
                    indexed += count;
                }
            }
        }

        Ok((indexed, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_empty_vectors_is_zero() {
        assert_eq!(cosine(&[], &[1.0]), 0.0);
    }

    #[test]
    fn fts_quality_maps_zero_to_one() {
        assert_eq!(fts_quality(0.0), 1.0);
    }

    #[test]
    fn fts_quality_decreases_as_score_magnitude_grows() {
        assert!(fts_quality(1.0) < fts_quality(0.1));
    }

    #[test]
    fn heuristic_blend_weights_semantic_higher() {
        let semantic_only = SearchHit {
            chunk_id: "a".into(),
            doc_id: "d".into(),
            text: String::new(),
            title: String::new(),
            source: String::new(),
            categories: vec![],
            agent_ids: vec![],
            semantic_score: 1.0,
            fts_score: 0.0,
            fts_quality: 0.0,
            rerank_score: None,
            retrieval: vec![],
        };
        let fts_only = SearchHit { semantic_score: 0.0, fts_quality: 1.0, ..semantic_only.clone() };
        assert!(heuristic_score(&semantic_only) > heuristic_score(&fts_only));
    }
}
