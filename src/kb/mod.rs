pub mod rerank;
pub mod retriever;
pub mod store;

pub use rerank::Reranker;
pub use retriever::{HybridRetriever, RetrievalMode, RetrieverQuery, SearchHit};
pub use store::{ChunkRow, FtsHit, KbDocument, KbDocumentMeta, KbScope, KbStore};
