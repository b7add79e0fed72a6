pub mod extractor;
pub mod ontology;
pub mod store;

pub use extractor::{extract, extract_incremental, extract_stream, ChunkExtraction, ExtractedEntity, ExtractedRelation, ExtractionResult};
pub use ontology::{default_ontology, Ontology};
pub use store::{
    stable_entity_uuid, InMemoryKnowledgeGraphStore, KgChunk, KgEdge, KgEntity, KgGraphData, KgNode, KgRelation,
    KnowledgeGraphStore,
};
