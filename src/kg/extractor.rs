//! LLM-based entity/relation extraction (§4.4 "KG extraction").
//!
//! Grounded on `original_source/backend/kg_extractor.py`: strict-JSON
//! schema, a single safe-mode retry when a chunk comes back totally empty,
//! ontology-based type filtering, and the 1200/120 char-window chunker
//! (reusing `kb::store::chunk_text`, which implements the identical
//! slice-then-trim algorithm as `split_text`/`iter_split_text`).

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::{ChatMessage, Gateway};
use crate::kb::store::chunk_text;
use crate::kg::ontology::Ontology;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    pub summary: String,
    pub attributes: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub source: String,
    pub source_type: String,
    pub target: String,
    pub target_type: String,
    pub relation: String,
    pub fact: String,
    pub attributes: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkExtraction {
    pub index: usize,
    pub text: String,
    pub text_len: usize,
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

#[derive(Debug, Deserialize, Default)]
struct RawEntity {
    name: Option<String>,
    #[serde(rename = "type")]
    entity_type: Option<String>,
    summary: Option<String>,
    #[serde(default)]
    attributes: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct RawRelation {
    source: Option<String>,
    source_type: Option<String>,
    target: Option<String>,
    target_type: Option<String>,
    relation: Option<String>,
    fact: Option<String>,
    #[serde(default)]
    attributes: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relations: Vec<RawRelation>,
}

fn parse_json_object(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

async fn extract_one(
    gateway: &Gateway,
    model_spec: &str,
    text: &str,
    ontology: &Ontology,
    timeout: Duration,
    safe_mode: bool,
    output_language: &str,
) -> RawExtraction {
    let mut system = if output_language == "en" {
        "You are a strict JSON-only information extractor.\nReturn ONLY a valid JSON object.\n".to_string()
    } else {
        "你是一个严格输出 JSON 的信息抽取器。\n只允许输出一个 JSON 对象，不要输出任何额外文字。\n".to_string()
    };
    if safe_mode {
        system.push_str(
            "Safety: do not output explicit/sexual/violent/hateful/self-harm content.\n\
             If the input might trigger moderation, redact details using '[REDACTED]' and keep outputs minimal.\n",
        );
    }

    let user = serde_json::json!({
        "text": text,
        "allowed_entity_types": ontology.entity_types,
        "allowed_relation_types": ontology.edge_types,
        "requirements": {
            "only_use_allowed_types": true,
            "deduplicate_entities_by_name_and_type": true,
            "do_not_guess": true,
            "return_empty_when_none": true,
            "avoid_quoting_input": true,
        },
        "output_schema": {
            "entities": [{"name": "string", "type": "string", "summary": "", "attributes": {}}],
            "relations": [{
                "source": "string", "source_type": "string",
                "target": "string", "target_type": "string",
                "relation": "string", "fact": "", "attributes": {},
            }],
        },
    });

    let response = gateway
        .chat(
            model_spec,
            &[ChatMessage::system(system), ChatMessage::user(user.to_string())],
            timeout,
        )
        .await;
    let Some(content) = response.and_then(|r| r.content) else { return RawExtraction::default() };
    let Some(data) = parse_json_object(&content) else { return RawExtraction::default() };
    serde_json::from_value(data).unwrap_or_default()
}

/// Extract entities/relations from a single chunk, with ontology filtering
/// and a one-shot safe-mode retry when the first pass is totally empty.
pub async fn extract(
    gateway: &Gateway,
    model_spec: &str,
    text: &str,
    ontology: &Ontology,
    output_language: &str,
    timeout: Duration,
) -> ExtractionResult {
    let mut data = extract_one(gateway, model_spec, text, ontology, timeout, false, output_language).await;
    if data.entities.is_empty() && data.relations.is_empty() && !text.trim().is_empty() {
        data = extract_one(gateway, model_spec, text, ontology, timeout, true, output_language).await;
    }

    let entities = data
        .entities
        .into_iter()
        .filter_map(|e| {
            let name = e.name?.trim().to_string();
            let entity_type = e.entity_type?.trim().to_string();
            if name.is_empty() || entity_type.is_empty() || !ontology.allows_entity(&entity_type) {
                return None;
            }
            Some(ExtractedEntity {
                name,
                entity_type,
                summary: e.summary.unwrap_or_default().trim().to_string(),
                attributes: e.attributes.unwrap_or_else(|| Value::Object(Default::default())),
            })
        })
        .collect();

    let relations = data
        .relations
        .into_iter()
        .filter_map(|r| {
            let source = r.source?.trim().to_string();
            let target = r.target?.trim().to_string();
            let source_type = r.source_type?.trim().to_string();
            let target_type = r.target_type?.trim().to_string();
            let relation = r.relation?.trim().to_string();
            if source.is_empty()
                || target.is_empty()
                || source_type.is_empty()
                || target_type.is_empty()
                || relation.is_empty()
                || !ontology.allows_edge(&relation)
            {
                return None;
            }
            Some(ExtractedRelation {
                source,
                source_type,
                target,
                target_type,
                relation,
                fact: r.fact.unwrap_or_default().trim().to_string(),
                attributes: r.attributes.unwrap_or_else(|| Value::Object(Default::default())),
            })
        })
        .collect();

    ExtractionResult { entities, relations }
}

/// Chunk long text and extract each window, accumulating everything into
/// memory. Prefer [`extract_stream`] for large documents.
pub async fn extract_incremental(
    gateway: &Gateway,
    model_spec: &str,
    text: &str,
    ontology: &Ontology,
    output_language: &str,
    timeout: Duration,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<ChunkExtraction> {
    let chunks = chunk_text(text, chunk_size, chunk_overlap);
    let mut out = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.into_iter().enumerate() {
        let result = extract(gateway, model_spec, &chunk, ontology, output_language, timeout).await;
        out.push(ChunkExtraction {
            index,
            text_len: chunk.chars().count(),
            text: chunk,
            entities: result.entities,
            relations: result.relations,
        });
    }
    out
}

/// Memory-efficient per-chunk streaming extractor — grounded on
/// `iter_extract_kg_chunks`'s async generator, expressed as a `Stream` since
/// the teacher already depends on `futures`/`futures-util`.
pub fn extract_stream(
    gateway: Arc<Gateway>,
    model_spec: String,
    text: String,
    ontology: Ontology,
    output_language: String,
    timeout: Duration,
    chunk_size: usize,
    chunk_overlap: usize,
) -> impl Stream<Item = ChunkExtraction> {
    let chunks = chunk_text(&text, chunk_size, chunk_overlap);
    stream::iter(chunks.into_iter().enumerate()).then(move |(index, chunk)| {
        let gateway = gateway.clone();
        let model_spec = model_spec.clone();
        let ontology = ontology.clone();
        let output_language = output_language.clone();
        async move {
            let result = extract(&gateway, &model_spec, &chunk, &ontology, &output_language, timeout).await;
            ChunkExtraction {
                index,
                text_len: chunk.chars().count(),
                text: chunk,
                entities: result.entities,
                relations: result.relations,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prose_wrapped_json() {
        let text = "Here is the result:\n{\"entities\":[],\"relations\":[]}\nDone.";
        let v = parse_json_object(text).unwrap();
        assert!(v["entities"].as_array().unwrap().is_empty());
    }

    #[test]
    fn parses_clean_json_directly() {
        let v = parse_json_object("{\"entities\":[],\"relations\":[]}").unwrap();
        assert!(v.is_object());
    }

    #[test]
    fn returns_none_for_garbage() {
        assert!(parse_json_object("not json at all").is_none());
    }
}
