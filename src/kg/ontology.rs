//! Entity/relation type ontology (§4.4 "Ontology").
//!
//! Grounded on `original_source/backend/kg_extractor.py::DEFAULT_ONTOLOGY`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ontology {
    pub entity_types: Vec<String>,
    pub edge_types: Vec<String>,
}

impl Ontology {
    pub fn allows_entity(&self, entity_type: &str) -> bool {
        self.entity_types.is_empty() || self.entity_types.iter().any(|t| t == entity_type)
    }

    pub fn allows_edge(&self, relation: &str) -> bool {
        self.edge_types.is_empty() || self.edge_types.iter().any(|t| t == relation)
    }
}

pub fn default_ontology() -> Ontology {
    Ontology {
        entity_types: vec![
            "Person".to_string(),
            "Organization".to_string(),
            "Location".to_string(),
            "Product".to_string(),
            "Event".to_string(),
            "Concept".to_string(),
        ],
        edge_types: vec![
            "RELATED_TO".to_string(),
            "PART_OF".to_string(),
            "LOCATED_IN".to_string(),
            "WORKS_FOR".to_string(),
            "CREATED_BY".to_string(),
            "CAUSES".to_string(),
            "OWNS".to_string(),
            "MENTIONS".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ontology_allows_its_own_types() {
        let ont = default_ontology();
        assert!(ont.allows_entity("Person"));
        assert!(ont.allows_edge("CAUSES"));
        assert!(!ont.allows_entity("Spaceship"));
    }

    #[test]
    fn empty_ontology_allows_everything() {
        let ont = Ontology { entity_types: vec![], edge_types: vec![] };
        assert!(ont.allows_entity("Anything"));
        assert!(ont.allows_edge("whatever"));
    }
}
