//! Ranking parse + weighted aggregation (§4.5.3, §3 "Aggregate ranking").
//!
//! Grounded 1:1 on `original_source/backend/council.py::parse_ranking_from_text`
//! / `calculate_aggregate_rankings`. Expressed as a zero-state struct of
//! associated functions, matching the teacher's `orchestrator/aggregation.rs::Gamma`
//! shape for pure scoring/selection logic.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::pipeline::types::{AggregateRankingEntry, LabelEntry, Stage2Record};

lazy_static! {
    static ref NUMBERED_RESPONSE_RE: Regex = Regex::new(r"\d+\.\s*Response [A-Z]").unwrap();
    static ref BARE_RESPONSE_RE: Regex = Regex::new(r"Response [A-Z]").unwrap();
}

pub struct Ranker;

impl Ranker {
    /// Parse the `FINAL RANKING:` section per §4.5.3's grammar. When the
    /// sentinel is absent, falls back to scanning the whole text for any
    /// `Response [A-Z]` occurrence — preserved deliberately per SPEC_FULL.md
    /// §9's Open Question (council.py performs exactly this lenient scan).
    pub fn parse_ranking_from_text(text: &str) -> Vec<String> {
        if let Some(idx) = text.find("FINAL RANKING:") {
            let section = &text[idx + "FINAL RANKING:".len()..];
            let numbered_matches: Vec<&str> = NUMBERED_RESPONSE_RE.find_iter(section).map(|m| m.as_str()).collect();
            if !numbered_matches.is_empty() {
                return numbered_matches
                    .into_iter()
                    .filter_map(|m| BARE_RESPONSE_RE.find(m).map(|mm| mm.as_str().to_string()))
                    .collect();
            }
            return BARE_RESPONSE_RE.find_iter(section).map(|m| m.as_str().to_string()).collect();
        }

        BARE_RESPONSE_RE.find_iter(text).map(|m| m.as_str().to_string()).collect()
    }

    /// Dedups a parsed ranking to the first occurrence of each label,
    /// enforcing the §8 invariant that a single agent's `parsed_ranking`
    /// contains no duplicate labels. `parse_ranking_from_text` itself is
    /// intentionally left lenient (can re-reference a label in evaluation
    /// prose); dedup happens here, once, for aggregation and storage.
    pub fn dedup_labels(labels: Vec<String>) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        labels.into_iter().filter(|l| seen.insert(l.clone())).collect()
    }

    /// `average_rank = Σ(position × vote_weight) / Σ(vote_weight)` per
    /// model, sorted ascending (lower = better) — §3 "Aggregate ranking".
    pub fn calculate_aggregate_rankings(
        stage2: &[Stage2Record],
        labels: &[LabelEntry],
    ) -> Vec<AggregateRankingEntry> {
        let label_to_model: HashMap<&str, &str> =
            labels.iter().map(|l| (l.label.as_str(), l.model_spec.as_str())).collect();

        let mut weighted_sum: HashMap<String, f64> = HashMap::new();
        let mut weight_total: HashMap<String, f64> = HashMap::new();
        let mut votes: HashMap<String, u32> = HashMap::new();

        for record in stage2 {
            for (position, label) in record.parsed_ranking.iter().enumerate() {
                let Some(model_spec) = label_to_model.get(label.as_str()) else { continue };
                let position = (position + 1) as f64;
                *weighted_sum.entry(model_spec.to_string()).or_insert(0.0) += position * record.vote_weight;
                *weight_total.entry(model_spec.to_string()).or_insert(0.0) += record.vote_weight;
                *votes.entry(model_spec.to_string()).or_insert(0) += 1;
            }
        }

        let mut out: Vec<AggregateRankingEntry> = weighted_sum
            .into_iter()
            .map(|(model_spec, sum)| {
                let total = weight_total.get(&model_spec).copied().unwrap_or(1.0).max(f64::EPSILON);
                AggregateRankingEntry {
                    votes: votes.get(&model_spec).copied().unwrap_or(0),
                    average_rank: sum / total,
                    total_vote_weight: total,
                    model_spec,
                }
            })
            .collect();

        out.sort_by(|a, b| a.average_rank.partial_cmp(&b.average_rank).unwrap_or(std::cmp::Ordering::Equal));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(l: &str, model: &str) -> LabelEntry {
        LabelEntry { label: l.to_string(), agent_id: model.to_string(), agent_name: model.to_string(), model_spec: model.to_string() }
    }

    fn stage2(vote_weight: f64, ranking: &[&str]) -> Stage2Record {
        Stage2Record {
            agent_id: "a".into(),
            agent_name: "A".into(),
            model_spec: "m".into(),
            vote_weight,
            ranking: String::new(),
            parsed_ranking: ranking.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn parses_numbered_final_ranking_block() {
        let text = "some chinese eval text...\n\nFINAL RANKING:\n1. Response C\n2. Response A\n3. Response B";
        let parsed = Ranker::parse_ranking_from_text(text);
        assert_eq!(parsed, vec!["Response C", "Response A", "Response B"]);
    }

    #[test]
    fn lenient_scan_without_sentinel_can_overcount() {
        let text = "Response A is great. Response B is also mentioned when comparing to Response A again.";
        let parsed = Ranker::parse_ranking_from_text(text);
        // Preserved lenient behavior: whole-text scan, duplicates included.
        assert_eq!(parsed, vec!["Response A", "Response B", "Response A"]);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let parsed = vec!["Response A".to_string(), "Response B".to_string(), "Response A".to_string()];
        assert_eq!(Ranker::dedup_labels(parsed), vec!["Response A", "Response B"]);
    }

    #[test]
    fn aggregate_ranking_matches_spec_scenario_1() {
        // a1 weight 1.0; a2 weight 4.0 (influence 2.0, seniority 10).
        let labels = vec![label("Response A", "model-a"), label("Response B", "model-b")];
        let stage2 = vec![
            stage2(1.0, &["Response A", "Response B"]),
            stage2(4.0, &["Response B", "Response A"]),
        ];
        let aggregate = Ranker::calculate_aggregate_rankings(&stage2, &labels);

        let a = aggregate.iter().find(|e| e.model_spec == "model-a").unwrap();
        let b = aggregate.iter().find(|e| e.model_spec == "model-b").unwrap();
        assert!((a.average_rank - 1.8).abs() < 1e-9);
        assert!((b.average_rank - 1.2).abs() < 1e-9);
        assert_eq!(aggregate[0].model_spec, "model-b");
    }

    #[test]
    fn monotone_in_weighted_position_when_everyone_agrees() {
        let labels = vec![label("Response A", "model-a"), label("Response B", "model-b")];
        let stage2 = vec![
            stage2(1.0, &["Response A", "Response B"]),
            stage2(2.0, &["Response A", "Response B"]),
        ];
        let aggregate = Ranker::calculate_aggregate_rankings(&stage2, &labels);
        let a = aggregate.iter().find(|e| e.model_spec == "model-a").unwrap();
        let b = aggregate.iter().find(|e| e.model_spec == "model-b").unwrap();
        assert!(a.average_rank < b.average_rank);
    }
}
