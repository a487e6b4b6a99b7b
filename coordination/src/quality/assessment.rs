//! Quality assessments produced by the evaluation collaborator.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::json::extract_json_block;

/// Lowest and highest legal score.
pub const SCORE_RANGE: (f64, f64) = (0.0, 10.0);

/// Result of evaluating one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    /// Overall score on a 0–10 scale.
    pub overall: f64,
    /// Named sub-dimension scores; keys are unique by construction.
    #[serde(default)]
    pub dimensions: BTreeMap<String, f64>,
    /// Free-form reviewer notes forwarded into revision instructions.
    #[serde(default)]
    pub notes: String,
}

impl QualityAssessment {
    pub fn new(overall: f64) -> Self {
        Self {
            overall,
            dimensions: BTreeMap::new(),
            notes: String::new(),
        }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, score: f64) -> Self {
        self.dimensions.insert(name.into(), score);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Reject non-finite or out-of-range scores.
    pub fn validate(&self) -> Result<(), String> {
        let (lo, hi) = SCORE_RANGE;
        let in_range = |s: f64| s.is_finite() && (lo..=hi).contains(&s);
        if !in_range(self.overall) {
            return Err(format!("overall score {} outside {lo}–{hi}", self.overall));
        }
        for (name, score) in &self.dimensions {
            if !in_range(*score) {
                return Err(format!("dimension '{name}' score {score} outside {lo}–{hi}"));
            }
        }
        Ok(())
    }

    /// Parse an assessment from raw evaluator output.
    pub fn from_response(raw: &str) -> Result<Self, String> {
        let block = extract_json_block(raw).ok_or_else(|| "no JSON object found".to_string())?;
        let assessment: Self =
            serde_json::from_str(block).map_err(|e| format!("invalid assessment: {e}"))?;
        assessment.validate()?;
        Ok(assessment)
    }

    /// Lowest-scoring dimensions, at most `limit`.
    ///
    /// Ties are broken by position in `declared`; undeclared dimensions sort
    /// after declared ones, alphabetically.
    pub fn weakest(&self, declared: &[String], limit: usize) -> Vec<(String, f64)> {
        let rank = |name: &str| {
            declared
                .iter()
                .position(|d| d == name)
                .unwrap_or(declared.len())
        };
        let mut dims: Vec<(&String, f64)> =
            self.dimensions.iter().map(|(k, v)| (k, *v)).collect();
        dims.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| rank(a.0).cmp(&rank(b.0)))
                .then_with(|| a.0.cmp(b.0))
        });
        dims.into_iter()
            .take(limit)
            .map(|(k, v)| (k.clone(), v))
            .collect()
    }
}

/// Pick the 1–2 dimensions a targeted revision should focus on.
///
/// The weakest dimension is always targeted; the runner-up only while it is
/// still below `threshold`.
pub fn select_targets(
    assessment: &QualityAssessment,
    declared: &[String],
    threshold: f64,
) -> Vec<(String, f64)> {
    let mut weakest = assessment.weakest(declared, 2);
    if weakest.len() == 2 && weakest[1].1 >= threshold {
        weakest.truncate(1);
    }
    weakest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared() -> Vec<String> {
        ["voice", "pacing", "coherence", "dialogue"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_weakest_orders_by_score() {
        let a = QualityAssessment::new(6.0)
            .with_dimension("voice", 7.0)
            .with_dimension("pacing", 4.0)
            .with_dimension("coherence", 8.0)
            .with_dimension("dialogue", 5.0);
        let weakest = a.weakest(&declared(), 2);
        assert_eq!(
            weakest,
            vec![("pacing".to_string(), 4.0), ("dialogue".to_string(), 5.0)]
        );
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        // BTreeMap order would put "coherence" before "voice"; declaration wins.
        let a = QualityAssessment::new(5.0)
            .with_dimension("coherence", 5.0)
            .with_dimension("voice", 5.0)
            .with_dimension("dialogue", 5.0);
        let weakest = a.weakest(&declared(), 2);
        assert_eq!(weakest[0].0, "voice");
        assert_eq!(weakest[1].0, "coherence");
    }

    #[test]
    fn test_undeclared_dimensions_sort_last_on_tie() {
        let a = QualityAssessment::new(5.0)
            .with_dimension("atmosphere", 3.0)
            .with_dimension("pacing", 3.0);
        let weakest = a.weakest(&declared(), 1);
        assert_eq!(weakest[0].0, "pacing");
    }

    #[test]
    fn test_targets_drop_runner_up_above_threshold() {
        let a = QualityAssessment::new(7.5)
            .with_dimension("voice", 6.0)
            .with_dimension("pacing", 8.5);
        let targets = select_targets(&a, &declared(), 8.0);
        assert_eq!(targets, vec![("voice".to_string(), 6.0)]);

        let b = QualityAssessment::new(6.0)
            .with_dimension("voice", 6.0)
            .with_dimension("pacing", 7.0);
        assert_eq!(select_targets(&b, &declared(), 8.0).len(), 2);
    }

    #[test]
    fn test_targets_empty_without_dimensions() {
        let a = QualityAssessment::new(4.0);
        assert!(select_targets(&a, &declared(), 8.0).is_empty());
    }

    #[test]
    fn test_parses_wrapped_response() {
        let raw = "Assessment:\n```json\n{\"overall\": 6.5, \"dimensions\": {\"voice\": 7, \"pacing\": 5.5}, \"notes\": \"middle sags\"}\n```";
        let a = QualityAssessment::from_response(raw).unwrap();
        assert_eq!(a.overall, 6.5);
        assert_eq!(a.dimensions["pacing"], 5.5);
        assert_eq!(a.notes, "middle sags");
    }

    #[test]
    fn test_rejects_out_of_range_scores() {
        assert!(QualityAssessment::from_response("{\"overall\": 11}").is_err());
        assert!(QualityAssessment::from_response(
            "{\"overall\": 5, \"dimensions\": {\"voice\": -1}}"
        )
        .is_err());
        assert!(QualityAssessment::from_response("looks great, 9/10").is_err());
    }
}
