//! Append-only trace of a revision loop.

use serde::{Deserialize, Serialize};

/// One scored attempt of a gated stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionStep {
    /// Artifact attempt that was scored (1-based).
    pub attempt: u32,
    pub previous_score: Option<f64>,
    pub new_score: f64,
    /// `new_score - previous_score`, zero on the first attempt.
    pub delta: f64,
    /// Dimensions the revision that produced this attempt was aimed at.
    #[serde(default)]
    pub targeted: Vec<String>,
}

/// Score trajectory of one gated stage within a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RevisionProgress {
    pub stage: String,
    pub steps: Vec<RevisionStep>,
}

impl RevisionProgress {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            steps: Vec::new(),
        }
    }

    /// Append a scored attempt and return the recorded step.
    pub fn push(&mut self, attempt: u32, score: f64, targeted: Vec<String>) -> &RevisionStep {
        let previous_score = self.steps.last().map(|s| s.new_score);
        let delta = previous_score.map(|p| score - p).unwrap_or(0.0);
        self.steps.push(RevisionStep {
            attempt,
            previous_score,
            new_score: score,
            delta,
            targeted,
        });
        &self.steps[self.steps.len() - 1]
    }

    pub fn best_score(&self) -> Option<f64> {
        self.steps.iter().map(|s| s.new_score).reduce(f64::max)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
