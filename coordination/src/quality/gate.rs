//! Quality Gate: deterministic accept/revise/abandon decisions.
//!
//! The gate is a pure function of the workflow state, the stage, and its
//! configuration. It never calls a collaborator and never mutates state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::TerminalReason;
use crate::graph::StageSpec;
use crate::state::WorkflowState;

/// Configuration for the Quality Gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum overall score (0–10) for an artifact to be accepted
    pub quality_threshold: f64,
    /// Artifacts a gated stage may produce before it is abandoned
    pub max_revision_attempts: u32,
    /// Score movement below which two successive attempts count as a plateau
    pub plateau_epsilon: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 8.0,
            max_revision_attempts: 3,
            plateau_epsilon: 0.3,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=10.0).contains(&self.quality_threshold) {
            return Err(format!(
                "quality_threshold must be within 0–10, got {}",
                self.quality_threshold
            ));
        }
        if self.max_revision_attempts == 0 {
            return Err("max_revision_attempts must be at least 1".to_string());
        }
        if !(self.plateau_epsilon.is_finite() && self.plateau_epsilon > 0.0) {
            return Err(format!(
                "plateau_epsilon must be positive, got {}",
                self.plateau_epsilon
            ));
        }
        Ok(())
    }
}

/// Why a gated stage stopped revising without reaching the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    MaxAttempts,
    Plateau,
}

impl AbandonReason {
    pub fn terminal_reason(self) -> TerminalReason {
        match self {
            Self::MaxAttempts => TerminalReason::AbandonedAfterMaxAttempts,
            Self::Plateau => TerminalReason::AbandonedPlateau,
        }
    }
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxAttempts => write!(f, "max_attempts"),
            Self::Plateau => write!(f, "plateau"),
        }
    }
}

/// Verdict returned by [`QualityGate::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum GateVerdict {
    Accept,
    Revise,
    Abandon(AbandonReason),
}

impl fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Revise => write!(f, "revise"),
            Self::Abandon(reason) => write!(f, "abandon ({reason})"),
        }
    }
}

/// The Quality Gate
#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    config: GateConfig,
}

impl QualityGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Decide what happens to the current artifact of `stage`.
    ///
    /// First match wins:
    /// 1. attempt ceiling reached → abandon
    /// 2. score at or above threshold → accept
    /// 3. last two scores within epsilon → abandon (plateau)
    /// 4. otherwise → revise
    ///
    /// When the ceiling fires while the last two scores also plateaued, the
    /// abandonment is attributed to the plateau.
    pub fn decide(&self, state: &WorkflowState, stage: &StageSpec) -> GateVerdict {
        let attempts = state.attempts(&stage.name);
        let plateaued = self.is_plateau(state, &stage.name);

        if attempts >= self.config.max_revision_attempts {
            return if plateaued {
                GateVerdict::Abandon(AbandonReason::Plateau)
            } else {
                GateVerdict::Abandon(AbandonReason::MaxAttempts)
            };
        }

        if let Some(score) = state.quality_score {
            if score >= self.config.quality_threshold {
                return GateVerdict::Accept;
            }
        }

        if plateaued {
            return GateVerdict::Abandon(AbandonReason::Plateau);
        }

        GateVerdict::Revise
    }

    /// Whether the last two scores recorded for `stage` moved by less than epsilon.
    pub fn is_plateau(&self, state: &WorkflowState, stage: &str) -> bool {
        state
            .last_two_scores(stage)
            .map(|(previous, last)| (last - previous).abs() < self.config.plateau_epsilon)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Successor;

    fn draft() -> StageSpec {
        StageSpec::new("draft", Successor::Next("finish".into())).gated(["voice", "pacing"])
    }

    /// State after `scores.len()` produced artifacts, each scored in turn.
    fn state_with(scores: &[f64]) -> WorkflowState {
        let mut state = WorkflowState::new("run");
        for score in scores {
            state.increment_attempt("draft");
            state.record_score("draft", *score);
        }
        state
    }

    #[test]
    fn test_accept_above_threshold() {
        let gate = QualityGate::default();
        assert_eq!(gate.decide(&state_with(&[9.0]), &draft()), GateVerdict::Accept);
        assert_eq!(gate.decide(&state_with(&[8.0]), &draft()), GateVerdict::Accept);
    }

    #[test]
    fn test_revise_below_threshold() {
        let gate = QualityGate::default();
        assert_eq!(gate.decide(&state_with(&[5.0]), &draft()), GateVerdict::Revise);
        assert_eq!(
            gate.decide(&state_with(&[5.0, 6.0]), &draft()),
            GateVerdict::Revise
        );
    }

    #[test]
    fn test_plateau_before_ceiling() {
        let gate = QualityGate::default();
        assert_eq!(
            gate.decide(&state_with(&[6.0, 6.2]), &draft()),
            GateVerdict::Abandon(AbandonReason::Plateau)
        );
    }

    #[test]
    fn test_ceiling_checked_before_accept() {
        let gate = QualityGate::default();
        // Third artifact finally passes, but the ceiling is checked first.
        assert_eq!(
            gate.decide(&state_with(&[5.0, 6.0, 9.0]), &draft()),
            GateVerdict::Abandon(AbandonReason::MaxAttempts)
        );
    }

    #[test]
    fn test_ceiling_with_plateau_reports_plateau() {
        let gate = QualityGate::default();
        assert_eq!(
            gate.decide(&state_with(&[5.0, 6.0, 6.0]), &draft()),
            GateVerdict::Abandon(AbandonReason::Plateau)
        );
        assert_eq!(
            gate.decide(&state_with(&[5.0, 5.5, 6.0]), &draft()),
            GateVerdict::Abandon(AbandonReason::MaxAttempts)
        );
    }

    #[test]
    fn test_decide_is_idempotent() {
        let gate = QualityGate::default();
        let state = state_with(&[4.0, 5.5]);
        let first = gate.decide(&state, &draft());
        for _ in 0..10 {
            assert_eq!(gate.decide(&state, &draft()), first);
        }
    }

    #[test]
    fn test_custom_config() {
        let gate = QualityGate::new(GateConfig {
            quality_threshold: 6.0,
            max_revision_attempts: 5,
            plateau_epsilon: 0.1,
        });
        assert_eq!(gate.decide(&state_with(&[6.0]), &draft()), GateVerdict::Accept);
        assert_eq!(
            gate.decide(&state_with(&[4.0, 4.2, 4.4, 4.6]), &draft()),
            GateVerdict::Revise
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(GateConfig::default().validate().is_ok());
        let bad_threshold = GateConfig {
            quality_threshold: 12.0,
            ..Default::default()
        };
        assert!(bad_threshold.validate().is_err());
        let no_attempts = GateConfig {
            max_revision_attempts: 0,
            ..Default::default()
        };
        assert!(no_attempts.validate().is_err());
        let zero_epsilon = GateConfig {
            plateau_epsilon: 0.0,
            ..Default::default()
        };
        assert!(zero_epsilon.validate().is_err());
    }

    #[test]
    fn test_abandon_reason_maps_to_terminal_reason() {
        assert_eq!(
            AbandonReason::Plateau.terminal_reason(),
            TerminalReason::AbandonedPlateau
        );
        assert_eq!(
            AbandonReason::MaxAttempts.terminal_reason(),
            TerminalReason::AbandonedAfterMaxAttempts
        );
        assert_eq!(
            GateVerdict::Abandon(AbandonReason::Plateau).to_string(),
            "abandon (plateau)"
        );
    }
}
