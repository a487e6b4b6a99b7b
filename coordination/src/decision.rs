//! Action decisions: parsing and validating reasoning output, plus the
//! deterministic fallback used when the reasoning collaborator cannot be trusted.
//!
//! ## Expected collaborator output
//!
//! ```text
//! { "plan": [ { "action": "<stage>", "arguments": {..}, "justification": "<why>" }, ... ] }
//! ```
//!
//! Validation is fail-closed: a plan is accepted only when every entry names a
//! legal stage and carries a justification, and the plan holds 1–5 entries.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::StageSpec;
use crate::json::extract_json_block;

/// Upper bound on proposals in one decision.
pub const MAX_PROPOSALS: usize = 5;

/// Plan as written by the reasoning collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawPlan {
    #[schemars(description = "Ordered next stages, between 1 and 5 entries")]
    pub plan: Vec<RawPlanStep>,
}

/// One entry of a [`RawPlan`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawPlanStep {
    #[schemars(description = "Name of a legal next stage")]
    pub action: String,
    #[serde(default)]
    #[schemars(description = "Optional stage-specific arguments")]
    pub arguments: Option<serde_json::Value>,
    #[serde(default)]
    #[schemars(description = "Short reason for choosing this stage (required)")]
    pub justification: String,
}

/// A validated proposed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedStage {
    pub stage: String,
    pub justification: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// Which deterministic default was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FallbackKind {
    /// The unique legal stage with the highest static priority.
    HighestPriority,
    /// Several stages share the top priority; the first in declaration order
    /// is proposed and the ambiguity is recorded.
    Clarify { candidates: Vec<String> },
    /// Nothing is legal; no stage is proposed.
    NoOp,
}

/// How a decision was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "origin")]
pub enum DecisionOrigin {
    /// Parsed and validated from collaborator output.
    Reasoned { attempts: u32 },
    /// Deterministic default after the collaborator could not produce a valid plan.
    Fallback {
        fallback: FallbackKind,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
}

/// Output of the action selector.
///
/// `proposals` holds 1–5 stages, all legal at the time of the decision. The
/// only exception is a no-op fallback, which proposes nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDecision {
    pub proposals: Vec<ProposedStage>,
    #[serde(flatten)]
    pub origin: DecisionOrigin,
}

impl ActionDecision {
    pub fn reasoned(proposals: Vec<ProposedStage>, attempts: u32) -> Self {
        Self {
            proposals,
            origin: DecisionOrigin::Reasoned { attempts },
        }
    }

    pub fn first(&self) -> Option<&ProposedStage> {
        self.proposals.first()
    }

    pub fn stages(&self) -> Vec<&str> {
        self.proposals.iter().map(|p| p.stage.as_str()).collect()
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.origin, DecisionOrigin::Fallback { .. })
    }

    pub fn is_noop(&self) -> bool {
        self.proposals.is_empty()
    }
}

/// Reasons a collaborator plan was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecisionError {
    #[error("response contains no JSON object")]
    NoJson,

    #[error("response JSON does not match the plan schema: {0}")]
    InvalidJson(String),

    #[error("plan is empty; propose at least one stage")]
    EmptyPlan,

    #[error("plan proposes {0} stages; at most 5 are allowed")]
    TooManyProposals(usize),

    #[error("'{stage}' is not a legal next stage; choose from [{}]", .legal.join(", "))]
    IllegalStage { stage: String, legal: Vec<String> },

    #[error("plan entry {index} ('{stage}') has no justification")]
    MissingJustification { index: usize, stage: String },
}

/// Parse collaborator output into a [`RawPlan`] without validating it.
pub fn parse_plan(raw: &str) -> Result<RawPlan, DecisionError> {
    let block = extract_json_block(raw).ok_or(DecisionError::NoJson)?;
    serde_json::from_str(block).map_err(|e| DecisionError::InvalidJson(e.to_string()))
}

/// Check a parsed plan against the legal next stages.
pub fn validate_plan(plan: RawPlan, legal: &[String]) -> Result<Vec<ProposedStage>, DecisionError> {
    if plan.plan.is_empty() {
        return Err(DecisionError::EmptyPlan);
    }
    if plan.plan.len() > MAX_PROPOSALS {
        return Err(DecisionError::TooManyProposals(plan.plan.len()));
    }

    let mut proposals = Vec::with_capacity(plan.plan.len());
    for (index, step) in plan.plan.into_iter().enumerate() {
        let stage = step.action.trim().to_string();
        if !legal.iter().any(|l| *l == stage) {
            return Err(DecisionError::IllegalStage {
                stage,
                legal: legal.to_vec(),
            });
        }
        let justification = step.justification.trim().to_string();
        if justification.is_empty() {
            return Err(DecisionError::MissingJustification { index, stage });
        }
        proposals.push(ProposedStage {
            stage,
            justification,
            arguments: step.arguments,
        });
    }
    Ok(proposals)
}

/// Parse and validate in one step.
pub fn parse_decision(raw: &str, legal: &[String]) -> Result<Vec<ProposedStage>, DecisionError> {
    validate_plan(parse_plan(raw)?, legal)
}

/// Deterministic default when no valid plan could be obtained.
///
/// `candidates` must be in declaration order.
pub fn fallback_decision(
    candidates: &[&StageSpec],
    attempts: u32,
    last_error: Option<String>,
) -> ActionDecision {
    let top = candidates.iter().map(|s| s.priority).max();
    let leaders: Vec<&StageSpec> = match top {
        Some(p) => candidates.iter().copied().filter(|s| s.priority == p).collect(),
        None => Vec::new(),
    };

    let (fallback, proposals) = match leaders.as_slice() {
        [] => (FallbackKind::NoOp, Vec::new()),
        [only] => (
            FallbackKind::HighestPriority,
            vec![fallback_proposal(only, "highest-priority legal stage")],
        ),
        [first, ..] => (
            FallbackKind::Clarify {
                candidates: leaders.iter().map(|s| s.name.clone()).collect(),
            },
            vec![fallback_proposal(
                first,
                "several stages share the top priority; taking the first declared",
            )],
        ),
    };

    ActionDecision {
        proposals,
        origin: DecisionOrigin::Fallback {
            fallback,
            attempts,
            last_error,
        },
    }
}

fn fallback_proposal(spec: &StageSpec, why: &str) -> ProposedStage {
    ProposedStage {
        stage: spec.name.clone(),
        justification: format!("fallback: {why}"),
        arguments: None,
    }
}

/// JSON schema of [`RawPlan`], shown to the reasoning collaborator.
pub fn plan_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(RawPlan)).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Successor;

    fn legal() -> Vec<String> {
        vec!["research".to_string(), "draft".to_string()]
    }

    #[test]
    fn test_parses_valid_plan() {
        let raw = r#"Here is my plan:
```json
{"plan": [
  {"action": "research", "arguments": {"topic": "lighthouses"}, "justification": "setting needs detail"},
  {"action": "draft", "justification": "then write"}
]}
```"#;
        let proposals = parse_decision(raw, &legal()).unwrap();
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].stage, "research");
        assert_eq!(proposals[0].arguments.as_ref().unwrap()["topic"], "lighthouses");
        assert_eq!(proposals[1].justification, "then write");
    }

    #[test]
    fn test_rejects_prose() {
        assert_eq!(
            parse_decision("I would draft next.", &legal()).unwrap_err(),
            DecisionError::NoJson
        );
        assert!(matches!(
            parse_decision("{\"steps\": []}", &legal()).unwrap_err(),
            DecisionError::InvalidJson(_)
        ));
    }

    #[test]
    fn test_rejects_illegal_stage() {
        let raw = r#"{"plan": [{"action": "finish", "justification": "done"}]}"#;
        let err = parse_decision(raw, &legal()).unwrap_err();
        assert!(matches!(err, DecisionError::IllegalStage { ref stage, .. } if stage == "finish"));
        assert!(err.to_string().contains("research, draft"));
    }

    #[test]
    fn test_rejects_blank_justification() {
        let raw = r#"{"plan": [{"action": "draft", "justification": "   "}]}"#;
        assert_eq!(
            parse_decision(raw, &legal()).unwrap_err(),
            DecisionError::MissingJustification {
                index: 0,
                stage: "draft".into()
            }
        );
    }

    #[test]
    fn test_plan_size_bounds() {
        assert_eq!(
            parse_decision(r#"{"plan": []}"#, &legal()).unwrap_err(),
            DecisionError::EmptyPlan
        );
        let step = r#"{"action": "draft", "justification": "x"}"#;
        let six = format!("{{\"plan\": [{}]}}", vec![step; 6].join(","));
        assert_eq!(
            parse_decision(&six, &legal()).unwrap_err(),
            DecisionError::TooManyProposals(6)
        );
        let five = format!("{{\"plan\": [{}]}}", vec![step; 5].join(","));
        assert_eq!(parse_decision(&five, &legal()).unwrap().len(), 5);
    }

    #[test]
    fn test_fallback_highest_priority() {
        let research = StageSpec::new("research", Successor::Next("draft".into())).priority(1);
        let draft = StageSpec::new("draft", Successor::Next("finish".into())).priority(5);
        let decision = fallback_decision(&[&research, &draft], 3, Some("no json".into()));
        assert_eq!(decision.stages(), vec!["draft"]);
        assert!(decision.is_fallback());
        assert!(matches!(
            decision.origin,
            DecisionOrigin::Fallback {
                fallback: FallbackKind::HighestPriority,
                attempts: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_fallback_tie_is_clarify() {
        let a = StageSpec::new("outline", Successor::Next("draft".into())).priority(2);
        let b = StageSpec::new("research", Successor::Next("draft".into())).priority(2);
        let decision = fallback_decision(&[&a, &b], 3, None);
        assert_eq!(decision.stages(), vec!["outline"]);
        match decision.origin {
            DecisionOrigin::Fallback {
                fallback: FallbackKind::Clarify { candidates },
                ..
            } => assert_eq!(candidates, vec!["outline", "research"]),
            other => panic!("expected clarify, got {other:?}"),
        }
    }

    #[test]
    fn test_fallback_empty_is_noop() {
        let decision = fallback_decision(&[], 3, None);
        assert!(decision.is_noop());
        assert!(decision.first().is_none());
    }

    #[test]
    fn test_schema_mentions_plan() {
        let schema = plan_schema();
        assert!(schema.to_string().contains("justification"));
        assert!(schema["properties"].get("plan").is_some());
    }
}
