//! Action Selector: ask the reasoning collaborator which stage runs next,
//! then refuse to trust the answer until it validates.
//!
//! ```text
//! select_next
//!   → legal set empty?            → no-op fallback (no call)
//!   → for call in 0..=max_retries:
//!       reason(snapshot) → parse → validate → Reasoned decision
//!       on failure: attach corrective instruction, try again
//!   → deterministic fallback (highest priority / clarify)
//! ```
//!
//! Every path returns a decision naming only legal stages.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use quill_coordination::{fallback_decision, parse_decision, ActionDecision, StageSpec};

use crate::collaborators::{ContextSnapshot, Reasoner, ReasoningError};
use crate::prompts;

/// Tuning for the selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Extra reasoning calls after the first rejected answer.
    pub max_retries: u32,
    /// Number of history entries included in a snapshot.
    pub history_window: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            history_window: 8,
        }
    }
}

/// Chooses the next stage at conditional edges.
pub struct ActionSelector {
    reasoner: Arc<dyn Reasoner>,
    config: SelectorConfig,
    call_timeout: Duration,
}

impl ActionSelector {
    pub fn new(reasoner: Arc<dyn Reasoner>, config: SelectorConfig, call_timeout: Duration) -> Self {
        Self {
            reasoner,
            config,
            call_timeout,
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Produce a validated decision for the stage after `snapshot.current_stage`.
    ///
    /// `legal` must be in declaration order; the fallback relies on it.
    pub async fn select_next(
        &self,
        legal: &[&StageSpec],
        mut snapshot: ContextSnapshot,
    ) -> ActionDecision {
        if legal.is_empty() {
            warn!(from = %snapshot.current_stage, "No legal next stage; returning no-op");
            return fallback_decision(legal, 0, None);
        }

        let names: Vec<String> = legal.iter().map(|s| s.name.clone()).collect();
        let max_calls = 1 + self.config.max_retries;
        let mut last_error: Option<String> = None;

        for call in 1..=max_calls {
            let error = match self.call(&snapshot, &names).await {
                Ok(raw) => match parse_decision(&raw, &names) {
                    Ok(proposals) => {
                        let decision = ActionDecision::reasoned(proposals, call);
                        info!(
                            from = %snapshot.current_stage,
                            call,
                            plan = ?decision.stages(),
                            "Reasoned next stage"
                        );
                        return decision;
                    }
                    Err(e) => e.to_string(),
                },
                Err(e) => e.to_string(),
            };

            warn!(
                from = %snapshot.current_stage,
                call,
                max_calls,
                error = %error,
                "Rejected reasoning output"
            );
            snapshot.correction = Some(prompts::corrective_instruction(&error, &names));
            last_error = Some(error);
        }

        let decision = fallback_decision(legal, max_calls, last_error);
        warn!(
            from = %snapshot.current_stage,
            plan = ?decision.stages(),
            "Falling back to deterministic next stage"
        );
        decision
    }

    async fn call(
        &self,
        snapshot: &ContextSnapshot,
        legal: &[String],
    ) -> Result<String, ReasoningError> {
        debug!(from = %snapshot.current_stage, legal = ?legal, "Invoking reasoning collaborator");
        match tokio::time::timeout(self.call_timeout, self.reasoner.reason(snapshot, legal)).await {
            Ok(result) => result,
            Err(_) => Err(ReasoningError::Timeout(self.call_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockReasoner;
    use quill_coordination::{DecisionOrigin, FallbackKind, Successor, WorkflowState};

    fn research() -> StageSpec {
        StageSpec::new("research", Successor::Next("draft".into())).priority(1)
    }

    fn draft() -> StageSpec {
        StageSpec::new("draft", Successor::Next("finish".into())).priority(2)
    }

    fn snapshot(legal: &[&StageSpec]) -> ContextSnapshot {
        ContextSnapshot::capture(&WorkflowState::new("run"), "structure", legal, 8)
    }

    fn selector(mock: MockReasoner) -> ActionSelector {
        ActionSelector::new(
            Arc::new(mock),
            SelectorConfig::default(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_valid_plan_on_first_call() {
        let mut mock = MockReasoner::new();
        mock.expect_reason()
            .withf(|snap, legal| snap.correction.is_none() && legal.len() == 2)
            .times(1)
            .returning(|_, _| {
                Ok(r#"Sure: {"plan": [{"action": "research", "justification": "needs facts"}]}"#
                    .to_string())
            });
        let (r, d) = (research(), draft());
        let legal = [&r, &d];
        let decision = selector(mock).select_next(&legal, snapshot(&legal)).await;
        assert_eq!(decision.stages(), vec!["research"]);
        assert_eq!(decision.origin, DecisionOrigin::Reasoned { attempts: 1 });
    }

    #[tokio::test]
    async fn test_retry_carries_correction() {
        let mut mock = MockReasoner::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_reason()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(r#"{"plan": [{"action": "finish", "justification": "x"}]}"#.into()));
        mock.expect_reason()
            .withf(|snap, _| {
                snap.correction
                    .as_deref()
                    .is_some_and(|c| c.contains("'finish' is not a legal next stage"))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(r#"{"plan": [{"action": "draft", "justification": "ready"}]}"#.into()));
        let (r, d) = (research(), draft());
        let legal = [&r, &d];
        let decision = selector(mock).select_next(&legal, snapshot(&legal)).await;
        assert_eq!(decision.stages(), vec!["draft"]);
        assert_eq!(decision.origin, DecisionOrigin::Reasoned { attempts: 2 });
    }

    #[tokio::test]
    async fn test_non_json_falls_back_after_three_calls() {
        let mut mock = MockReasoner::new();
        mock.expect_reason()
            .times(3)
            .returning(|_, _| Ok("I think drafting is best.".to_string()));
        let (r, d) = (research(), draft());
        let legal = [&r, &d];
        let decision = selector(mock).select_next(&legal, snapshot(&legal)).await;
        assert_eq!(decision.stages(), vec!["draft"]);
        match decision.origin {
            DecisionOrigin::Fallback {
                fallback,
                attempts,
                last_error,
            } => {
                assert_eq!(fallback, FallbackKind::HighestPriority);
                assert_eq!(attempts, 3);
                assert!(last_error.unwrap().contains("no JSON"));
            }
            other => panic!("expected fallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backend_errors_also_fall_back() {
        let mut mock = MockReasoner::new();
        mock.expect_reason()
            .times(3)
            .returning(|_, _| Err(ReasoningError::Timeout(Duration::from_secs(30))));
        let (r, d) = (research().priority(2), draft());
        let legal = [&r, &d];
        let decision = selector(mock).select_next(&legal, snapshot(&legal)).await;
        // Tied priorities resolve to the first declared candidate.
        assert_eq!(decision.stages(), vec!["research"]);
        assert!(matches!(
            decision.origin,
            DecisionOrigin::Fallback {
                fallback: FallbackKind::Clarify { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_legal_set_is_noop_without_call() {
        let mut mock = MockReasoner::new();
        mock.expect_reason().never();
        let decision = selector(mock).select_next(&[], snapshot(&[])).await;
        assert!(decision.is_noop());
        assert!(decision.is_fallback());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reasoner_times_out() {
        struct Sleepy;

        #[async_trait::async_trait]
        impl Reasoner for Sleepy {
            async fn reason(
                &self,
                _snapshot: &ContextSnapshot,
                _legal: &[String],
            ) -> Result<String, ReasoningError> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(r#"{"plan": [{"action": "research", "justification": "late"}]}"#.into())
            }
        }

        let (r, d) = (research(), draft());
        let legal = [&r, &d];
        let sel = ActionSelector::new(Arc::new(Sleepy), SelectorConfig::default(), Duration::from_secs(5));
        let decision = sel.select_next(&legal, snapshot(&legal)).await;
        assert!(decision.is_fallback());
        assert_eq!(decision.stages(), vec!["draft"]);
    }
}
