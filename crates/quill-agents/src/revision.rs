//! Revision Controller: the bounded produce → score → revise loop.
//!
//! ```text
//! run_revision_cycle(stage)
//!   → loop:
//!       evaluate current artifact (retried)   → record score, progress, best-so-far
//!       QualityGate::decide
//!         accept / abandon → restore best artifact, stop
//!         revise           → target weakest dimensions, re-execute stage (retried)
//! ```
//!
//! The loop is bounded by the gate's attempt ceiling and plateau check, and
//! by the executor's run-level execution cap.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quill_coordination::{
    select_targets, AbandonReason, Artifact, ErrorKind, GateVerdict, QualityGate, RetryError,
    RetryPolicy, RevisionProgress, StageError, StageSpec, TerminalReason, WorkflowState,
};

use crate::collaborators::{Evaluator, GenerationError};
use crate::executor::{StageDirective, StageExecutor};
use crate::prompts;

/// How a revision cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RevisionEnd {
    /// The gate accepted an artifact.
    Accepted,
    /// The gate gave up before the threshold.
    Abandoned(AbandonReason),
    /// Transient failures outlived the retry budget; the best artifact stands.
    Degraded(StageError),
    /// A non-retryable failure; the run must stop.
    Fatal(StageError),
}

/// Result of [`RevisionController::run_revision_cycle`].
#[derive(Debug, Clone)]
pub struct RevisionOutcome {
    pub end: RevisionEnd,
    /// Highest-scoring artifact seen (later wins ties); also restored into the state.
    pub best: Option<Artifact>,
    pub progress: RevisionProgress,
}

impl RevisionOutcome {
    /// Terminal reason contributed by this cycle when it did not accept.
    pub fn abandon_reason(&self) -> Option<TerminalReason> {
        match &self.end {
            RevisionEnd::Accepted | RevisionEnd::Fatal(_) => None,
            RevisionEnd::Abandoned(reason) => Some(reason.terminal_reason()),
            RevisionEnd::Degraded(_) => Some(TerminalReason::AbandonedAfterMaxAttempts),
        }
    }
}

/// Drives the quality loop for gated stages.
pub struct RevisionController {
    evaluator: Arc<dyn Evaluator>,
    gate: QualityGate,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl RevisionController {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        gate: QualityGate,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            evaluator,
            gate,
            retry,
            call_timeout,
        }
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    /// Run the loop for `stage`, whose first artifact is already in `state`.
    ///
    /// `on_verdict` sees every gate verdict with the attempt it applies to.
    pub async fn run_revision_cycle(
        &self,
        stage: &StageSpec,
        state: &mut WorkflowState,
        executor: &StageExecutor,
        cancel: &CancellationToken,
        on_verdict: &mut (dyn FnMut(u32, GateVerdict) + Send),
    ) -> RevisionOutcome {
        let mut progress = RevisionProgress::new(&stage.name);
        let mut best: Option<Artifact> = None;
        let mut targeted: Vec<String> = Vec::new();
        let threshold = self.gate.config().quality_threshold;

        let end = loop {
            let Some(current) = state.output(&stage.name).cloned() else {
                break RevisionEnd::Fatal(StageError::precondition(
                    &stage.name,
                    &[stage.name.clone()],
                ));
            };

            let assessment = match self.evaluate(stage, &current, cancel).await {
                Ok(assessment) => assessment,
                Err(RetryError::Exhausted { attempts, last }) => {
                    let error = StageError::new(&stage.name, last.kind(), last.to_string())
                        .exhausted(attempts);
                    warn!(stage = %stage.name, "Evaluation kept failing; keeping best artifact");
                    break RevisionEnd::Degraded(error);
                }
                Err(RetryError::Fatal { error, .. }) => {
                    break RevisionEnd::Fatal(StageError::new(
                        &stage.name,
                        error.kind(),
                        error.to_string(),
                    ));
                }
                Err(RetryError::Cancelled { .. }) => {
                    break RevisionEnd::Fatal(cancelled(&stage.name, "evaluation backoff"));
                }
            };

            let score = assessment.overall;
            let scored = current.with_score(score);
            state.store_output(scored.clone());
            state.record_score(&stage.name, score);
            let step = progress.push(scored.attempt, score, std::mem::take(&mut targeted));
            info!(
                stage = %stage.name,
                attempt = scored.attempt,
                score,
                delta = step.delta,
                "Artifact scored"
            );

            let improves = best
                .as_ref()
                .and_then(|b| b.score)
                .map_or(true, |best_score| score >= best_score);
            if improves {
                best = Some(scored.clone());
            }

            let verdict = self.gate.decide(state, stage);
            info!(stage = %stage.name, attempt = scored.attempt, verdict = %verdict, "Gate verdict");
            on_verdict(scored.attempt, verdict);

            match verdict {
                GateVerdict::Accept => break RevisionEnd::Accepted,
                GateVerdict::Abandon(reason) => break RevisionEnd::Abandoned(reason),
                GateVerdict::Revise => {}
            }

            let targets = select_targets(&assessment, &stage.quality_dimensions, threshold);
            let instruction = prompts::revision_instruction(stage, &assessment, &targets);
            targeted = targets.into_iter().map(|(name, _)| name).collect();

            let result = executor
                .execute_with_retry(stage, state, &StageDirective::revise(instruction), cancel)
                .await;
            if let Some(error) = result.error {
                if error.kind == ErrorKind::RetriesExhausted {
                    warn!(stage = %stage.name, "Revision kept failing; keeping best artifact");
                    break RevisionEnd::Degraded(error);
                }
                break RevisionEnd::Fatal(error);
            }
            // The revised artifact is not evaluated once the run is cancelled.
            if cancel.is_cancelled() {
                break RevisionEnd::Fatal(cancelled(&stage.name, "revision"));
            }
        };

        if let Some(artifact) = &best {
            state.store_output(artifact.clone());
        }

        RevisionOutcome {
            end,
            best,
            progress,
        }
    }

    async fn evaluate(
        &self,
        stage: &StageSpec,
        artifact: &Artifact,
        cancel: &CancellationToken,
    ) -> Result<quill_coordination::QualityAssessment, RetryError<GenerationError>> {
        let evaluator = &self.evaluator;
        let timeout = self.call_timeout;
        self.retry
            .run_cancellable(
                |_| async move {
                    match tokio::time::timeout(timeout, evaluator.evaluate(stage, artifact)).await {
                        Ok(result) => result,
                        Err(_) => Err(GenerationError::Timeout(timeout)),
                    }
                },
                GenerationError::is_transient,
                cancel,
            )
            .await
    }
}

fn cancelled(stage: &str, during: &str) -> StageError {
    StageError::new(stage, ErrorKind::Cancelled, format!("run cancelled during {during}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MockEvaluator, MockGenerator};
    use crate::executor::ExecutorLimits;
    use quill_coordination::{GateConfig, QualityAssessment, Successor};
    use std::sync::Mutex;

    fn draft() -> StageSpec {
        StageSpec::new("draft", Successor::Next("finish".into())).gated(["voice", "pacing"])
    }

    fn scripted_evaluator(scores: Vec<f64>) -> MockEvaluator {
        let scores = Mutex::new(scores.into_iter());
        let mut mock = MockEvaluator::new();
        mock.expect_evaluate().returning(move |_, _| {
            let overall = scores.lock().unwrap().next().unwrap_or(0.0);
            Ok(QualityAssessment::new(overall)
                .with_dimension("voice", overall)
                .with_dimension("pacing", overall - 1.0))
        });
        mock
    }

    fn counting_generator() -> MockGenerator {
        let mut mock = MockGenerator::new();
        mock.expect_generate()
            .returning(|req| Ok(format!("draft version {}", req.attempt)));
        mock
    }

    fn first_draft() -> WorkflowState {
        let mut state = WorkflowState::new("run");
        state.increment_attempt("draft");
        state.store_output(Artifact::new("draft", "draft version 1").with_attempt(1));
        state
    }

    fn controller(scores: Vec<f64>) -> RevisionController {
        RevisionController::new(
            Arc::new(scripted_evaluator(scores)),
            QualityGate::new(GateConfig::default()),
            RetryPolicy::default(),
            Duration::from_secs(120),
        )
    }

    fn executor() -> StageExecutor {
        StageExecutor::new(
            Arc::new(counting_generator()),
            RetryPolicy::default(),
            ExecutorLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_accepts_first_pass() {
        let mut state = first_draft();
        let mut verdicts = Vec::new();
        let outcome = controller(vec![9.0])
            .run_revision_cycle(
                &draft(),
                &mut state,
                &executor(),
                &CancellationToken::new(),
                &mut |attempt, verdict| verdicts.push((attempt, verdict)),
            )
            .await;
        assert_eq!(outcome.end, RevisionEnd::Accepted);
        assert_eq!(verdicts, vec![(1, GateVerdict::Accept)]);
        assert_eq!(state.attempts("draft"), 1);
        assert_eq!(outcome.best.unwrap().score, Some(9.0));
    }

    #[tokio::test]
    async fn test_revises_until_accept() {
        let mut state = first_draft();
        let outcome = controller(vec![5.0, 8.5])
            .run_revision_cycle(
                &draft(),
                &mut state,
                &executor(),
                &CancellationToken::new(),
                &mut |_, _| {},
            )
            .await;
        assert_eq!(outcome.end, RevisionEnd::Accepted);
        assert_eq!(state.attempts("draft"), 2);
        assert_eq!(state.output("draft").unwrap().content, "draft version 2");
        let steps = &outcome.progress.steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].delta, 3.5);
        // Both dimensions were under threshold, weakest first.
        assert_eq!(steps[1].targeted, vec!["pacing".to_string(), "voice".to_string()]);
        assert!(state.history.last().unwrap().revision);
    }

    #[tokio::test]
    async fn test_returns_best_when_scores_drop() {
        let mut state = first_draft();
        let outcome = controller(vec![6.0, 7.5, 5.0])
            .run_revision_cycle(
                &draft(),
                &mut state,
                &executor(),
                &CancellationToken::new(),
                &mut |_, _| {},
            )
            .await;
        assert_eq!(outcome.end, RevisionEnd::Abandoned(AbandonReason::MaxAttempts));
        let best = outcome.best.unwrap();
        assert_eq!(best.score, Some(7.5));
        assert_eq!(state.output("draft").unwrap().content, "draft version 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_revision_failure_degrades_gracefully() {
        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .returning(|_| Err(GenerationError::Timeout(Duration::from_secs(120))));
        let exec = StageExecutor::new(
            Arc::new(generator),
            RetryPolicy::default(),
            ExecutorLimits::default(),
        );
        let mut state = first_draft();
        let outcome = controller(vec![5.0])
            .run_revision_cycle(
                &draft(),
                &mut state,
                &exec,
                &CancellationToken::new(),
                &mut |_, _| {},
            )
            .await;
        assert!(matches!(outcome.end, RevisionEnd::Degraded(_)));
        assert_eq!(
            outcome.abandon_reason(),
            Some(TerminalReason::AbandonedAfterMaxAttempts)
        );
        assert_eq!(state.output("draft").unwrap().content, "draft version 1");
    }

    #[tokio::test]
    async fn test_refused_evaluation_is_fatal() {
        let mut evaluator = MockEvaluator::new();
        evaluator
            .expect_evaluate()
            .times(1)
            .returning(|_, _| Err(GenerationError::Refused("no".into())));
        let ctl = RevisionController::new(
            Arc::new(evaluator),
            QualityGate::default(),
            RetryPolicy::default(),
            Duration::from_secs(120),
        );
        let mut state = first_draft();
        let outcome = ctl
            .run_revision_cycle(
                &draft(),
                &mut state,
                &executor(),
                &CancellationToken::new(),
                &mut |_, _| {},
            )
            .await;
        match outcome.end {
            RevisionEnd::Fatal(error) => assert_eq!(error.kind, ErrorKind::PermanentRefusal),
            other => panic!("expected fatal, got {other:?}"),
        }
        assert!(outcome.best.is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_revise_skips_evaluation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut generator = MockGenerator::new();
        generator.expect_generate().times(1).returning(move |req| {
            if req.is_revision() {
                trigger.cancel();
            }
            Ok(format!("draft version {}", req.attempt))
        });
        let exec = StageExecutor::new(
            Arc::new(generator),
            RetryPolicy::default(),
            ExecutorLimits::default(),
        );

        let mut state = first_draft();
        let mut verdicts = Vec::new();
        // A second evaluation would accept the revision.
        let outcome = controller(vec![5.0, 9.0])
            .run_revision_cycle(
                &draft(),
                &mut state,
                &exec,
                &cancel,
                &mut |attempt, verdict| verdicts.push((attempt, verdict)),
            )
            .await;
        match outcome.end {
            RevisionEnd::Fatal(error) => assert_eq!(error.kind, ErrorKind::Cancelled),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(verdicts, vec![(1, GateVerdict::Revise)]);
        assert_eq!(outcome.progress.len(), 1);
        // The unevaluated revision is replaced by the best scored artifact.
        assert_eq!(state.output("draft").unwrap().content, "draft version 1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_evaluation_backoff() {
        let mut evaluator = MockEvaluator::new();
        evaluator
            .expect_evaluate()
            .times(1)
            .returning(|_, _| Err(GenerationError::Transport("reset".into())));
        let controller = RevisionController::new(
            Arc::new(evaluator),
            QualityGate::new(GateConfig::default()),
            RetryPolicy::default(),
            Duration::from_secs(120),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let mut state = first_draft();
        let outcome = controller
            .run_revision_cycle(&draft(), &mut state, &executor(), &cancel, &mut |_, _| {})
            .await;
        assert!(matches!(outcome.end, RevisionEnd::Fatal(ref e) if e.kind == ErrorKind::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
