//! Workflow Engine: drives one run from seed inputs to a terminal state.
//!
//! ```text
//! run(request)
//!   → load profile, seed state                     not_started → running
//!   → loop:
//!       cancelled?                                 → terminal_fatal (cancelled)
//!       StageExecutor::execute_with_retry(stage)
//!         fatal / exhausted                        → terminal_fatal
//!       gated? RevisionController cycle            running → awaiting_revision → running
//!       final stage?                               → terminal_success | terminal_abandoned
//!       next: static edge, queued plan entry, or ActionSelector
//!   → finalize report, save profile
//! ```
//!
//! ## Bounds
//!
//! | Guard                     | Where                          | Outcome                 |
//! |---------------------------|--------------------------------|-------------------------|
//! | per-stage attempt ceiling | QualityGate / StageExecutor    | abandon / exhausted     |
//! | plateau detection         | QualityGate                    | abandon                 |
//! | run execution cap         | StageExecutor                  | `run_limit_exceeded`    |
//! | selector retries          | ActionSelector                 | deterministic fallback  |
//!
//! The engine itself is immutable: concurrent runs share it behind an `Arc`
//! and each run owns its own `WorkflowState`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quill_coordination::{
    EngineState, ErrorKind, GateVerdict, IllegalTransition, Lifecycle, ProposedStage,
    QualityGate, RevisionProgress, StageError, StageGraph, StageSpec, Successor, TerminalReason,
    WorkflowState,
};

use crate::collaborators::{ContextSnapshot, Evaluator, Generator, ProfileStore, Reasoner};
use crate::config::EngineConfig;
use crate::executor::{ExecutorLimits, StageDirective, StageExecutor};
use crate::pipeline::PROFILE_KEY;
use crate::profile::UserProfile;
use crate::report::{DecisionRecord, RunReport};
use crate::revision::{RevisionController, RevisionEnd};
use crate::selector::ActionSelector;

/// External collaborators wired into an engine.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn Generator>,
    pub evaluator: Arc<dyn Evaluator>,
    pub reasoner: Arc<dyn Reasoner>,
    pub profiles: Option<Arc<dyn ProfileStore>>,
}

/// One user request.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub seed_inputs: BTreeMap<String, String>,
    pub user_id: Option<String>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.seed_inputs.insert(key.into(), value.into());
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// How the stage loop stopped.
enum Ending {
    /// The final stage produced an artifact.
    Completed,
    Failed(StageError),
}

/// Profile lookup at run start. An unreadable profile is never overwritten.
enum ProfileLoad {
    Loaded(UserProfile),
    Absent,
    Unreadable,
}

impl ProfileLoad {
    fn existing(&self) -> Option<&UserProfile> {
        match self {
            Self::Loaded(profile) => Some(profile),
            Self::Absent | Self::Unreadable => None,
        }
    }
}

/// Per-run bookkeeping that does not belong in `WorkflowState`.
struct RunTrace {
    lifecycle: Lifecycle,
    revisions: Vec<RevisionProgress>,
    decisions: Vec<DecisionRecord>,
    /// Reason of the latest abandoned gate, if any.
    abandoned: Option<TerminalReason>,
}

impl RunTrace {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            revisions: Vec::new(),
            decisions: Vec::new(),
            abandoned: None,
        }
    }

    fn advance(
        &mut self,
        step: usize,
        to: EngineState,
        stage: &str,
        reason: &str,
    ) -> Result<(), StageError> {
        self.lifecycle.set_step(step);
        self.lifecycle
            .advance(to, Some(reason))
            .map_err(|e| illegal(stage, e))
    }
}

fn illegal(stage: &str, e: IllegalTransition) -> StageError {
    error!(stage, from = %e.from, to = %e.to, "Illegal engine transition");
    StageError::new(stage, ErrorKind::Precondition, e.to_string())
}

/// The top-level state machine.
pub struct WorkflowEngine {
    graph: Arc<StageGraph>,
    config: Arc<EngineConfig>,
    executor: StageExecutor,
    revision: RevisionController,
    selector: ActionSelector,
    profiles: Option<Arc<dyn ProfileStore>>,
}

impl WorkflowEngine {
    pub fn new(
        graph: Arc<StageGraph>,
        config: Arc<EngineConfig>,
        collaborators: Collaborators,
    ) -> Self {
        let limits = ExecutorLimits {
            call_timeout: config.call_timeout(),
            max_total_executions: config.max_total_executions,
            max_stage_attempts: config.gate.max_revision_attempts,
        };
        let executor = StageExecutor::new(collaborators.generator, config.retry.clone(), limits);
        let revision = RevisionController::new(
            collaborators.evaluator,
            QualityGate::new(config.gate.clone()),
            config.retry.clone(),
            config.call_timeout(),
        );
        let selector = ActionSelector::new(
            collaborators.reasoner,
            config.selector.clone(),
            config.call_timeout(),
        );
        Self {
            graph,
            config,
            executor,
            revision,
            selector,
            profiles: collaborators.profiles,
        }
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run to completion with no external cancellation.
    pub async fn run(&self, request: RunRequest) -> RunReport {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Run until a terminal state; `cancel` is honoured between stage executions.
    pub async fn run_with_cancel(&self, request: RunRequest, cancel: CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let mut seed = request.seed_inputs;
        let profile = match &request.user_id {
            Some(user_id) => self.load_profile(user_id).await,
            None => ProfileLoad::Absent,
        };
        if let Some(text) = profile.existing().and_then(UserProfile::seed_text) {
            seed.entry(PROFILE_KEY.to_string()).or_insert(text);
        }

        let mut state = WorkflowState::generate().with_seed(&seed);
        let mut trace = RunTrace::new();
        info!(
            run_id = %state.run_id,
            user_id = request.user_id.as_deref().unwrap_or("-"),
            start = self.graph.start(),
            seeds = seed.len(),
            "Run started"
        );

        let seeded = trace.advance(
            0,
            EngineState::Running,
            self.graph.start(),
            "seed inputs loaded",
        );
        let ending = match seeded {
            Ok(()) => self.drive(&mut state, &mut trace, &cancel).await,
            Err(e) => Ending::Failed(e),
        };

        let report = self.finish(state, trace, ending, request.user_id.clone(), started_at);

        if let Some(user_id) = &request.user_id {
            match profile {
                ProfileLoad::Loaded(mut profile) => {
                    self.save_profile(user_id, &mut profile, &report).await
                }
                ProfileLoad::Absent => {
                    self.save_profile(user_id, &mut UserProfile::default(), &report)
                        .await
                }
                ProfileLoad::Unreadable => {
                    warn!(user_id, "Profile was unreadable at run start; leaving it untouched")
                }
            }
        }
        report
    }

    /// The stage loop.
    async fn drive(
        &self,
        state: &mut WorkflowState,
        trace: &mut RunTrace,
        cancel: &CancellationToken,
    ) -> Ending {
        let mut current: &StageSpec = match self.graph.stage(self.graph.start()) {
            Ok(spec) => spec,
            Err(e) => {
                return Ending::Failed(StageError::new(
                    self.graph.start(),
                    ErrorKind::Precondition,
                    e.to_string(),
                ))
            }
        };
        let mut directive = StageDirective::default();
        let mut queue: VecDeque<ProposedStage> = VecDeque::new();

        loop {
            if cancel.is_cancelled() {
                return Ending::Failed(cancelled(&current.name));
            }

            let result = self
                .executor
                .execute_with_retry(current, state, &directive, cancel)
                .await;
            if let Some(error) = result.error {
                return Ending::Failed(error);
            }
            if cancel.is_cancelled() {
                return Ending::Failed(cancelled(&current.name));
            }

            if current.quality_gated {
                if let Err(e) = self.gate_stage(current, state, trace, cancel).await {
                    return Ending::Failed(e);
                }
                if cancel.is_cancelled() {
                    return Ending::Failed(cancelled(&current.name));
                }
            }

            if current.name == self.graph.final_stage() {
                return Ending::Completed;
            }

            let step = state.executions();
            let next = match &current.successor {
                Successor::Next(name) => {
                    if self.executor.is_exhausted(state, name) {
                        return Ending::Failed(StageError::new(
                            name,
                            ErrorKind::RunLimitExceeded,
                            format!("static successor '{name}' has no attempts left"),
                        ));
                    }
                    // A plan entry naming the static successor is consumed by this edge.
                    if queue.front().is_some_and(|queued| &queued.stage == name) {
                        queue.pop_front();
                    }
                    directive = StageDirective::default();
                    name.clone()
                }
                Successor::Conditional(_) => {
                    let proposal = match self.choose_next(current, state, trace, &mut queue).await {
                        Ok(proposal) => proposal,
                        Err(e) => return Ending::Failed(e),
                    };
                    directive = StageDirective::with_arguments(proposal.arguments);
                    proposal.stage
                }
                Successor::Final => return Ending::Completed,
            };

            if let Err(e) = trace.advance(
                step,
                EngineState::Running,
                &next,
                &format!("{} → {}", current.name, next),
            ) {
                return Ending::Failed(e);
            }
            current = match self.graph.stage(&next) {
                Ok(spec) => spec,
                Err(e) => {
                    return Ending::Failed(StageError::new(
                        &next,
                        ErrorKind::Precondition,
                        e.to_string(),
                    ))
                }
            };
        }
    }

    /// Evaluate and revise a gated stage's artifact; `Err` means the run must stop.
    async fn gate_stage(
        &self,
        stage: &StageSpec,
        state: &mut WorkflowState,
        trace: &mut RunTrace,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        trace.advance(
            state.executions(),
            EngineState::AwaitingRevision,
            &stage.name,
            "artifact awaiting evaluation",
        )?;

        let mut illegal_edge: Option<IllegalTransition> = None;
        let lifecycle = &mut trace.lifecycle;
        let mut on_verdict = |attempt: u32, verdict: GateVerdict| {
            if verdict != GateVerdict::Revise || illegal_edge.is_some() {
                return;
            }
            let reason = format!("revise after attempt {attempt}");
            if let Err(e) = lifecycle.advance(EngineState::AwaitingRevision, Some(reason.as_str())) {
                illegal_edge = Some(e);
            }
        };
        let outcome = self
            .revision
            .run_revision_cycle(stage, state, &self.executor, cancel, &mut on_verdict)
            .await;
        if let Some(e) = illegal_edge {
            return Err(illegal(&stage.name, e));
        }

        let abandon_reason = outcome.abandon_reason();
        trace.revisions.push(outcome.progress);
        let step = state.executions();
        match outcome.end {
            RevisionEnd::Accepted => {
                trace.advance(step, EngineState::Running, &stage.name, "accepted")?;
            }
            RevisionEnd::Abandoned(reason) => {
                warn!(stage = %stage.name, reason = %reason, "Quality gate abandoned; continuing with best artifact");
                trace.abandoned = abandon_reason;
                trace.advance(step, EngineState::Running, &stage.name, &format!("abandoned ({reason})"))?;
            }
            RevisionEnd::Degraded(error) => {
                warn!(stage = %stage.name, error = %error, "Revision degraded; continuing with best artifact");
                trace.abandoned = abandon_reason;
                trace.advance(step, EngineState::Running, &stage.name, "degraded after retries")?;
            }
            RevisionEnd::Fatal(error) => return Err(error),
        }
        Ok(())
    }

    /// Next stage after a conditional node: a still-legal queued entry, or a fresh decision.
    async fn choose_next(
        &self,
        from: &StageSpec,
        state: &WorkflowState,
        trace: &mut RunTrace,
        queue: &mut VecDeque<ProposedStage>,
    ) -> Result<ProposedStage, StageError> {
        let mut legal: Vec<&StageSpec> = self
            .graph
            .legal_next(&from.name)
            .into_iter()
            .filter(|s| !self.executor.is_exhausted(state, &s.name))
            .collect();
        legal.sort_by_key(|s| self.graph.declaration_index(&s.name));

        match queue.pop_front() {
            Some(queued) if legal.iter().any(|s| s.name == queued.stage) => {
                debug!(from = %from.name, next = %queued.stage, "Taking queued plan entry");
                return Ok(queued);
            }
            Some(stale) => {
                debug!(from = %from.name, stale = %stale.stage, "Discarding queued plan");
                queue.clear();
            }
            None => {}
        }

        let snapshot = ContextSnapshot::capture(
            state,
            &from.name,
            &legal,
            self.selector.config().history_window,
        );
        let decision = self.selector.select_next(&legal, snapshot).await;
        trace.decisions.push(DecisionRecord {
            from_stage: from.name.clone(),
            decision: decision.clone(),
        });

        let mut proposals = decision.proposals.into_iter();
        match proposals.next() {
            Some(first) => {
                queue.extend(proposals);
                Ok(first)
            }
            None => Err(StageError::new(
                &from.name,
                ErrorKind::RunLimitExceeded,
                "no legal next stage remains",
            )),
        }
    }

    fn finish(
        &self,
        mut state: WorkflowState,
        mut trace: RunTrace,
        ending: Ending,
        user_id: Option<String>,
        started_at: DateTime<Utc>,
    ) -> RunReport {
        let (terminal_state, reason, error) = match ending {
            Ending::Completed => match trace.abandoned {
                Some(reason) => (EngineState::TerminalAbandoned, reason, None),
                None => (EngineState::TerminalSuccess, TerminalReason::Success, None),
            },
            Ending::Failed(error) => (
                EngineState::TerminalFatal,
                TerminalReason::from_error_kind(error.kind),
                Some(error),
            ),
        };

        trace.lifecycle.set_step(state.executions());
        let label = reason.to_string();
        let moved = if terminal_state == EngineState::TerminalFatal {
            trace.lifecycle.fail(&label)
        } else {
            trace.lifecycle.advance(terminal_state, Some(label.as_str()))
        };
        if let Err(e) = moved {
            error!(run_id = %state.run_id, from = %e.from, to = %e.to, "Could not record terminal transition");
        }

        let final_artifact = match ending_stage(&state, self.graph.final_stage(), &error) {
            Some(stage) => state.output(&stage).cloned(),
            None => None,
        };
        state.mark_terminal(error.clone());

        debug!(run_id = %state.run_id, lifecycle = %trace.lifecycle.summary(), "Engine transitions");
        match &error {
            None => info!(
                run_id = %state.run_id,
                terminal_state = %terminal_state,
                reason = %reason,
                executions = state.executions(),
                "Run finished"
            ),
            Some(e) => warn!(
                run_id = %state.run_id,
                terminal_state = %terminal_state,
                reason = %reason,
                executions = state.executions(),
                stage = %e.stage,
                error = %e.message,
                "Run stopped"
            ),
        }

        RunReport {
            run_id: state.run_id.clone(),
            user_id,
            terminal_state,
            terminal_reason: reason,
            message: match &error {
                Some(e) => format!("{}: {}", reason.describe(), e),
                None => reason.describe().to_string(),
            },
            final_artifact,
            total_executions: state.executions(),
            attempt_count: state.attempt_count.into_iter().collect(),
            execution_trace: state.history,
            transitions: trace.lifecycle.into_transitions(),
            revisions: trace.revisions,
            decisions: trace.decisions,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn load_profile(&self, user_id: &str) -> ProfileLoad {
        let Some(store) = self.profiles.as_ref() else {
            return ProfileLoad::Absent;
        };
        match store.get(user_id).await {
            Ok(Some(blob)) => ProfileLoad::Loaded(UserProfile::from_blob(&blob)),
            Ok(None) => ProfileLoad::Absent,
            Err(e) => {
                warn!(user_id, error = %e, "Profile load failed; starting without profile");
                ProfileLoad::Unreadable
            }
        }
    }

    async fn save_profile(&self, user_id: &str, profile: &mut UserProfile, report: &RunReport) {
        let Some(store) = self.profiles.as_ref() else {
            return;
        };
        let final_artifact = report.final_artifact.as_ref();
        profile.record_run(
            &report.run_id,
            report.terminal_reason,
            final_artifact.map(|a| a.content.as_str()),
            final_artifact.map(|a| a.summary()),
        );
        if let Err(e) = store.put(user_id, profile.to_blob()).await {
            warn!(user_id, error = %e, "Profile save failed");
        }
    }
}

fn cancelled(stage: &str) -> StageError {
    StageError::new(stage, ErrorKind::Cancelled, "run cancelled")
}

/// Stage whose output the report returns: the final stage when it produced
/// one, otherwise the latest stage that did.
fn ending_stage(state: &WorkflowState, final_stage: &str, error: &Option<StageError>) -> Option<String> {
    if error.is_none() && state.output(final_stage).is_some() {
        return Some(final_stage.to_string());
    }
    state.last_produced_stage().map(String::from)
}
