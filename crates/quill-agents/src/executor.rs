//! Stage execution: one stage, one collaborator call per attempt.
//!
//! ```text
//! execute_with_retry(stage)
//!   → guards: terminal run / run cap / stage budget / required inputs
//!   → generate (per-call timeout) → validate against output schema
//!   → record ExecutionRecord (every attempt, success or failure)
//!   → transient failure? back off (cancellable) and try again, up to the retry budget
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quill_coordination::{
    Artifact, ErrorKind, ExecutionRecord, RetryError, RetryPolicy, StageError, StageSpec,
    WorkflowState,
};

use crate::collaborators::{GenerationError, GenerationRequest, Generator};

/// Extra input for one stage run beyond what the state provides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageDirective {
    /// Targeted revision instruction (revise variant of the stage).
    pub revision: Option<String>,
    /// Arguments proposed by the action selector.
    pub arguments: Option<serde_json::Value>,
}

impl StageDirective {
    pub fn revise(instruction: impl Into<String>) -> Self {
        Self {
            revision: Some(instruction.into()),
            arguments: None,
        }
    }

    pub fn with_arguments(arguments: Option<serde_json::Value>) -> Self {
        Self {
            revision: None,
            arguments,
        }
    }

    pub fn is_revision(&self) -> bool {
        self.revision.is_some()
    }
}

/// Outcome of executing a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub success: bool,
    pub artifact: Option<Artifact>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<StageError>,
}

impl StageResult {
    fn ok(artifact: Artifact) -> Self {
        Self {
            success: true,
            artifact: Some(artifact),
            error_kind: None,
            error: None,
        }
    }

    fn failed(error: StageError) -> Self {
        Self {
            success: false,
            artifact: None,
            error_kind: Some(error.kind),
            error: Some(error),
        }
    }
}

/// Limits enforced by the executor.
#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    /// Timeout for each collaborator call.
    pub call_timeout: Duration,
    /// Executor invocations allowed per run, retries included.
    pub max_total_executions: usize,
    /// Artifacts a single stage may produce per run.
    pub max_stage_attempts: u32,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(120),
            max_total_executions: 32,
            max_stage_attempts: 3,
        }
    }
}

/// Runs named stages against the generation collaborator.
pub struct StageExecutor {
    generator: Arc<dyn Generator>,
    retry: RetryPolicy,
    limits: ExecutorLimits,
}

impl StageExecutor {
    pub fn new(generator: Arc<dyn Generator>, retry: RetryPolicy, limits: ExecutorLimits) -> Self {
        Self {
            generator,
            retry,
            limits,
        }
    }

    pub fn limits(&self) -> &ExecutorLimits {
        &self.limits
    }

    /// Whether `stage` has produced as many artifacts as it is allowed to.
    pub fn is_exhausted(&self, state: &WorkflowState, stage: &str) -> bool {
        state.attempts(stage) >= self.limits.max_stage_attempts
    }

    /// Single attempt with no directive.
    pub async fn execute(&self, stage: &StageSpec, state: &mut WorkflowState) -> StageResult {
        self.execute_attempt(stage, state, &StageDirective::default(), 1)
            .await
    }

    /// Execute `stage`, retrying transient failures per the retry policy.
    ///
    /// Transient failures that outlive the budget come back re-classified as
    /// [`ErrorKind::RetriesExhausted`]. Cancellation is observed before the
    /// first attempt and during backoff.
    pub async fn execute_with_retry(
        &self,
        stage: &StageSpec,
        state: &mut WorkflowState,
        directive: &StageDirective,
        cancel: &CancellationToken,
    ) -> StageResult {
        if cancel.is_cancelled() {
            return StageResult::failed(StageError::new(
                &stage.name,
                ErrorKind::Cancelled,
                "run cancelled before attempt",
            ));
        }

        let request = match self.prepare(stage, state, directive, 1) {
            Ok(request) => request,
            Err(error) => return StageResult::failed(error),
        };
        // Each retry is one more execution against the run cap.
        let budget = self
            .limits
            .max_total_executions
            .saturating_sub(state.executions());
        let attempt = request.attempt;
        let revision = directive.is_revision();

        let outcome = self
            .retry
            .run_observed(
                |retry| {
                    let request = &request;
                    async move {
                        if retry as usize > budget {
                            return Err(AttemptFailure::blocked(self.run_cap_error(&stage.name)));
                        }
                        self.call(stage, request, retry).await
                    }
                },
                |failure: &AttemptFailure| failure.error.is_transient(),
                |retry, failure, _| {
                    if let Some(elapsed) = failure.elapsed {
                        state.record(
                            ExecutionRecord::failure(attempt, retry, elapsed, &failure.error)
                                .with_revision(revision),
                        );
                    }
                },
                cancel,
            )
            .await;

        match outcome {
            Ok(produced) => StageResult::ok(self.commit(stage, state, directive, produced)),
            Err(RetryError::Fatal { error, .. }) => StageResult::failed(error.error),
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(stage = %stage.name, attempts, kind = %last.error.kind, "Retries exhausted");
                StageResult::failed(last.error.exhausted(attempts))
            }
            Err(RetryError::Cancelled { attempts, .. }) => StageResult::failed(StageError::new(
                &stage.name,
                ErrorKind::Cancelled,
                format!("run cancelled during backoff after {attempts} attempts"),
            )),
        }
    }

    /// One attempt with no retry: guards, one collaborator call, bookkeeping.
    pub async fn execute_attempt(
        &self,
        stage: &StageSpec,
        state: &mut WorkflowState,
        directive: &StageDirective,
        retry: u32,
    ) -> StageResult {
        let request = match self.prepare(stage, state, directive, retry) {
            Ok(request) => request,
            Err(error) => return StageResult::failed(error),
        };
        match self.call(stage, &request, retry).await {
            Ok(produced) => StageResult::ok(self.commit(stage, state, directive, produced)),
            Err(failure) => {
                if let Some(elapsed) = failure.elapsed {
                    state.record(
                        ExecutionRecord::failure(request.attempt, retry, elapsed, &failure.error)
                            .with_revision(directive.is_revision()),
                    );
                }
                StageResult::failed(failure.error)
            }
        }
    }

    /// Guards and request construction. A missing input is recorded as a
    /// failed execution; the other guards block without recording.
    fn prepare(
        &self,
        stage: &StageSpec,
        state: &mut WorkflowState,
        directive: &StageDirective,
        retry: u32,
    ) -> Result<GenerationRequest, StageError> {
        if state.terminal {
            return Err(StageError::new(
                &stage.name,
                ErrorKind::Precondition,
                "run already reached a terminal state",
            ));
        }
        if state.executions() >= self.limits.max_total_executions {
            return Err(self.run_cap_error(&stage.name));
        }
        if self.is_exhausted(state, &stage.name) {
            return Err(StageError::new(
                &stage.name,
                ErrorKind::RunLimitExceeded,
                format!(
                    "stage already produced {} artifacts",
                    self.limits.max_stage_attempts
                ),
            ));
        }

        let attempt = state.attempts(&stage.name) + 1;
        let missing = state.missing_keys(&stage.required_keys);
        if !missing.is_empty() {
            let error = StageError::precondition(&stage.name, &missing);
            warn!(stage = %stage.name, missing = ?missing, "Required inputs missing");
            state.record(
                ExecutionRecord::failure(attempt, retry, Duration::ZERO, &error)
                    .with_revision(directive.is_revision()),
            );
            return Err(error);
        }
        Ok(build_request(stage, state, directive, attempt))
    }

    fn run_cap_error(&self, stage: &str) -> StageError {
        StageError::new(
            stage,
            ErrorKind::RunLimitExceeded,
            format!(
                "run reached its limit of {} stage executions",
                self.limits.max_total_executions
            ),
        )
    }

    /// One timed collaborator call plus output validation. Touches no state.
    async fn call(
        &self,
        stage: &StageSpec,
        request: &GenerationRequest,
        retry: u32,
    ) -> Result<Produced, AttemptFailure> {
        debug!(
            stage = %stage.name,
            attempt = request.attempt,
            retry,
            revision = request.is_revision(),
            inputs = request.inputs.len(),
            "Invoking generation collaborator"
        );

        let started = Instant::now();
        let outcome =
            match tokio::time::timeout(self.limits.call_timeout, self.generator.generate(request))
                .await
            {
                Ok(Ok(raw)) => stage
                    .output_schema
                    .validate(&raw)
                    .map(|data| (raw, data))
                    .map_err(|msg| StageError::new(&stage.name, ErrorKind::MalformedOutput, msg)),
                Ok(Err(e)) => Err(generation_failure(&stage.name, e)),
                Err(_) => Err(generation_failure(
                    &stage.name,
                    GenerationError::Timeout(self.limits.call_timeout),
                )),
            };
        let elapsed = started.elapsed();

        match outcome {
            Ok((raw, data)) => Ok(Produced {
                raw,
                data,
                retry,
                elapsed,
            }),
            Err(error) => {
                warn!(
                    stage = %stage.name,
                    attempt = request.attempt,
                    retry,
                    kind = %error.kind,
                    "Stage attempt failed: {}",
                    error.message
                );
                Err(AttemptFailure {
                    error,
                    elapsed: Some(elapsed),
                })
            }
        }
    }

    /// Store a validated output as the stage's next artifact.
    fn commit(
        &self,
        stage: &StageSpec,
        state: &mut WorkflowState,
        directive: &StageDirective,
        produced: Produced,
    ) -> Artifact {
        let attempt = state.increment_attempt(&stage.name);
        let artifact = Artifact::new(&stage.name, produced.raw)
            .with_data(produced.data)
            .with_attempt(attempt);
        state.record(
            ExecutionRecord::success(&stage.name, attempt, produced.retry, produced.elapsed, &artifact)
                .with_revision(directive.is_revision()),
        );
        state.store_output(artifact.clone());
        info!(
            stage = %stage.name,
            attempt,
            retry = produced.retry,
            duration_ms = produced.elapsed.as_millis() as u64,
            "Stage produced artifact"
        );
        artifact
    }
}

/// Validated collaborator output, not yet stored.
struct Produced {
    raw: String,
    data: Option<serde_json::Value>,
    retry: u32,
    elapsed: Duration,
}

/// A failed attempt. `elapsed` is `None` when a guard blocked the call, in
/// which case nothing is recorded.
#[derive(Debug)]
struct AttemptFailure {
    error: StageError,
    elapsed: Option<Duration>,
}

impl AttemptFailure {
    fn blocked(error: StageError) -> Self {
        Self {
            error,
            elapsed: None,
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

fn generation_failure(stage: &str, error: GenerationError) -> StageError {
    StageError::new(stage, error.kind(), error.to_string())
}

/// Collect required and optional inputs; a revision also sees its own previous artifact.
fn build_request(
    stage: &StageSpec,
    state: &WorkflowState,
    directive: &StageDirective,
    attempt: u32,
) -> GenerationRequest {
    let mut request = GenerationRequest::new(&state.run_id, &stage.name);
    request.attempt = attempt;
    request.revision = directive.revision.clone();
    request.arguments = directive.arguments.clone();

    let mut keys: Vec<&String> = stage
        .required_keys
        .iter()
        .chain(stage.optional_keys.iter())
        .collect();
    if directive.is_revision() {
        keys.push(&stage.name);
    }
    for key in keys {
        if let Some(artifact) = state.output(key) {
            request.inputs.insert(key.clone(), artifact.content.clone());
        }
    }
    request
}
