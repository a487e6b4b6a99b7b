//! Per-run workflow state.
//!
//! A [`WorkflowState`] is created once per run and owned exclusively by the
//! engine driving that run. Nothing here is shared between runs.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorClass, ErrorKind, StageError};

/// Maximum characters kept in an execution record summary.
const SUMMARY_CHARS: usize = 160;

/// A stage output (or a seed input) stored in the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Stage that produced the artifact, or the seed key.
    pub stage: String,
    /// Full text as returned by the collaborator.
    pub content: String,
    /// Parsed payload for JSON-schema stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Attempt that produced this artifact (0 for seeds).
    pub attempt: u32,
    /// Quality score, once evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub produced_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(stage: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            content: content.into(),
            data: None,
            attempt: 0,
            score: None,
            produced_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Option<serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Compact one-line summary, bounded in size.
    pub fn summary(&self) -> String {
        summarize(&self.content, SUMMARY_CHARS)
    }
}

/// Collapse whitespace and truncate on a char boundary.
pub fn summarize(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

/// Outcome of one StageExecutor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    TransientFailure,
    FatalFailure,
}

/// One entry of the append-only execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub stage: String,
    /// Artifact attempt this execution was producing (1-based).
    pub attempt: u32,
    /// Retry index within the retry policy (1-based).
    pub retry: u32,
    pub outcome: ExecutionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Taxonomy class of `error_kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    pub duration_ms: u64,
    /// Artifact summary on success, error message on failure.
    pub summary: String,
    /// Whether a revision instruction was injected.
    #[serde(default)]
    pub revision: bool,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn success(stage: &str, attempt: u32, retry: u32, duration: Duration, artifact: &Artifact) -> Self {
        Self {
            stage: stage.to_string(),
            attempt,
            retry,
            outcome: ExecutionOutcome::Success,
            error_kind: None,
            error_class: None,
            duration_ms: duration.as_millis() as u64,
            summary: artifact.summary(),
            revision: false,
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(attempt: u32, retry: u32, duration: Duration, error: &StageError) -> Self {
        let outcome = if error.is_transient() {
            ExecutionOutcome::TransientFailure
        } else {
            ExecutionOutcome::FatalFailure
        };
        Self {
            stage: error.stage.clone(),
            attempt,
            retry,
            outcome,
            error_kind: Some(error.kind),
            error_class: Some(error.kind.class()),
            duration_ms: duration.as_millis() as u64,
            summary: summarize(&error.message, SUMMARY_CHARS),
            revision: false,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_revision(mut self, revision: bool) -> Self {
        self.revision = revision;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }
}

/// The single mutable aggregate passed through the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: String,
    /// Last artifact per stage name (seed inputs live here too).
    pub stage_outputs: HashMap<String, Artifact>,
    /// Artifacts successfully produced per stage.
    pub attempt_count: HashMap<String, u32>,
    /// Last computed quality score.
    pub quality_score: Option<f64>,
    /// Every score recorded per stage, in order.
    pub score_history: HashMap<String, Vec<f64>>,
    pub history: Vec<ExecutionRecord>,
    pub terminal: bool,
    pub error: Option<StageError>,
}

impl WorkflowState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage_outputs: HashMap::new(),
            attempt_count: HashMap::new(),
            quality_score: None,
            score_history: HashMap::new(),
            history: Vec::new(),
            terminal: false,
            error: None,
        }
    }

    /// Fresh state with a random run id.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Store seed inputs as attempt-0 artifacts.
    pub fn with_seed(mut self, seed: &BTreeMap<String, String>) -> Self {
        for (key, value) in seed {
            self.stage_outputs
                .insert(key.clone(), Artifact::new(key.clone(), value.clone()));
        }
        self
    }

    pub fn output(&self, key: &str) -> Option<&Artifact> {
        self.stage_outputs.get(key)
    }

    pub fn store_output(&mut self, artifact: Artifact) {
        self.stage_outputs.insert(artifact.stage.clone(), artifact);
    }

    /// Keys from `required` that are not present yet.
    pub fn missing_keys(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|k| !self.stage_outputs.contains_key(k.as_str()))
            .cloned()
            .collect()
    }

    pub fn attempts(&self, stage: &str) -> u32 {
        self.attempt_count.get(stage).copied().unwrap_or(0)
    }

    /// Bump the attempt counter and return the new value.
    pub fn increment_attempt(&mut self, stage: &str) -> u32 {
        let count = self.attempt_count.entry(stage.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Record a score as the current quality score for `stage`.
    pub fn record_score(&mut self, stage: &str, score: f64) {
        self.quality_score = Some(score);
        self.score_history
            .entry(stage.to_string())
            .or_default()
            .push(score);
    }

    pub fn scores(&self, stage: &str) -> &[f64] {
        self.score_history
            .get(stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The two most recent scores for `stage`, oldest first.
    pub fn last_two_scores(&self, stage: &str) -> Option<(f64, f64)> {
        match self.scores(stage) {
            [.., previous, last] => Some((*previous, *last)),
            _ => None,
        }
    }

    pub fn record(&mut self, record: ExecutionRecord) {
        self.history.push(record);
    }

    /// Number of StageExecutor invocations so far.
    pub fn executions(&self) -> usize {
        self.history.len()
    }

    /// Stage of the most recent successful execution.
    pub fn last_produced_stage(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|r| r.is_success())
            .map(|r| r.stage.as_str())
    }

    pub fn mark_terminal(&mut self, error: Option<StageError>) {
        self.terminal = true;
        if error.is_some() {
            self.error = error;
        }
    }
}
