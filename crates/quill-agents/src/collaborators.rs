//! Interfaces to the external collaborators the engine depends on.
//!
//! The engine never assumes anything about these beyond their signatures:
//! generation and reasoning output is validated by the engine itself, and
//! profile blobs are opaque.
//!
//! | Trait          | Called by                          | Failure handling          |
//! |----------------|------------------------------------|---------------------------|
//! | `Generator`    | `StageExecutor`                    | classified, retried       |
//! | `Reasoner`     | `ActionSelector`                   | corrected, then fallback  |
//! | `Evaluator`    | `RevisionController`               | classified, retried       |
//! | `ProfileStore` | `WorkflowEngine` (run start / end) | logged, never fatal       |

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use quill_coordination::{Artifact, ErrorKind, QualityAssessment, StageSpec, WorkflowState};

// ── Generation ───────────────────────────────────────────────────────────────

/// Input handed to the generation collaborator for one stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub run_id: String,
    /// Stage name; evaluation requests use `<stage>:review`.
    pub stage: String,
    /// State values the stage reads, keyed by state key.
    pub inputs: BTreeMap<String, String>,
    /// Targeted revision instruction; `Some` for the revise variant of a stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Arguments proposed by the action selector, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    /// Artifact attempt this request is producing (1-based).
    pub attempt: u32,
}

impl GenerationRequest {
    pub fn new(run_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage: stage.into(),
            inputs: BTreeMap::new(),
            revision: None,
            arguments: None,
            attempt: 1,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn is_revision(&self) -> bool {
        self.revision.is_some()
    }
}

/// Failure reported by the generation (or evaluation) collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("malformed output: {0}")]
    Malformed(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("permanent refusal: {0}")]
    Refused(String),

    #[error("request cannot be satisfied: {0}")]
    Unsatisfiable(String),
}

impl GenerationError {
    /// Map onto the engine's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Malformed(_) => ErrorKind::MalformedOutput,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Refused(_) => ErrorKind::PermanentRefusal,
            Self::Unsatisfiable(_) => ErrorKind::Unsatisfiable,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Text-generation backend: stage input in, raw text out.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

// ── Evaluation ───────────────────────────────────────────────────────────────

/// Scores an artifact of a quality-gated stage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        stage: &StageSpec,
        artifact: &Artifact,
    ) -> Result<QualityAssessment, GenerationError>;
}

// ── Reasoning ────────────────────────────────────────────────────────────────

/// One legal next stage as presented to the reasoning collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOption {
    pub name: String,
    pub summary: String,
    pub priority: u32,
}

/// One line of compact history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryLine {
    pub stage: String,
    pub attempt: u32,
    pub outcome: String,
    pub summary: String,
}

/// Compact, bounded view of a run handed to the reasoning collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub run_id: String,
    /// Stage whose successor is being chosen.
    pub current_stage: String,
    /// State keys available to the next stage.
    pub available_keys: Vec<String>,
    /// Most recent executions, oldest first.
    pub recent: Vec<HistoryLine>,
    pub quality_score: Option<f64>,
    pub options: Vec<StageOption>,
    /// Corrective instruction after a rejected answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
    /// JSON schema the answer must satisfy.
    pub schema: serde_json::Value,
}

impl ContextSnapshot {
    /// Capture the last `window` executions and the legal options.
    pub fn capture(
        state: &WorkflowState,
        current_stage: &str,
        legal: &[&StageSpec],
        window: usize,
    ) -> Self {
        let mut available_keys: Vec<String> = state.stage_outputs.keys().cloned().collect();
        available_keys.sort();

        let skip = state.history.len().saturating_sub(window);
        let recent = state
            .history
            .iter()
            .skip(skip)
            .map(|r| HistoryLine {
                stage: r.stage.clone(),
                attempt: r.attempt,
                outcome: serde_json::to_value(r.outcome)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default(),
                summary: r.summary.clone(),
            })
            .collect();

        Self {
            run_id: state.run_id.clone(),
            current_stage: current_stage.to_string(),
            available_keys,
            recent,
            quality_score: state.quality_score,
            options: legal
                .iter()
                .map(|s| StageOption {
                    name: s.name.clone(),
                    summary: s.summary.clone(),
                    priority: s.priority,
                })
                .collect(),
            correction: None,
            schema: quill_coordination::plan_schema(),
        }
    }
}

/// Failure reported by the reasoning collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReasoningError {
    #[error("reasoning call timed out after {0:?}")]
    Timeout(Duration),

    #[error("reasoning backend failed: {0}")]
    Backend(#[from] GenerationError),
}

/// Reasoning backend: snapshot and legal actions in, raw text out.
///
/// The text is expected to hold a `{"plan": [...]}` object, but nothing about
/// it is trusted until the action selector has validated it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn reason(
        &self,
        snapshot: &ContextSnapshot,
        legal_actions: &[String],
    ) -> Result<String, ReasoningError>;
}

// ── Profiles ─────────────────────────────────────────────────────────────────

/// Opaque per-user blob.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileBlob(pub serde_json::Value);

/// Failure reported by a profile store.
#[derive(Debug, Error)]
pub enum ProfileStoreError {
    #[error("profile I/O failed for '{user_id}': {source}")]
    Io {
        user_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("profile for '{user_id}' is corrupt: {message}")]
    Corrupt { user_id: String, message: String },

    #[error("invalid user id '{0}'")]
    InvalidUserId(String),
}

/// Key-value store of profile blobs keyed by user id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<ProfileBlob>, ProfileStoreError>;
    async fn put(&self, user_id: &str, blob: ProfileBlob) -> Result<(), ProfileStoreError>;
}
